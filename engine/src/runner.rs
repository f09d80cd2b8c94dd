//! Running one chain stage.
//!
//! A [`CommandRunner`] is invoked inside the stage's child after pipe
//! redirection is in place, and its return value becomes the child's exit
//! status.  [`ExecRunner`] is the default: it applies the stage's own `<`,
//! `>` and `>>` redirections (which override the pipe for that stream) and
//! replaces the child with the named program.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    os::fd::{AsRawFd, RawFd},
};

use nix::{errno::Errno, unistd};

use crate::{
    error::{EngineError, Result},
    spawn::child_diag,
};

/// Status when the program could not be found.
pub const NOT_FOUND_STATUS: i32 = 127;
/// Status when the program was found but could not be executed.
pub const EXEC_FAILED_STATUS: i32 = 126;
/// Status when a stage's own redirection could not be applied.
pub const REDIRECT_FAILED_STATUS: i32 = 1;
/// Status when a stage's tokens do not form a command.
pub const USAGE_STATUS: i32 = 2;

/// Executes one stage's tokens in an already-redirected child process.
pub trait CommandRunner: Sync {
    /// Run `tokens` and return the exit status.  May not return at all if
    /// the process image is replaced.
    fn run(&self, tokens: &[String]) -> i32;
}

impl<F> CommandRunner for F
where
    F: Fn(&[String]) -> i32 + Sync,
{
    fn run(&self, tokens: &[String]) -> i32 {
        self(tokens)
    }
}

/// Redirection operator recognized inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// `< file`
    Input,
    /// `> file`
    Output,
    /// `>> file`
    Append,
}

impl RedirectOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "<" => Some(RedirectOp::Input),
            ">" => Some(RedirectOp::Output),
            ">>" => Some(RedirectOp::Append),
            _ => None,
        }
    }

    fn target_fd(self) -> RawFd {
        match self {
            RedirectOp::Input => 0,
            RedirectOp::Output | RedirectOp::Append => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub op: RedirectOp,
    pub path: String,
}

/// One stage split into program arguments and file redirections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCommand {
    pub argv: Vec<String>,
    pub redirects: Vec<Redirect>,
}

/// Separate redirection operators (and their targets) from the argv.
pub fn parse_command(tokens: &[String]) -> Result<ParsedCommand> {
    let mut cmd = ParsedCommand::default();
    let mut iter = tokens.iter();
    while let Some(tok) = iter.next() {
        match RedirectOp::parse(tok) {
            Some(op) => {
                let path = iter.next().ok_or_else(|| {
                    EngineError::Syntax(format!("{}: missing file name", tok))
                })?;
                cmd.redirects.push(Redirect {
                    op,
                    path: path.clone(),
                });
            }
            None => cmd.argv.push(tok.clone()),
        }
    }
    if cmd.argv.is_empty() {
        return Err(EngineError::Syntax(String::from("no command in stage")));
    }
    Ok(cmd)
}

/// Apply a stage's redirections to this process's stdin/stdout, in order.
pub fn apply_redirects(redirects: &[Redirect]) -> io::Result<()> {
    for redir in redirects {
        let file = open_target(redir)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", redir.path, e)))?;
        unistd::dup2(file.as_raw_fd(), redir.op.target_fd()).map_err(io::Error::from)?;
    }
    Ok(())
}

fn open_target(redir: &Redirect) -> io::Result<File> {
    match redir.op {
        RedirectOp::Input => File::open(&redir.path),
        RedirectOp::Output => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&redir.path),
        RedirectOp::Append => OpenOptions::new()
            .append(true)
            .create(true)
            .open(&redir.path),
    }
}

/// Default runner: stage-level redirection, then `execvp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecRunner;

impl CommandRunner for ExecRunner {
    fn run(&self, tokens: &[String]) -> i32 {
        let cmd = match parse_command(tokens) {
            Ok(cmd) => cmd,
            Err(err) => {
                child_diag(format_args!("{}", err));
                return USAGE_STATUS;
            }
        };
        if let Err(err) = apply_redirects(&cmd.redirects) {
            child_diag(format_args!("{}", err));
            return REDIRECT_FAILED_STATUS;
        }
        exec(&cmd.argv)
    }
}

/// Replace the process with `argv[0]`, searched on `PATH`.  Only returns on
/// failure, with the status a shell would report.
fn exec(argv: &[String]) -> i32 {
    let args = match argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<core::result::Result<Vec<_>, _>>()
    {
        Ok(args) => args,
        Err(_) => {
            child_diag(format_args!("{}: argument contains a NUL byte", argv[0]));
            return USAGE_STATUS;
        }
    };

    let errno = match unistd::execvp(&args[0], &args) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    child_diag(format_args!("{}: {}", argv[0], errno.desc()));
    match errno {
        Errno::ENOENT | Errno::ENOTDIR => NOT_FOUND_STATUS,
        _ => EXEC_FAILED_STATUS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::tokenize;

    #[test]
    fn test_plain_command() {
        let cmd = parse_command(&tokenize("ls -l /tmp")).unwrap();
        assert_eq!(cmd.argv, vec!["ls", "-l", "/tmp"]);
        assert!(cmd.redirects.is_empty());
    }

    #[test]
    fn test_redirections_are_split_out() {
        let cmd = parse_command(&tokenize("sort < in.txt -r >> out.txt")).unwrap();
        assert_eq!(cmd.argv, vec!["sort", "-r"]);
        assert_eq!(
            cmd.redirects,
            vec![
                Redirect {
                    op: RedirectOp::Input,
                    path: String::from("in.txt")
                },
                Redirect {
                    op: RedirectOp::Append,
                    path: String::from("out.txt")
                },
            ]
        );
    }

    #[test]
    fn test_missing_target() {
        let err = parse_command(&tokenize("echo hi >")).unwrap_err();
        assert!(matches!(err, EngineError::Syntax(_)));
    }

    #[test]
    fn test_redirect_only_has_no_command() {
        assert!(parse_command(&tokenize("> out.txt")).is_err());
    }

    #[test]
    fn test_closure_runner() {
        let runner = |tokens: &[String]| tokens.len() as i32;
        assert_eq!(runner.run(&tokenize("a b c")), 3);
    }
}
