//! Command-line tokenizing and stage partitioning.
//!
//! Tokens are whitespace separated with no quoting.  A chain is split into
//! stages at every occurrence of the delimiter token.

use crate::error::{EngineError, Result};

/// The default stage delimiter.
pub const PIPE_TOKEN: &str = "|";

/// Split a command line on ASCII whitespace.
pub fn tokenize(line: &str) -> Vec<String> {
    line.split_ascii_whitespace().map(String::from).collect()
}

/// Count how many delimiter tokens a sequence holds.
pub fn count_delimiters(tokens: &[String], delimiter: &str) -> usize {
    tokens.iter().filter(|t| t.as_str() == delimiter).count()
}

/// Partition `tokens` into contiguous stage slices at each `delimiter`.
///
/// Returns `count_delimiters + 1` non-empty slices, or a validation error if
/// the sequence is empty or a delimiter is first, last, or doubled.
pub fn split_stages<'a>(tokens: &'a [String], delimiter: &str) -> Result<Vec<&'a [String]>> {
    if tokens.is_empty() {
        return Err(EngineError::EmptyPipeline);
    }

    let mut stages = Vec::with_capacity(count_delimiters(tokens, delimiter) + 1);
    let mut start = 0;
    for (pos, token) in tokens.iter().enumerate() {
        if token != delimiter {
            continue;
        }
        if pos == start {
            let reason = if pos == 0 {
                "pipe at start of command line"
            } else {
                "consecutive pipes"
            };
            return Err(EngineError::Topology {
                position: pos,
                reason,
            });
        }
        stages.push(&tokens[start..pos]);
        start = pos + 1;
    }

    if start == tokens.len() {
        return Err(EngineError::Topology {
            position: tokens.len() - 1,
            reason: "pipe at end of command line",
        });
    }
    stages.push(&tokens[start..]);
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(line: &str) -> Vec<String> {
        tokenize(line)
    }

    #[test]
    fn test_tokenize_collapses_whitespace() {
        assert_eq!(toks("  ls\t-l   | wc\n"), vec!["ls", "-l", "|", "wc"]);
        assert!(toks("   ").is_empty());
    }

    #[test]
    fn test_single_stage() {
        let t = toks("cat file.txt");
        let stages = split_stages(&t, PIPE_TOKEN).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0], &t[..]);
    }

    #[test]
    fn test_three_stages() {
        let t = toks("cat f | sort -r | uniq");
        let stages = split_stages(&t, PIPE_TOKEN).unwrap();
        assert_eq!(stages.len(), count_delimiters(&t, PIPE_TOKEN) + 1);
        assert_eq!(stages[0], ["cat", "f"]);
        assert_eq!(stages[1], ["sort", "-r"]);
        assert_eq!(stages[2], ["uniq"]);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            split_stages(&[], PIPE_TOKEN),
            Err(EngineError::EmptyPipeline)
        ));
    }

    #[test]
    fn test_rejects_leading_pipe() {
        let t = toks("| wc");
        assert!(matches!(
            split_stages(&t, PIPE_TOKEN),
            Err(EngineError::Topology { position: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_trailing_pipe() {
        let t = toks("ls |");
        assert!(matches!(
            split_stages(&t, PIPE_TOKEN),
            Err(EngineError::Topology { position: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_doubled_pipe() {
        let t = toks("ls | | wc");
        match split_stages(&t, PIPE_TOKEN) {
            Err(EngineError::Topology { position, reason }) => {
                assert_eq!(position, 2);
                assert_eq!(reason, "consecutive pipes");
            }
            other => panic!("expected topology error, got {:?}", other),
        }
    }

    #[test]
    fn test_lone_pipe_is_leading() {
        let t = toks("|");
        assert!(matches!(
            split_stages(&t, PIPE_TOKEN),
            Err(EngineError::Topology { position: 0, .. })
        ));
    }

    #[test]
    fn test_custom_delimiter() {
        let t = toks("a | b :: c");
        let stages = split_stages(&t, "::").unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0], ["a", "|", "b"]);
    }
}
