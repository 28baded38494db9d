use thiserror::Error;

use crate::cluster::planner::ClusterRequest;

/// Errors raised while parsing a cluster request document
#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("JSON parse error: {0}")]
    ParseError(String),
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content.
/// This is a pure function - no I/O.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if c == '\\' && in_string {
            result.push(c);
            escape_next = true;
            continue;
        }

        if c == '"' {
            in_string = !in_string;
            result.push(c);
            continue;
        }

        if !in_string && c == '/' {
            match chars.peek() {
                Some('/') => {
                    chars.next();
                    for nc in chars.by_ref() {
                        if nc == '\n' {
                            result.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for nc in chars.by_ref() {
                        if prev == '*' && nc == '/' {
                            break;
                        }
                        prev = nc;
                    }
                    continue;
                }
                _ => {}
            }
        }

        result.push(c);
    }

    result
}

/// Parse a JSONC cluster request as exported by the dashboard's cluster form
pub fn parse_cluster_request(content: &str) -> Result<ClusterRequest, RequestError> {
    let stripped = strip_jsonc_comments(content);
    serde_json::from_str(&stripped).map_err(|e| RequestError::ParseError(e.to_string()))
}
