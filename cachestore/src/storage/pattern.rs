//! Redis-style glob patterns for in-process key matching.

use crate::error::{StoreError, StoreResult};
use regex::Regex;

/// Compiled glob pattern supporting `*`, `?`, `[...]` classes and `\` escapes.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Regex,
}

impl KeyPattern {
    pub fn compile(pattern: &str) -> StoreResult<Self> {
        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');

        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '\\' => match chars.next() {
                    Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                    None => re.push_str(r"\\"),
                },
                '[' => {
                    re.push('[');
                    if chars.peek() == Some(&'^') {
                        chars.next();
                        re.push('^');
                    }
                    let mut closed = false;
                    for class_char in chars.by_ref() {
                        if class_char == ']' {
                            closed = true;
                            break;
                        }
                        match class_char {
                            '\\' | '[' | '&' | '~' => {
                                re.push('\\');
                                re.push(class_char);
                            }
                            other => re.push(other),
                        }
                    }
                    if !closed {
                        return Err(StoreError::InvalidPattern {
                            pattern: pattern.to_string(),
                            reason: "unterminated character class".to_string(),
                        });
                    }
                    re.push(']');
                }
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { regex })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}
