//! Pre-flight script validation
//!
//! Runs synchronously before a request touches the queue or any backend:
//! length ceiling first, then a blocklist of dangerous syntactic patterns,
//! then a light syntax sanity check. A rejection here has zero side effects.
//!
//! Pattern matching on source text is inherently incomplete and bypassable;
//! this layer exists to cheaply reject the obvious cases in front of the real
//! isolation in the backends, and must never be treated as the security
//! boundary itself.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{EngineConfig, ValidatorConfig};
use crate::errors::EngineError;

/// Built-in blocklist: dynamic code evaluation, process/host control,
/// prototype tampering, filesystem/network primitives, worker spawning.
static BLOCKED_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\beval\s*\(", "dynamic code evaluation (eval)"),
        (r"\bFunction\s*\(", "dynamic code evaluation (Function)"),
        (r"new\s+Function\b", "dynamic code evaluation (new Function)"),
        (r"\bimport\s*\(", "dynamic module import"),
        (r"\brequire\s*\(\s*[^'\x22]", "dynamic require"),
        (r"\bprocess\s*\.", "process/host control"),
        (r"child_process", "child process access"),
        (r"\bDeno\s*\.", "host runtime access"),
        (r"\b__proto__\b", "prototype tampering"),
        (r"Object\s*\.\s*setPrototypeOf", "prototype tampering"),
        (r"Reflect\s*\.\s*setPrototypeOf", "prototype tampering"),
        (r"\.\s*constructor\s*\(", "constructor invocation"),
        (r"\bXMLHttpRequest\b", "network primitive"),
        (r"\bWebSocket\b", "network primitive"),
        (r"new\s+Worker\b", "worker spawning"),
    ]
    .iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("built-in pattern"), *label))
    .collect()
});

/// Validate a script against the configured ceilings and blocklist.
pub fn validate(code: &str, config: &EngineConfig) -> Result<(), EngineError> {
    if code.len() > config.max_code_len {
        return Err(EngineError::Validation(format!(
            "code length {} exceeds maximum of {} bytes",
            code.len(),
            config.max_code_len
        )));
    }

    for (pattern, label) in BLOCKED_PATTERNS.iter() {
        if pattern.is_match(code) {
            return Err(EngineError::Validation(format!(
                "disallowed pattern: {}",
                label
            )));
        }
    }
    for raw in extra_patterns(&config.validator) {
        if raw.is_match(code) {
            return Err(EngineError::Validation(format!(
                "disallowed pattern: {}",
                raw.as_str()
            )));
        }
    }

    check_syntax(code)
}

fn extra_patterns(config: &ValidatorConfig) -> Vec<Regex> {
    config
        .extra_blocked_patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("ignoring invalid blocked pattern {:?}: {}", p, e);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Normal,
    LineComment,
    BlockComment,
    Str(char),
    Template,
}

/// String/comment-aware bracket balance scan.
///
/// This is a sanity check, not a parser: it catches unbalanced delimiters and
/// unterminated strings/comments, which covers the common paste truncation and
/// obviously broken submissions. Anything subtler is left to V8, which reports
/// a syntax error at execution time through the same failure path.
fn check_syntax(code: &str) -> Result<(), EngineError> {
    let mut stack: Vec<char> = Vec::new();
    // Template literals nest via `${ ... }`; remember where each one began.
    let mut template_depths: Vec<usize> = Vec::new();
    let mut mode = Mode::Normal;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        match mode {
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Normal;
                }
            }
            Mode::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Normal;
                }
            }
            Mode::Str(quote) => match c {
                '\\' => {
                    chars.next();
                }
                '\n' => {
                    return Err(EngineError::Validation(
                        "syntax error: unterminated string literal".to_string(),
                    ))
                }
                _ if c == quote => mode = Mode::Normal,
                _ => {}
            },
            Mode::Template => match c {
                '\\' => {
                    chars.next();
                }
                '`' => mode = Mode::Normal,
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    template_depths.push(stack.len());
                    stack.push('{');
                    mode = Mode::Normal;
                }
                _ => {}
            },
            Mode::Normal => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    mode = Mode::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = Mode::BlockComment;
                }
                '\'' | '"' => mode = Mode::Str(c),
                '`' => mode = Mode::Template,
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some(open) if open == expected => {
                            // Closing the brace of a `${` re-enters the template.
                            if c == '}' && template_depths.last() == Some(&stack.len()) {
                                template_depths.pop();
                                mode = Mode::Template;
                            }
                        }
                        _ => {
                            return Err(EngineError::Validation(format!(
                                "syntax error: unbalanced '{}'",
                                c
                            )))
                        }
                    }
                }
                _ => {}
            },
        }
    }

    match mode {
        Mode::Str(_) => Err(EngineError::Validation(
            "syntax error: unterminated string literal".to_string(),
        )),
        Mode::Template => Err(EngineError::Validation(
            "syntax error: unterminated template literal".to_string(),
        )),
        Mode::BlockComment => Err(EngineError::Validation(
            "syntax error: unterminated block comment".to_string(),
        )),
        _ if !stack.is_empty() => Err(EngineError::Validation(format!(
            "syntax error: unclosed '{}'",
            stack[stack.len() - 1]
        ))),
        _ => Ok(()),
    }
}
