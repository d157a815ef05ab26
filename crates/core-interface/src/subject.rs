//! Subject grammar shared by connectors and routes
//!
//! Subjects are dot-separated tokens. Patterns may use `*` to match exactly
//! one token and a trailing `>` to match one or more remaining tokens.

use crate::{ConnectorError, Result};

/// Check that a subject or subject pattern is well formed
pub fn validate_subject(subject: &str) -> Result<()> {
    let invalid = || ConnectorError::InvalidSubject(subject.to_string());

    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid());
        }

        // Wildcards must be whole tokens, and '>' only at the end
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(invalid());
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Match a concrete subject against a pattern
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut subject_parts = subject.split('.');

    loop {
        match (pattern_parts.next(), subject_parts.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
