//! Subject helpers: validation, wildcard matching and interest overlap.
//!
//! Subjects are `.`-separated tokens. A pattern may use `*` to match exactly
//! one token and a trailing `>` to match one or more remaining tokens.

/// Matches exactly one token.
pub const SINGLE_WILDCARD: &str = "*";

/// Matches one or more trailing tokens.
pub const FULL_WILDCARD: &str = ">";

/// Check that `subject` is well formed.
///
/// With `allow_wildcards` false the subject must be a literal publish subject.
pub fn is_valid(subject: &str, allow_wildcards: bool) -> bool {
    if subject.is_empty() {
        return false;
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;

    tokens.iter().enumerate().all(|(index, token)| {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return false;
        }
        match *token {
            SINGLE_WILDCARD => allow_wildcards,
            FULL_WILDCARD => allow_wildcards && index == last,
            literal => !literal.contains('*') && !literal.contains('>'),
        }
    })
}

/// Whether the pattern contains a wildcard token.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern
        .split('.')
        .any(|token| token == SINGLE_WILDCARD || token == FULL_WILDCARD)
}

/// Whether a literal `subject` is matched by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some literal subject is matched by both patterns.
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        match (left.next(), right.next()) {
            (Some(FULL_WILDCARD), Some(_)) | (Some(_), Some(FULL_WILDCARD)) => return true,
            (Some(l), Some(r)) if l == SINGLE_WILDCARD || r == SINGLE_WILDCARD || l == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether every subject matched by `filter` is also matched by `pattern`.
pub fn is_subset(filter: &str, pattern: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut pattern_tokens = pattern.split('.');

    loop {
        match (filter_tokens.next(), pattern_tokens.next()) {
            (Some(_), Some(FULL_WILDCARD)) => return true,
            (Some(FULL_WILDCARD), Some(_)) => return false,
            (Some(_), Some(SINGLE_WILDCARD)) => {}
            (Some(SINGLE_WILDCARD), Some(_)) => return false,
            (Some(f), Some(p)) if f == p => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
