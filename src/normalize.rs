//! # Normalization Module
//!
//! The one place where names and keys are normalized. Key equality, duplicate
//! alias detection and variant-cache lookups all go through [`normalize_key`];
//! similarity scoring goes through [`normalize_for_similarity`].

/// Normalize a value for key equality: trim, uppercase, collapse internal whitespace.
pub fn normalize_key(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars() {
            out.extend(ch.to_uppercase());
        }
    }
    out
}

/// Normalize a name for similarity scoring.
///
/// Everything that is not alphanumeric (other than `&`) becomes a separator,
/// then the result is uppercased with whitespace collapsed.
pub fn normalize_for_similarity(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '&' {
                ch
            } else {
                ' '
            }
        })
        .collect();
    normalize_key(&cleaned)
}

/// Distinct tokens of a similarity-normalized name whose length is at least `min_len`.
///
/// Order of first appearance is preserved.
pub fn significant_tokens(value: &str, min_len: usize) -> Vec<String> {
    let normalized = normalize_for_similarity(value);
    let mut tokens: Vec<String> = Vec::new();
    for token in normalized.split(' ') {
        if token.chars().count() < min_len {
            continue;
        }
        if !tokens.iter().any(|seen| seen == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}
