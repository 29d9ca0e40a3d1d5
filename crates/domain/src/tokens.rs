//! Token estimation without a tokenizer dependency.
//!
//! A chars/4 heuristic with a word-count floor. Estimates are used for
//! budget decisions (when to summarize a tool observation, how to bound the
//! executive summary), never for billing, so being within ~20% is enough.

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    let by_chars = text.chars().count() / 4;
    let by_words = text.split_whitespace().count();
    by_chars.max(by_words)
}

/// Estimate the token count of a serialized JSON value.
pub fn estimate_value_tokens(value: &serde_json::Value) -> usize {
    match serde_json::to_string(value) {
        Ok(s) => estimate_tokens(&s),
        Err(_) => 0,
    }
}
