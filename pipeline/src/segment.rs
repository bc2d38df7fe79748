//! Sentence segmentation for request text.
//!
//! Splits on terminal punctuation (`.`, `!`, `?`, `…`, `。`), keeping the
//! punctuation with its sentence. Trailing text without punctuation becomes
//! its own sentence; the quality gate decides whether it is complete.

use std::sync::LazyLock;

use regex::Regex;

/// A run of non-terminal characters followed by any terminal punctuation.
static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^.!?…。]+[.!?…。]*").expect("SENTENCE_RE regex should compile")
});

/// Split `text` into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| s.chars().any(|c| !c.is_whitespace() && !is_terminal(c)))
        .map(str::to_string)
        .collect()
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。')
}
