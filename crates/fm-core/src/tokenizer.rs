use regex::Regex;
use std::sync::LazyLock;

use crate::constants::SUMMARY_CHARS;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Tokenize text into lowercase words.
/// Preserves apostrophes within words (e.g., "don't").
/// No stemming, no stop-word removal.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    cleaned
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Split text into sentences at sentence-ending punctuation followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;

    for m in SENTENCE_END.find_iter(text) {
        let sentence = text[last..m.start() + 1].trim().to_string(); // include the punctuation
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        last = m.end();
    }

    let remainder = text[last..].trim().to_string();
    if !remainder.is_empty() {
        sentences.push(remainder);
    }

    sentences
}

/// Split text into lossless segments: each word together with the whitespace
/// that follows it. Leading whitespace forms its own segment.
/// `segments(t).concat() == t` for every input.
pub fn segments(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_space = text.chars().next().is_some_and(char::is_whitespace);

    for (i, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if in_space && !ws {
            if i > start {
                out.push(&text[start..i]);
            }
            start = i;
        }
        in_space = ws;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Collapse whitespace runs to single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned()
}

/// First sentence, cut at `SUMMARY_CHARS` on a char boundary.
pub fn summarize(text: &str) -> String {
    let first = split_sentences(text).into_iter().next().unwrap_or_default();
    truncate_chars(&normalize_whitespace(&first), SUMMARY_CHARS)
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokenize() {
        assert_eq!(tokenize("Hello, world!"), vec!["hello", "world"]);
    }

    #[test]
    fn test_apostrophe_preserved() {
        assert_eq!(tokenize("Don't stop!"), vec!["don't", "stop"]);
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \t\n  ").is_empty());
    }

    #[test]
    fn test_sentence_splitting() {
        let sentences = split_sentences("First. Second! Third? Fourth.");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "First.");
    }

    #[test]
    fn test_segments_are_lossless() {
        for text in [
            "",
            "one",
            "  leading space",
            "trailing  \n",
            "tabs\tand\nnewlines  mixed ",
            "ünïcödé wörds  here",
        ] {
            assert_eq!(segments(text).concat(), text, "segments lost bytes of {text:?}");
        }
    }

    #[test]
    fn test_segments_split_on_words() {
        assert_eq!(segments("a bb  c"), vec!["a ", "bb  ", "c"]);
        assert_eq!(segments("  a"), vec!["  ", "a"]);
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a \n\t b  "), "a b");
    }

    #[test]
    fn test_summarize_first_sentence() {
        assert_eq!(summarize("The cat sat. The dog ran."), "The cat sat.");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let s = truncate_chars("ééééé", 2);
        assert_eq!(s, "éé…");
    }
}
