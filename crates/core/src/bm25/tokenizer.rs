//! Text tokenizer with stop word removal and light suffix stemming.
//!
//! Splits text into runs of alphanumeric characters, `-` and `_`, folds case
//! unless the config is case-sensitive, drops short tokens and English stop
//! words, then optionally strips one suffix. Stemming only ever shortens a
//! token, so every token stays a byte span into one owned buffer.

use crate::bm25::Bm25Config;
use std::collections::HashSet;
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
        "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with", "this", "but",
        "they", "have",
    ]
    .into_iter()
    .collect()
});

/// Returns true for words dropped from documents and queries.
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word)
}

/// Strip a trailing "ing", else "ed", else a single "s" not part of "ss".
/// Words of three characters or fewer are left alone.
pub fn stem(word: &str) -> &str {
    if word.chars().count() <= 3 {
        return word;
    }
    if let Some(base) = word.strip_suffix("ing") {
        base
    } else if let Some(base) = word.strip_suffix("ed") {
        base
    } else if word.ends_with('s') && !word.ends_with("ss") {
        &word[..word.len() - 1]
    } else {
        word
    }
}

#[inline]
fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Tokenized text: owns the (possibly case-folded) buffer, provides &str slices via byte spans.
/// Only 1 heap allocation for the text instead of N per-token Strings.
#[derive(Debug)]
pub struct Tokens {
    buffer: String,
    spans: Vec<(u32, u32)>, // (start, end) byte offsets into buffer
}

impl Tokens {
    /// Returns an iterator over the token `&str` slices, in text order.
    /// A token's index in this sequence is its position.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.spans
            .iter()
            .map(|&(s, e)| &self.buffer[s as usize..e as usize])
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Tokenize `text` under `config`.
pub fn tokenize(text: &str, config: &Bm25Config) -> Tokens {
    let buffer = if config.case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    };
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    let push = |s: usize, e: usize, spans: &mut Vec<(u32, u32)>| {
        let token = &buffer[s..e];
        if token.chars().count() < config.min_term_length || is_stop_word(token) {
            return;
        }
        let kept = if config.use_stemming { stem(token) } else { token };
        spans.push((s as u32, (s + kept.len()) as u32));
    };

    for (i, c) in buffer.char_indices() {
        if is_token_char(c) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            push(s, i, &mut spans);
        }
    }
    // Handle last token (no trailing separator)
    if let Some(s) = start {
        push(s, buffer.len(), &mut spans);
    }

    Tokens { buffer, spans }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str, config: &Bm25Config) -> Vec<String> {
        tokenize(text, config).iter().map(str::to_string).collect()
    }

    #[test]
    fn test_tokenize() {
        let config = Bm25Config::default();
        let w = words("The quick brown fox jumps over the lazy dog", &config);
        assert!(!w.contains(&"the".to_string()));
        assert_eq!(w, vec!["quick", "brown", "fox", "jump", "over", "lazy", "dog"]);
    }

    #[test]
    fn test_joiners_and_short_tokens() {
        let config = Bm25Config::default();
        assert_eq!(words("state-of-the-art x_ray a b", &config), vec!["state-of-the-art", "x_ray"]);
    }

    #[test]
    fn test_stemming_rules() {
        assert_eq!(stem("rising"), "ris");
        assert_eq!(stem("jumped"), "jump");
        assert_eq!(stem("prices"), "price");
        assert_eq!(stem("glass"), "glass");
        assert_eq!(stem("bus"), "bus");
        assert_eq!(stem("sing"), "s");
    }

    #[test]
    fn test_stemming_off_and_case_sensitive() {
        let config = Bm25Config {
            use_stemming: false,
            case_sensitive: true,
            ..Default::default()
        };
        // "The" survives: stop words are lowercase.
        assert_eq!(words("The Prices rising", &config), vec!["The", "Prices", "rising"]);
    }

    #[test]
    fn test_unicode_folding() {
        let config = Bm25Config::default();
        assert_eq!(words("ÉCOLE Straße", &config), vec!["école", "straße"]);
    }
}
