//! External text-processing collaborators. The core only ever sees these
//! trait objects; real tokenizers, morphology and wordform machinery live
//! outside. A plain whitespace tokenizer and two reference dictionaries are
//! provided so tests and embedders have a working default.

use unicode_segmentation::UnicodeSegmentation;

use crate::codec::wordlist::MAX_KEYWORD_BYTES;
use crate::core::types::WordId;

/// One token emitted by a tokenizer; in-field positions start at 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub position: u32,
}

/// Tokenizer mode requested when cloning (queries keep wildcard syntax)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeMode {
    Index,
    Query,
}

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, field: &str) -> Vec<Token>;

    fn clone_tokenizer(&self, mode: TokenizeMode) -> Box<dyn Tokenizer>;

    /// FNV hash over the tokenizer settings, used to reconcile
    /// `reconfigure` requests
    fn settings_hash(&self) -> u64;
}

pub trait Dictionary: Send + Sync {
    /// Hashed word id for crc-mode dictionaries
    fn word_id(&self, word: &[u8]) -> WordId;

    /// Case folding / normalization applied before indexing and lookup
    fn normalize(&self, word: &str) -> String;

    fn is_stopword(&self, word: &[u8]) -> bool;

    fn has_morphology(&self) -> bool;

    fn settings_hash(&self) -> u64;
}

pub trait FieldFilter: Send + Sync {
    fn apply(&self, field: &str, is_query: bool) -> String;

    fn clone_filter(&self) -> Box<dyn FieldFilter>;

    fn settings_hash(&self) -> u64;
}

/// Splits on Unicode word boundaries, numbering tokens from 1
#[derive(Debug, Clone, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, field: &str) -> Vec<Token> {
        field
            .unicode_words()
            .enumerate()
            .map(|(i, word)| {
                let mut text = word.to_string();
                // Oversize tokens are clamped, not dropped
                if text.len() > MAX_KEYWORD_BYTES {
                    let mut cut = MAX_KEYWORD_BYTES;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                Token {
                    text,
                    position: i as u32 + 1,
                }
            })
            .collect()
    }

    fn clone_tokenizer(&self, _mode: TokenizeMode) -> Box<dyn Tokenizer> {
        Box::new(self.clone())
    }

    fn settings_hash(&self) -> u64 {
        fnv1a(b"whitespace")
    }
}

/// Case-folding dictionary hashing words with FNV-1a (crc mode) while also
/// serving keywords mode, which only needs `normalize`
#[derive(Debug, Clone, Default)]
pub struct PlainDictionary {
    pub stopwords: Vec<String>,
}

impl Dictionary for PlainDictionary {
    fn word_id(&self, word: &[u8]) -> WordId {
        fnv1a(word)
    }

    fn normalize(&self, word: &str) -> String {
        word.to_lowercase()
    }

    fn is_stopword(&self, word: &[u8]) -> bool {
        self.stopwords.iter().any(|s| s.as_bytes() == word)
    }

    fn has_morphology(&self) -> bool {
        false
    }

    fn settings_hash(&self) -> u64 {
        let mut hash = fnv1a(b"plain");
        for word in &self.stopwords {
            hash ^= fnv1a(word.as_bytes());
        }
        hash
    }
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_tokenizer_positions() {
        let tokens = WhitespaceTokenizer.tokenize("hello brave new world");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "brave", "new", "world"]);
        assert_eq!(tokens[0].position, 1);
        assert_eq!(tokens[3].position, 4);
    }

    #[test]
    fn test_oversize_token_clamped() {
        let long = "x".repeat(500);
        let tokens = WhitespaceTokenizer.tokenize(&long);
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].text.len() <= MAX_KEYWORD_BYTES);
    }

    #[test]
    fn test_dictionary_normalize_and_stopwords() {
        let dict = PlainDictionary {
            stopwords: vec!["the".into()],
        };
        assert_eq!(dict.normalize("HeLLo"), "hello");
        assert!(dict.is_stopword(b"the"));
        assert!(!dict.is_stopword(b"hello"));
        assert_eq!(dict.word_id(b"hello"), dict.word_id(b"hello"));
        assert_ne!(dict.word_id(b"hello"), dict.word_id(b"world"));
    }
}
