//! Offset-preserving tokenization.
//!
//! Tokenization is a pluggable capability: the mention index and the
//! expression index both need the same token stream for a language, and
//! languages differ (whitespace, CJK, clitics). The engine only requires
//! that tokens carry character offsets into the original text so spans can
//! be mapped back.

/// A token with half-open character offsets into the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Lowercased token text.
    pub text: String,
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
}

/// Language-specific tokenizer. Implementations must be cheap to call per
/// utterance and safe for concurrent use.
pub trait Tokenizer: Send + Sync {
    /// Split `text` into lowercased tokens with character offsets.
    fn tokenize(&self, text: &str) -> Vec<Token>;
}

/// Default tokenizer: maximal runs of alphanumeric characters (plus `'`
/// within a word, so "don't" stays one token), lowercased.
///
/// Good enough for whitespace languages; swap in a language-specific
/// implementation for anything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTokenizer;

impl SimpleTokenizer {
    /// Create a new tokenizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric()
}

impl Tokenizer for SimpleTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let chars: Vec<char> = text.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            if !is_word_char(chars[i]) {
                i += 1;
                continue;
            }
            let start = i;
            let mut buf = String::new();
            while i < chars.len() {
                let c = chars[i];
                if is_word_char(c) {
                    buf.extend(c.to_lowercase());
                    i += 1;
                } else if c == '\'' && i + 1 < chars.len() && is_word_char(chars[i + 1]) && i > start
                {
                    buf.push('\'');
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token {
                text: buf,
                start,
                end: i,
            });
        }
        tokens
    }
}
