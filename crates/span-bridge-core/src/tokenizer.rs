//! Word-level tokenizer with character offset maps
//!
//! The parity fixtures need, for every text token, its character start/end
//! offsets in the original text so predicted spans can be resolved back to
//! substrings. Vocabulary lookup is NFC-normalized; offsets always refer to
//! the raw input text.

use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

/// Special tokens used by the tokenizer
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    pub cls_token: String,
    pub sep_token: String,
    pub unk_token: String,
    pub pad_token: String,

    pub cls_token_id: u32,
    pub sep_token_id: u32,
    pub unk_token_id: u32,
    pub pad_token_id: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            cls_token: "[CLS]".to_string(),
            sep_token: "[SEP]".to_string(),
            unk_token: "[UNK]".to_string(),
            pad_token: "[PAD]".to_string(),
            cls_token_id: 1,
            sep_token_id: 2,
            unk_token_id: 0,
            pad_token_id: 3,
        }
    }
}

/// Tokenization output for one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    /// Token ids including [CLS]/[SEP]
    pub input_ids: Vec<u32>,
    /// 1 for every real token (no padding is emitted)
    pub attention_mask: Vec<u32>,
    /// Token strings including specials, aligned with `input_ids`
    pub tokens: Vec<String>,
    /// Text tokens only (specials stripped)
    pub text_tokens: Vec<String>,
    /// Per text token: byte offset of its first character
    pub start_map: Vec<usize>,
    /// Per text token: byte offset one past its last character
    pub end_map: Vec<usize>,
}

impl Encoding {
    /// Number of text tokens (the span-scoring sequence length).
    pub fn text_len(&self) -> usize {
        self.text_tokens.len()
    }

    /// Total token count including specials.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Word-level tokenizer with a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    reverse_vocab: HashMap<u32, String>,
    special_tokens: SpecialTokens,
    lowercase: bool,
}

impl WordTokenizer {
    pub fn new(vocab: HashMap<String, u32>, special_tokens: SpecialTokens) -> Self {
        let reverse_vocab: HashMap<u32, String> =
            vocab.iter().map(|(k, &v)| (v, k.clone())).collect();
        Self { vocab, reverse_vocab, special_tokens, lowercase: true }
    }

    /// Build a tokenizer from a word list; ids are assigned after the special
    /// tokens in the given order, so construction is deterministic.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let special_tokens = SpecialTokens::default();
        let mut vocab = HashMap::new();
        let mut next_id = 4u32; // ids 0..=3 are reserved for specials
        for word in words {
            let word = word.as_ref().to_lowercase();
            vocab.entry(word).or_insert_with(|| {
                let id = next_id;
                next_id += 1;
                id
            });
        }
        Self::new(vocab, special_tokens)
    }

    pub fn set_lowercase(&mut self, lowercase: bool) {
        self.lowercase = lowercase;
    }

    pub fn vocab_size(&self) -> usize {
        // Specials live outside the word vocabulary
        self.vocab.len() + 4
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.reverse_vocab.get(&id).map(|s| s.as_str())
    }

    /// Tokenize one text: whitespace word split with byte offsets, vocab
    /// lookup on the NFC-normalized lowercased word, [CLS]/[SEP] framing.
    ///
    /// `max_len` bounds the total token count including the two specials.
    pub fn encode(&self, text: &str, max_len: usize) -> Encoding {
        let special = &self.special_tokens;
        let max_words = max_len.saturating_sub(2);

        let mut input_ids = vec![special.cls_token_id];
        let mut tokens = vec![special.cls_token.clone()];
        let mut text_tokens = Vec::new();
        let mut start_map = Vec::new();
        let mut end_map = Vec::new();

        for (start, word) in split_words(text) {
            if text_tokens.len() >= max_words {
                break;
            }
            let end = start + word.len();
            let normalized: String = word.nfc().collect();
            let lookup = if self.lowercase { normalized.to_lowercase() } else { normalized };
            let id = self.vocab.get(&lookup).copied().unwrap_or(special.unk_token_id);

            input_ids.push(id);
            tokens.push(word.to_string());
            text_tokens.push(word.to_string());
            start_map.push(start);
            end_map.push(end);
        }

        input_ids.push(special.sep_token_id);
        tokens.push(special.sep_token.clone());
        let attention_mask = vec![1; input_ids.len()];

        Encoding { input_ids, attention_mask, tokens, text_tokens, start_map, end_map }
    }

    /// Dump the vocabulary and special tokens as JSON, for the best-effort
    /// tokenizer export next to the model artifacts.
    pub fn save_vocab(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct VocabFile<'a> {
            vocab: std::collections::BTreeMap<&'a str, u32>,
            cls_token: &'a str,
            sep_token: &'a str,
            unk_token: &'a str,
            pad_token: &'a str,
            cls_token_id: u32,
            sep_token_id: u32,
            unk_token_id: u32,
            pad_token_id: u32,
        }

        let file = VocabFile {
            vocab: self.vocab.iter().map(|(k, &v)| (k.as_str(), v)).collect(),
            cls_token: &self.special_tokens.cls_token,
            sep_token: &self.special_tokens.sep_token,
            unk_token: &self.special_tokens.unk_token,
            pad_token: &self.special_tokens.pad_token,
            cls_token_id: self.special_tokens.cls_token_id,
            sep_token_id: self.special_tokens.sep_token_id,
            unk_token_id: self.special_tokens.unk_token_id,
            pad_token_id: self.special_tokens.pad_token_id,
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).map_err(Error::from)
    }
}

/// Whitespace word split yielding (byte_offset, word) pairs.
fn split_words(text: &str) -> SplitWords<'_> {
    SplitWords { text, pos: 0 }
}

struct SplitWords<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Iterator for SplitWords<'a> {
    type Item = (usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.text[self.pos..];
        let skip = rest.char_indices().find(|(_, c)| !c.is_whitespace())?;
        let start = self.pos + skip.0;
        let tail = &self.text[start..];
        let len = tail
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        self.pos = start + len;
        Some((start, &self.text[start..start + len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tokenizer() -> WordTokenizer {
        WordTokenizer::from_words(["john", "smith", "works", "at", "apple", "inc."])
    }

    #[test]
    fn test_encode_frames_with_specials() {
        let tokenizer = create_test_tokenizer();
        let enc = tokenizer.encode("John Smith", 512);

        assert_eq!(enc.input_ids.first(), Some(&1)); // [CLS]
        assert_eq!(enc.input_ids.last(), Some(&2)); // [SEP]
        assert_eq!(enc.text_len(), 2);
        assert_eq!(enc.attention_mask, vec![1; 4]);
    }

    #[test]
    fn test_offset_maps_recover_words() {
        let tokenizer = create_test_tokenizer();
        let text = "John Smith works at Apple Inc.";
        let enc = tokenizer.encode(text, 512);

        assert_eq!(enc.start_map.len(), enc.text_len());
        for (i, token) in enc.text_tokens.iter().enumerate() {
            assert_eq!(&text[enc.start_map[i]..enc.end_map[i]], token);
        }
    }

    #[test]
    fn test_unknown_word_maps_to_unk() {
        let tokenizer = create_test_tokenizer();
        let enc = tokenizer.encode("John quux", 512);
        assert_eq!(enc.input_ids[2], tokenizer.special_tokens().unk_token_id);
        // The raw token string is preserved even when the id is unk
        assert_eq!(enc.text_tokens[1], "quux");
    }

    #[test]
    fn test_truncation_respects_max_len() {
        let tokenizer = create_test_tokenizer();
        let enc = tokenizer.encode("john smith works at apple", 4);
        // [CLS] + 2 words + [SEP]
        assert_eq!(enc.input_ids.len(), 4);
        assert_eq!(enc.text_len(), 2);
    }

    #[test]
    fn test_deterministic_ids() {
        let a = create_test_tokenizer();
        let b = create_test_tokenizer();
        assert_eq!(a.encode("john smith", 512).input_ids, b.encode("john smith", 512).input_ids);
    }

    #[test]
    fn test_multibyte_offsets() {
        let tokenizer = WordTokenizer::from_words(["café", "au", "lait"]);
        let text = "café au lait";
        let enc = tokenizer.encode(text, 512);
        assert_eq!(&text[enc.start_map[0]..enc.end_map[0]], "café");
        assert_eq!(&text[enc.start_map[2]..enc.end_map[2]], "lait");
    }
}
