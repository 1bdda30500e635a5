//! Byte-pair tokenizer over the container vocabulary.
//!
//! The vocabulary comes either from GGUF metadata (`tokenizer.ggml.tokens`
//! plus optional scores and special ids) or from a plain text file with one
//! token per line. Encoding is greedy highest-score pair merging with
//! SentencePiece byte-fallback tokens.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::gguf::GgufFile;

// Phi-family defaults; metadata-supplied ids override these.
pub const DEFAULT_BOS_ID: u32 = 1;
pub const DEFAULT_EOS_ID: u32 = 2;
pub const DEFAULT_UNK_ID: u32 = 0;
pub const DEFAULT_PAD_ID: u32 = 0;

/// The SentencePiece space sentinel (U+2581) as UTF-8 bytes.
const SPACE_SENTINEL: [u8; 3] = [0xE2, 0x96, 0x81];

pub struct Vocabulary {
    tokens: Vec<String>,
    scores: Vec<f32>,
    pub bos_id: u32,
    pub eos_id: u32,
    pub unk_id: u32,
    pub pad_id: u32,
}

/// Rewrite `\n`, `\t`, `\r` and `\\` escapes in place.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl Vocabulary {
    /// Build directly from token/score tables. Scores shorter than the token
    /// table are padded with zeros.
    pub fn from_parts(tokens: Vec<String>, mut scores: Vec<f32>) -> Self {
        scores.resize(tokens.len(), 0.0);
        Self {
            tokens,
            scores,
            bos_id: DEFAULT_BOS_ID,
            eos_id: DEFAULT_EOS_ID,
            unk_id: DEFAULT_UNK_ID,
            pad_id: DEFAULT_PAD_ID,
        }
    }

    /// Load the vocabulary from an already-open container's metadata.
    pub fn from_container(gguf: &GgufFile) -> Result<Self> {
        let tokens = gguf
            .meta_string_array("tokenizer.ggml.tokens")
            .or_else(|| gguf.meta_string_array("tokenizer.tokens"))
            .context("no tokenizer token table in container metadata")?;

        let scores = match gguf.meta_f32_array("tokenizer.ggml.scores") {
            Some(s) if s.len() == tokens.len() => s,
            // No usable score table: earlier tokens merge first.
            _ => (0..tokens.len()).map(|i| (tokens.len() - i) as f32).collect(),
        };

        let mut vocab = Self::from_parts(tokens, scores);
        if let Some(id) = gguf.meta_u32("tokenizer.ggml.bos_token_id") {
            vocab.bos_id = id;
        }
        if let Some(id) = gguf.meta_u32("tokenizer.ggml.eos_token_id") {
            vocab.eos_id = id;
        }
        if let Some(id) = gguf.meta_u32("tokenizer.ggml.unk_token_id") {
            vocab.unk_id = id;
        }
        if let Some(id) = gguf.meta_u32("tokenizer.ggml.pad_token_id") {
            vocab.pad_id = id;
        }

        tracing::info!(
            tokens = vocab.tokens.len(),
            bos = vocab.bos_id,
            eos = vocab.eos_id,
            unk = vocab.unk_id,
            pad = vocab.pad_id,
            "tokenizer loaded from container"
        );
        Ok(vocab)
    }

    /// Load from a text file: one token per line, optionally followed by a
    /// whitespace-separated merge score.
    pub fn from_text_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("cannot open vocab file {path:?}"))?;

        let mut tokens = Vec::new();
        let mut scores = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let sep = line.rfind('\t').or_else(|| line.rfind(' '));
            let (token, score) = match sep {
                Some(at) if at > 0 => match line[at + 1..].parse::<f32>() {
                    Ok(v) => (&line[..at], v),
                    Err(_) => (line, 0.0),
                },
                _ => (line, 0.0),
            };

            tokens.push(unescape(token));
            scores.push(score);
        }

        if tokens.is_empty() {
            bail!("vocab file {path:?} contains no tokens");
        }
        tracing::info!(tokens = tokens.len(), path = ?path, "tokenizer loaded from file");
        Ok(Self::from_parts(tokens, scores))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn score(&self, id: u32) -> f32 {
        self.scores.get(id as usize).copied().unwrap_or(0.0)
    }

    /// First exact byte-sequence match, or None. Duplicates resolve to the
    /// earliest entry.
    fn lookup(&self, bytes: &[u8]) -> Option<usize> {
        self.tokens.iter().position(|t| t.as_bytes() == bytes)
    }

    /// Greedy BPE by merge score, truncated to `max_tokens`.
    pub fn encode(&self, text: &str, max_tokens: usize) -> Vec<u32> {
        if text.is_empty() || max_tokens == 0 {
            return Vec::new();
        }

        // Seed with one piece per UTF-8 scalar, falling back to per-byte
        // <0xHH> tokens (or UNK) for characters outside the vocabulary.
        let mut ids: Vec<u32> = Vec::new();
        let mut pieces: Vec<String> = Vec::new();
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let s = ch.encode_utf8(&mut buf);
            if let Some(id) = self.lookup(s.as_bytes()) {
                ids.push(id as u32);
                pieces.push(s.to_string());
            } else {
                for &b in s.as_bytes() {
                    let hex = format!("<0x{b:02X}>");
                    match self.lookup(hex.as_bytes()) {
                        Some(id) => {
                            ids.push(id as u32);
                            pieces.push(hex);
                        }
                        None => {
                            ids.push(self.unk_id);
                            pieces.push(String::new());
                        }
                    }
                }
            }
        }

        // Merge the highest-scoring adjacent pair until none concatenates to
        // a vocabulary entry. Ties break toward the lower index.
        loop {
            let mut best: Option<(usize, usize, f32)> = None;
            for i in 0..ids.len().saturating_sub(1) {
                let merged = format!("{}{}", pieces[i], pieces[i + 1]);
                if let Some(id) = self.lookup(merged.as_bytes()) {
                    let score = self.scores[id];
                    if best.map_or(true, |(_, _, s)| score > s) {
                        best = Some((i, id, score));
                    }
                }
            }
            let Some((at, id, _)) = best else { break };
            let merged = format!("{}{}", pieces[at], pieces[at + 1]);
            ids[at] = id as u32;
            pieces[at] = merged;
            ids.remove(at + 1);
            pieces.remove(at + 1);
        }

        ids.truncate(max_tokens);
        ids
    }

    /// Single-token string; empty on an out-of-range id.
    pub fn decode(&self, id: u32) -> &str {
        self.tokens.get(id as usize).map(String::as_str).unwrap_or("")
    }

    /// Concatenate a token sequence back into text, rewriting byte-fallback
    /// tokens to their byte and the space sentinel to an ASCII space.
    pub fn decode_sequence(&self, ids: &[u32]) -> String {
        let mut out: Vec<u8> = Vec::new();
        for &id in ids {
            let tok = self.decode(id);
            if tok.is_empty() {
                continue;
            }
            if let Some(b) = parse_byte_fallback(tok) {
                out.push(b);
                continue;
            }

            let bytes = tok.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i..].starts_with(&SPACE_SENTINEL) {
                    out.push(b' ');
                    i += SPACE_SENTINEL.len();
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Parse a `<0xHH>` byte-fallback token (uppercase hex, exactly six bytes).
fn parse_byte_fallback(tok: &str) -> Option<u8> {
    let bytes = tok.as_bytes();
    if bytes.len() != 6 || !tok.starts_with("<0x") || bytes[5] != b'>' {
        return None;
    }
    u8::from_str_radix(&tok[3..5], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(entries: &[(&str, f32)]) -> Vocabulary {
        let tokens = entries.iter().map(|(t, _)| t.to_string()).collect();
        let scores = entries.iter().map(|(_, s)| *s).collect();
        Vocabulary::from_parts(tokens, scores)
    }

    #[test]
    fn merges_highest_scoring_pair() {
        let v = vocab(&[("a", 10.0), ("b", 9.0), ("ab", 8.0), ("c", 7.0)]);
        assert_eq!(v.encode("ab", 32), vec![2]);
    }

    #[test]
    fn max_tokens_caps_output() {
        let v = vocab(&[("a", 5.0), ("b", 4.0), ("c", 3.0)]);
        let ids = v.encode("abc", 2);
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn empty_input_encodes_to_nothing() {
        let v = vocab(&[("a", 1.0)]);
        assert!(v.encode("", 32).is_empty());
        assert!(v.encode("a", 0).is_empty());
    }

    #[test]
    fn unknown_char_uses_byte_fallback_then_unk() {
        let with_fallback = vocab(&[("a", 2.0), ("<0xC3>", 1.0), ("<0xBC>", 1.0)]);
        // 'ü' is C3 BC in UTF-8.
        assert_eq!(with_fallback.encode("ü", 32), vec![1, 2]);

        let without = vocab(&[("a", 2.0), ("b", 1.0)]);
        let ids = without.encode("ü", 32);
        assert_eq!(ids, vec![without.unk_id, without.unk_id]);
    }

    #[test]
    fn encode_is_deterministic() {
        let v = vocab(&[("h", 5.0), ("i", 4.0), ("hi", 9.0)]);
        assert_eq!(v.encode("hihi", 32), v.encode("hihi", 32));
    }

    #[test]
    fn tie_breaks_toward_lower_index() {
        // Both "aa" merges carry the same score; the leftmost pair merges
        // first, so "aaa" becomes ["aa", "a"].
        let v = vocab(&[("a", 1.0), ("aa", 3.0)]);
        assert_eq!(v.encode("aaa", 32), vec![1, 0]);
    }

    #[test]
    fn decode_rewrites_sentinel_and_byte_tokens() {
        let v = vocab(&[("▁hello", 2.0), ("<0x21>", 1.0)]);
        assert_eq!(v.decode_sequence(&[0, 1]), " hello!");
        assert_eq!(v.decode(99), "");
    }

    #[test]
    fn round_trip_of_vocab_string() {
        let v = vocab(&[("h", 5.0), ("i", 4.0), ("hi", 9.0)]);
        let ids = v.encode("hi", 32);
        assert_eq!(ids, vec![2]);
        assert_eq!(v.decode_sequence(&ids), "hi");
    }

    #[test]
    fn unescape_handles_known_escapes() {
        assert_eq!(unescape(r"a\nb"), "a\nb");
        assert_eq!(unescape(r"a\tb"), "a\tb");
        assert_eq!(unescape(r"a\rb"), "a\rb");
        assert_eq!(unescape(r"a\\b"), "a\\b");
        assert_eq!(unescape(r"a\qb"), "a\\qb");
    }

    #[test]
    fn byte_fallback_parser_is_strict() {
        assert_eq!(parse_byte_fallback("<0xAB>"), Some(0xAB));
        assert_eq!(parse_byte_fallback("<0xA>"), None);
        assert_eq!(parse_byte_fallback("0xAB"), None);
    }
}
