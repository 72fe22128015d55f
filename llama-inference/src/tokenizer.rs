//! Text processing for LLaMA-family models.
//!
//! - [`TextProcessor`] is the interface a model exposes for encoding prompts and decoding ids.
//! - [`Vocabulary`] is a score-driven BPE over a token list read from the model parameters.
//! - Encoding looks up special tokens (`<s>`, `</s>`, ...) and single characters, then applies
//!   BPE merges; decoding concatenates token strings.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use crate::configuration::Parameters;
use anyhow::Result;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// SentencePiece word-boundary marker, rendered as a space
const SPACE_MARKER: &str = "\u{2581}";

/// Converts between text and token ids.
pub trait TextProcessor {
    fn encode(&self, text: &str) -> Result<Vec<i32>>;

    fn decode(&self, ids: &[i32]) -> Result<String>;

    fn bos_token_id(&self) -> Option<i32>;

    fn eos_token_id(&self) -> Option<i32>;

    fn vocab_size(&self) -> usize;
}

/// Text processor shared between a model and its callers.
pub type SharedTextProcessor = Arc<dyn TextProcessor + Send + Sync>;

/// BPE vocabulary.
///
/// Holds the token strings, merge scores and special token ids.
pub struct Vocabulary {
    /// Token strings, indexed by id
    tokens: Vec<String>,
    /// Merge scores for BPE merges (higher is better)
    scores: Vec<f32>,
    ids: HashMap<String, i32>,
    /// Maximum token length (in chars), bounds the special token search
    max_token_length: usize,
    bos_token_id: Option<i32>,
    eos_token_id: Option<i32>,
}

impl Vocabulary {
    /// Creates a vocabulary; `scores` must match `tokens` in length.
    pub fn new(tokens: Vec<String>, scores: Vec<f32>) -> Result<Self> {
        if tokens.len() != scores.len() {
            anyhow::bail!("Vocabulary has {} tokens but {} scores", tokens.len(), scores.len());
        }

        if tokens.len() > i32::MAX as usize {
            anyhow::bail!("Vocabulary too large: {} tokens", tokens.len());
        }

        let mut ids = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            // first occurrence wins
            ids.entry(token.clone()).or_insert(id as i32);
        }

        let max_token_length = tokens.iter().map(|token| token.chars().count()).max().unwrap_or(0);

        Ok(Self { tokens, scores, ids, max_token_length, bos_token_id: None, eos_token_id: None })
    }

    pub fn with_special_tokens(mut self, bos_token_id: Option<i32>, eos_token_id: Option<i32>) -> Self {
        self.bos_token_id = bos_token_id;
        self.eos_token_id = eos_token_id;
        self
    }

    /// Reads `tokenizer.ggml.tokens` and the optional scores and special token ids.
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let tokens = params.strings("tokenizer.ggml.tokens")?;
        let scores = if params.contains("tokenizer.ggml.scores") {
            params.floats("tokenizer.ggml.scores")?
        } else {
            vec![0.0; tokens.len()]
        };

        let special = |key: &str| -> Result<Option<i32>> {
            if params.contains(key) { Ok(Some(params.uint(key)? as i32)) } else { Ok(None) }
        };

        let bos_token_id = special("tokenizer.ggml.bos_token_id")?;
        let eos_token_id = special("tokenizer.ggml.eos_token_id")?;

        Ok(Self::new(tokens, scores)?.with_special_tokens(bos_token_id, eos_token_id))
    }

    pub fn token(&self, id: i32) -> Option<&str> {
        usize::try_from(id).ok().and_then(|id| self.tokens.get(id)).map(String::as_str)
    }

    pub fn token_id(&self, token: &str) -> Option<i32> {
        self.ids.get(token).copied()
    }

    fn char_id(&self, c: char) -> Option<i32> {
        let mut buffer = [0u8; 4];
        let id = self.token_id(c.encode_utf8(&mut buffer));
        match (id, c) {
            (None, ' ') => self.token_id(SPACE_MARKER),
            _ => id,
        }
    }

    /// Finds a `<...>` special token starting at `chars[start]`.
    fn special_at(&self, chars: &[char], start: usize) -> Option<(i32, usize)> {
        if chars[start] != '<' {
            return None;
        }

        let search_limit = chars.len().min(start + self.max_token_length);
        let end = (start + 1..search_limit).find(|&j| chars[j] == '>')?;
        let candidate: String = chars[start..=end].iter().collect();

        self.token_id(&candidate).map(|id| (id, end + 1))
    }

    /// Repeatedly merges the adjacent pair whose merged token has the highest score.
    fn merge(&self, tokens: &mut Vec<i32>) {
        loop {
            let mut best: Option<(f32, i32, usize)> = None;

            for idx in 0..tokens.len().saturating_sub(1) {
                let merged = format!("{}{}", self.tokens[tokens[idx] as usize], self.tokens[tokens[idx + 1] as usize]);
                if let Some(id) = self.token_id(&merged) {
                    let score = self.scores[id as usize];
                    if best.is_none_or(|(best_score, _, _)| score > best_score) {
                        best = Some((score, id, idx));
                    }
                }
            }

            let Some((_, id, idx)) = best else {
                break;
            };

            tokens[idx] = id;
            tokens.remove(idx + 1);
        }
    }
}

impl TextProcessor for Vocabulary {
    fn encode(&self, text: &str) -> Result<Vec<i32>> {
        let chars: Vec<char> = text.chars().collect();
        let mut tokens = Vec::with_capacity(chars.len());
        let mut i = 0;

        while i < chars.len() {
            if let Some((id, next)) = self.special_at(&chars, i) {
                tokens.push(id);
                i = next;
                continue;
            }

            match self.char_id(chars[i]) {
                Some(id) => tokens.push(id),
                None => warn!("Unknown character {:?} in input, skipping", chars[i]),
            }
            i += 1;
        }

        self.merge(&mut tokens);

        Ok(tokens)
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        ids.iter()
            .map(|&id| match self.token(id) {
                Some(token) => Ok(token.replace(SPACE_MARKER, " ")),
                None => anyhow::bail!("Token id {id} out of range [0, {})", self.tokens.len()),
            })
            .collect()
    }

    fn bos_token_id(&self) -> Option<i32> {
        self.bos_token_id
    }

    fn eos_token_id(&self) -> Option<i32> {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let special = |id: Option<i32>| id.map(|id| (id, self.token(id).unwrap_or_default().to_string()));

        f.debug_struct("Vocabulary")
            .field("vocab_size", &self.tokens.len())
            .field("max_token_length", &self.max_token_length)
            .field("bos_token", &special(self.bos_token_id))
            .field("eos_token", &special(self.eos_token_id))
            .finish_non_exhaustive()
    }
}
