//! Greedy autoregressive decoding and token-to-text conversion

use anyhow::{anyhow, Result};
use candle_core::Tensor;
use candle_transformers::generation::LogitsProcessor;
use tokenizers::Tokenizer;

/// Sequence-start token (the tokenizer's classification token)
pub const START_TOKEN: &str = "<s>";

/// Padding token
pub const PAD_TOKEN: &str = "<pad>";

/// End-of-sequence token (the tokenizer's separator token)
pub const EOS_TOKEN: &str = "</s>";

/// Unused with argmax sampling, but the logits processor wants one
const SEED: u64 = 1337;

/// Token ids that frame a generated sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub decoder_start: u32,
    pub pad: u32,
    pub eos: u32,
}

impl SpecialTokens {
    /// Look the special tokens up in the tokenizer's vocabulary
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no {token} token"))
        };

        Ok(SpecialTokens {
            decoder_start: id(START_TOKEN)?,
            pad: id(PAD_TOKEN)?,
            eos: id(EOS_TOKEN)?,
        })
    }

    fn contains(&self, token: u32) -> bool {
        token == self.decoder_start || token == self.pad || token == self.eos
    }
}

/// Generate a token sequence greedily.
///
/// `step` receives the not-yet-seen suffix of the sequence and its offset and
/// returns logits shaped `(1, seq_len, vocab)`. The first call sees the
/// whole prefix, later calls only the newest token, so `step` is expected to
/// keep a key/value cache. Generation stops after `eos` or once the sequence,
/// start token included, is `max_length` long.
pub fn greedy_decode<F>(tokens: &SpecialTokens, max_length: usize, mut step: F) -> Result<Vec<u32>>
where
    F: FnMut(&[u32], usize) -> Result<Tensor>,
{
    let mut logits_processor = LogitsProcessor::new(SEED, None, None);
    let mut token_ids = vec![tokens.decoder_start];

    while token_ids.len() < max_length {
        let context_size = if token_ids.len() > 1 { 1 } else { token_ids.len() };
        let start_pos = token_ids.len() - context_size;

        let logits = step(&token_ids[start_pos..], start_pos)?;
        let logits = logits.squeeze(0)?;
        let logits = logits.get(logits.dim(0)? - 1)?;

        let token = logits_processor.sample(&logits)?;
        token_ids.push(token);
        if token == tokens.eos {
            break;
        }
    }

    Ok(token_ids)
}

/// Decode generated ids into text without any special tokens
pub fn decode_text(tokenizer: &Tokenizer, tokens: &SpecialTokens, ids: &[u32]) -> Result<String> {
    let ids: Vec<u32> = ids.iter().copied().filter(|id| !tokens.contains(*id)).collect();
    tokenizer
        .decode(&ids, true)
        .map_err(|e| anyhow!("failed to decode tokens: {e}"))
}
