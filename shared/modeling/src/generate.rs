use tch::{Kind, Tensor};
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{CausalLM, LogitsProcessor, SamplingError};

const PAD_TOKEN: i64 = 0;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no prompts to generate from")]
    EmptyBatch,

    #[error("prompt of {len} tokens does not fit in a {max} token context")]
    PromptTooLong { len: usize, max: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    /// Upper bound on newly generated tokens per prompt.
    pub max_gen_len: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_gen_len: 100,
            temperature: 0.0,
            top_p: 1.0,
            seed: 1,
        }
    }
}

/// Batched decoding over tokenized prompts.
///
/// All rows step in lockstep from the shortest prompt onwards; positions still
/// covered by a longer prompt keep their prompt token instead of the sampled
/// one. Each returned row is the prompt followed by at most `max_gen_len`
/// generated tokens, cut at the first EOS.
pub fn generate_tokens(
    model: &dyn CausalLM,
    prompt_tokens: &[Vec<i64>],
    options: &GenerateOptions,
) -> Result<Vec<Vec<i64>>, GenerateError> {
    let bsz = prompt_tokens.len();
    if bsz == 0 {
        return Err(GenerateError::EmptyBatch);
    }

    let max_ctx = model.max_context_length();
    let min_prompt_len = prompt_tokens.iter().map(Vec::len).min().unwrap_or(0);
    let max_prompt_len = prompt_tokens.iter().map(Vec::len).max().unwrap_or(0);
    if min_prompt_len == 0 {
        return Err(GenerateError::EmptyBatch);
    }
    if max_prompt_len > max_ctx {
        return Err(GenerateError::PromptTooLong {
            len: max_prompt_len,
            max: max_ctx,
        });
    }
    let total_len = max_ctx.min(max_prompt_len + options.max_gen_len);

    let mut processor =
        LogitsProcessor::new(options.seed, Some(options.temperature), Some(options.top_p));
    let eos = model.eos_token_ids();
    let device = model.device();

    let mut tokens: Vec<Vec<i64>> = prompt_tokens
        .iter()
        .map(|prompt| {
            let mut row = prompt.clone();
            row.resize(total_len, PAD_TOKEN);
            row
        })
        .collect();
    let mut finished = vec![false; bsz];

    let _no_grad = tch::no_grad_guard();
    for cur_pos in min_prompt_len..total_len {
        let input = Tensor::from_slice2(
            &tokens
                .iter()
                .map(|row| &row[..cur_pos])
                .collect::<Vec<_>>(),
        )
        .to_kind(Kind::Int64)
        .to(device);

        // Full-prefix forward each step; only the last position's logits are
        // materialized.
        let logits = model.forward(&input, None, Some(1));

        for (i, row) in tokens.iter_mut().enumerate() {
            let in_prompt = cur_pos < prompt_tokens[i].len();
            if in_prompt {
                continue;
            }
            if finished[i] {
                row[cur_pos] = PAD_TOKEN;
                continue;
            }
            let next_token = processor.sample(&logits.get(i as i64).squeeze())?;
            row[cur_pos] = next_token;
            if eos.as_ref().is_some_and(|eos| eos.contains(next_token)) {
                finished[i] = true;
            }
        }

        if finished.iter().all(|&f| f) {
            debug!("all {bsz} sequences hit EOS at position {cur_pos}");
            break;
        }
    }

    let decoded = tokens
        .into_iter()
        .zip(prompt_tokens)
        .map(|(row, prompt)| {
            let budget = total_len.min(prompt.len() + options.max_gen_len);
            let mut row: Vec<i64> = row.into_iter().take(budget).collect();
            if let Some(eos) = &eos {
                if let Some(pos) = row[prompt.len()..].iter().position(|&t| eos.contains(t)) {
                    row.truncate(prompt.len() + pos);
                }
            }
            row
        })
        .collect();

    Ok(decoded)
}

/// Encode, generate, and decode a batch of text prompts.
///
/// Prompts are encoded with special tokens (BOS); decoding skips them, so the
/// returned strings are prompt text plus continuation.
pub fn generate(
    model: &dyn CausalLM,
    tokenizer: &Tokenizer,
    prompts: &[String],
    options: &GenerateOptions,
) -> Result<Vec<String>, GenerateError> {
    let prompt_tokens = prompts
        .iter()
        .map(|prompt| {
            let encoding = tokenizer
                .encode(prompt.as_str(), true)
                .map_err(|e| GenerateError::Tokenizer(e.to_string()))?;
            Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
        })
        .collect::<Result<Vec<Vec<i64>>, GenerateError>>()?;

    let generated = generate_tokens(model, &prompt_tokens, options)?;

    generated
        .into_iter()
        .map(|row| {
            let ids: Vec<u32> = row.into_iter().map(|t| t as u32).collect();
            tokenizer
                .decode(&ids, true)
                .map_err(|e| GenerateError::Tokenizer(e.to_string()))
        })
        .collect::<Result<Vec<String>, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::llama::tests::tiny_model;

    fn greedy(max_gen_len: usize) -> GenerateOptions {
        GenerateOptions {
            max_gen_len,
            temperature: 0.0,
            top_p: 1.0,
            seed: 1,
        }
    }

    #[test]
    fn empty_batch_is_an_error() {
        let model = tiny_model();
        assert!(matches!(
            generate_tokens(&model, &[], &greedy(4)),
            Err(GenerateError::EmptyBatch)
        ));
    }

    #[test]
    fn prompt_longer_than_context_is_an_error() {
        let model = tiny_model();
        let prompt = vec![vec![1i64; 65]];
        assert!(matches!(
            generate_tokens(&model, &prompt, &greedy(4)),
            Err(GenerateError::PromptTooLong { len: 65, max: 64 })
        ));
    }

    #[test]
    fn prompts_survive_as_prefixes() {
        let model = tiny_model();
        let prompts = vec![vec![1i64, 7, 12], vec![1i64, 3, 9, 21, 30]];
        let out = generate_tokens(&model, &prompts, &greedy(4)).unwrap();
        assert_eq!(out.len(), 2);
        for (row, prompt) in out.iter().zip(&prompts) {
            assert_eq!(&row[..prompt.len()], prompt.as_slice());
            assert!(row.len() <= prompt.len() + 4);
        }
    }

    #[test]
    fn greedy_decoding_is_deterministic() {
        let model = tiny_model();
        let prompts = vec![vec![1i64, 4, 8, 16]];
        let a = generate_tokens(&model, &prompts, &greedy(8)).unwrap();
        let b = generate_tokens(&model, &prompts, &greedy(8)).unwrap();
        assert_eq!(a, b);
    }
}
