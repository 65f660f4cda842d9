use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use quill_core::RunningAverage;
use quill_data_provider::BatchRecord;
use quill_modeling::{generate, CausalLM, GenerateOptions};
use tokenizers::Tokenizer;
use tracing::{debug, info};

pub const PROGRESS_BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub generate: GenerateOptions,
    /// Suppress the progress bar (always suppressed on rank > 0).
    pub quiet: bool,
}

/// Strip the prompt from a decoded result, leaving only the continuation.
///
/// Decoding is not always a perfect round trip, so when the result does not
/// start with the prompt verbatim we fall back to cutting at the longest
/// common prefix.
pub fn isolate_output(prompt: &str, result: &str) -> String {
    if let Some(continuation) = result.strip_prefix(prompt) {
        return continuation.to_string();
    }
    let common = prompt
        .char_indices()
        .zip(result.chars())
        .take_while(|((_, a), b)| a == b)
        .count();
    let byte_offset = result
        .char_indices()
        .nth(common)
        .map(|(i, _)| i)
        .unwrap_or(result.len());
    result[byte_offset..].to_string()
}

/// Cut at the first newline; text without one is returned unchanged.
pub fn truncate_at_newline(text: &str) -> &str {
    match text.find('\n') {
        Some(pos) => &text[..pos],
        None => text,
    }
}

/// Fold one batch's generation results into the completions map: isolate the
/// continuation, cut it at the first newline, and key it by instance id.
/// Later occurrences of a duplicate id overwrite earlier entries.
fn accumulate_completions(
    completions: &mut HashMap<String, String>,
    batch: &[BatchRecord],
    results: &[String],
) {
    for (record, result) in batch.iter().zip(results) {
        let continuation = isolate_output(&record.input, result);
        completions.insert(
            record.instance_id.clone(),
            truncate_at_newline(&continuation).to_string(),
        );
    }
}

/// Drive generation over prepared batches and accumulate completions keyed by
/// instance id. Later occurrences of a duplicate id overwrite earlier ones.
pub fn run(
    model: &dyn CausalLM,
    tokenizer: &Tokenizer,
    batches: &[Vec<BatchRecord>],
    options: &RunOptions,
) -> Result<HashMap<String, String>> {
    let num_instances: usize = batches.iter().map(Vec::len).sum();
    info!("Generating completions for {num_instances} instance(s) in {} batch(es)", batches.len());

    let pbar = if options.quiet {
        ProgressBar::hidden()
    } else {
        let pbar = ProgressBar::new(num_instances as u64);
        pbar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_BAR_TEMPLATE)?
                .progress_chars("#>-"),
        );
        pbar
    };

    let timings = RunningAverage::new();
    let mut completions = HashMap::new();

    for (batch_index, batch) in batches.iter().enumerate() {
        let prompts: Vec<String> = batch.iter().map(|r| r.input.clone()).collect();

        let started = Instant::now();
        let results = generate(model, tokenizer, &prompts, &options.generate)?;
        timings.push("batch_seconds", started.elapsed().as_secs_f64());

        if batch_index == 0 {
            if let (Some(record), Some(result)) = (batch.first(), results.first()) {
                debug!(instance_id = %record.instance_id, "first result: {result}");
            }
        }

        accumulate_completions(&mut completions, batch, &results);
        pbar.inc(batch.len() as u64);
    }
    pbar.finish_and_clear();

    if let Some(Some(avg)) = timings.get_all_averages().get("batch_seconds") {
        info!("Average batch latency: {avg:.2}s");
    }

    Ok(completions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_strips_the_prompt() {
        assert_eq!(isolate_output("Q: hi\nA:", "Q: hi\nA: hello"), " hello");
    }

    #[test]
    fn isolate_falls_back_to_common_prefix() {
        // Decode round trips can drop or normalize whitespace in the prompt.
        assert_eq!(isolate_output("a  b", "a b rest"), "b rest");
        assert_eq!(isolate_output("abc", "xyz"), "xyz");
    }

    #[test]
    fn truncation_cuts_at_first_newline() {
        assert_eq!(truncate_at_newline("answer\nmore\nlines"), "answer");
    }

    #[test]
    fn truncation_is_identity_without_newline() {
        assert_eq!(truncate_at_newline("just one line"), "just one line");
    }

    #[test]
    fn truncation_of_leading_newline_is_empty() {
        assert_eq!(truncate_at_newline("\nanswer"), "");
    }

    fn record(instance_id: &str, input: &str) -> BatchRecord {
        BatchRecord {
            input: input.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    #[test]
    fn one_completion_per_unique_id_across_batches() {
        let mut completions = HashMap::new();

        let batch1 = vec![record("a", "Q1:"), record("b", "Q2:")];
        let results1 = vec!["Q1: first\nignored".to_string(), "Q2: only".to_string()];
        accumulate_completions(&mut completions, &batch1, &results1);

        let batch2 = vec![record("a", "Q1:")];
        let results2 = vec!["Q1: second".to_string()];
        accumulate_completions(&mut completions, &batch2, &results2);

        assert_eq!(completions.len(), 2);
        // The later occurrence of "a" wins, and truncation already happened.
        assert_eq!(completions["a"], " second");
        assert_eq!(completions["b"], " only");
    }
}
