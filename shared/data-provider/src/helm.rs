use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::{batch_records, BatchRecord, DataError, FewShotOptions, TokenCount};

#[derive(Debug, Clone, Deserialize)]
struct HelmInstance {
    id: String,
    input: String,
    #[serde(default)]
    references: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HelmDataset {
    #[serde(default)]
    train_instances: Vec<HelmInstance>,
    instances: Vec<HelmInstance>,
}

fn read_dataset(path: &Path) -> Result<HelmDataset, DataError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DataError::ReadDataset {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| DataError::ParseDataset {
        path: path.to_path_buf(),
        source,
    })
}

fn example_block(example: &HelmInstance) -> String {
    match example.references.first() {
        Some(reference) => format!("{}\n{}", example.input, reference),
        None => example.input.clone(),
    }
}

/// Assemble `prefix + examples + input`, dropping in-context examples from
/// the end until the prompt fits the token budget.
pub(crate) fn fit_prompt(
    prefix: &str,
    example_blocks: &[String],
    input: &str,
    max_prompt_tokens: usize,
    counter: &dyn TokenCount,
) -> Result<String, DataError> {
    let mut kept = example_blocks.len();
    loop {
        let mut parts: Vec<&str> = Vec::with_capacity(kept + 1);
        parts.extend(example_blocks[..kept].iter().map(String::as_str));
        parts.push(input);
        let prompt = format!("{}{}", prefix, parts.join("\n\n"));
        if counter.token_count(&prompt)? <= max_prompt_tokens || kept == 0 {
            if kept < example_blocks.len() {
                debug!(
                    "dropped {} in-context example(s) to fit {} tokens",
                    example_blocks.len() - kept,
                    max_prompt_tokens
                );
            }
            return Ok(prompt);
        }
        kept -= 1;
    }
}

/// Read a HELM-style dataset and produce batched prompt records.
///
/// Each prompt is the configured prefix, up to `k` few-shot blocks built from
/// `train_instances` (input plus first reference), and the instance input.
pub fn load_helm_batches(
    path: impl AsRef<Path>,
    options: &FewShotOptions,
    counter: &dyn TokenCount,
    batch_size: usize,
    num_instances: usize,
) -> Result<Vec<Vec<BatchRecord>>, DataError> {
    let dataset = read_dataset(path.as_ref())?;

    let example_blocks: Vec<String> = dataset
        .train_instances
        .iter()
        .take(options.k)
        .map(example_block)
        .collect();

    let records = dataset
        .instances
        .iter()
        .map(|instance| {
            Ok(BatchRecord {
                input: fit_prompt(
                    &options.prefix,
                    &example_blocks,
                    &instance.input,
                    options.max_prompt_tokens,
                    counter,
                )?,
                instance_id: instance.id.clone(),
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;

    Ok(batch_records(records, batch_size, num_instances))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Counts whitespace-separated words; good enough to exercise budget
    /// logic without a tokenizer model file.
    pub(crate) struct WordCount;

    impl TokenCount for WordCount {
        fn token_count(&self, text: &str) -> Result<usize, DataError> {
            Ok(text.split_whitespace().count())
        }
    }

    fn write_dataset(json: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), json).unwrap();
        file
    }

    const DATASET: &str = r#"{
        "train_instances": [
            {"id": "t0", "input": "one two three", "references": ["four"]},
            {"id": "t1", "input": "five six", "references": ["seven"]}
        ],
        "instances": [
            {"id": "a", "input": "alpha beta"},
            {"id": "b", "input": "gamma"}
        ]
    }"#;

    fn options(k: usize, max_prompt_tokens: usize) -> FewShotOptions {
        FewShotOptions {
            prefix: String::new(),
            k,
            max_prompt_tokens,
        }
    }

    #[test]
    fn few_shot_blocks_precede_the_input() {
        let file = write_dataset(DATASET);
        let batches = load_helm_batches(file.path(), &options(2, 100), &WordCount, 1, 0).unwrap();
        assert_eq!(batches.len(), 2);
        let prompt = &batches[0][0].input;
        assert!(prompt.starts_with("one two three\nfour\n\nfive six\nseven\n\n"));
        assert!(prompt.ends_with("alpha beta"));
        assert_eq!(batches[0][0].instance_id, "a");
    }

    #[test]
    fn budget_drops_examples_from_the_end() {
        let file = write_dataset(DATASET);
        // 8 words: fits the first example (4+2=6) but not both (4+3+2=9).
        let batches = load_helm_batches(file.path(), &options(2, 8), &WordCount, 1, 0).unwrap();
        let prompt = &batches[0][0].input;
        assert!(prompt.contains("one two three"));
        assert!(!prompt.contains("five six"));
    }

    #[test]
    fn over_budget_input_still_yields_a_prompt() {
        let file = write_dataset(DATASET);
        let batches = load_helm_batches(file.path(), &options(2, 1), &WordCount, 1, 0).unwrap();
        assert_eq!(batches[0][0].input, "alpha beta");
    }

    #[test]
    fn missing_file_is_a_typed_error() {
        let err =
            load_helm_batches("/nonexistent/data.json", &options(0, 10), &WordCount, 1, 0)
                .unwrap_err();
        assert!(matches!(err, DataError::ReadDataset { .. }));
    }
}
