use std::path::Path;

use serde::Deserialize;

use crate::{batch_records, helm::fit_prompt, BatchRecord, DataError, FewShotOptions, TokenCount};

#[derive(Debug, Clone, Deserialize)]
struct MsMarcoInstance {
    id: String,
    query: String,
    passage: String,
    /// Yes/No relevance label; present on train instances only.
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MsMarcoDataset {
    #[serde(default)]
    train_instances: Vec<MsMarcoInstance>,
    instances: Vec<MsMarcoInstance>,
}

const QUESTION: &str = "Does the passage answer the query?";

fn instance_text(instance: &MsMarcoInstance) -> String {
    format!(
        "Passage: {}\nQuery: {}\n{}",
        instance.passage, instance.query, QUESTION
    )
}

fn example_block(example: &MsMarcoInstance) -> String {
    match &example.label {
        Some(label) => format!("{} {}", instance_text(example), label),
        None => instance_text(example),
    }
}

/// Read an MS-MARCO-style dataset (query/passage relevance) and produce
/// batched prompt records. Same few-shot fitting rules as the HELM reader.
pub fn load_msmarco_batches(
    path: impl AsRef<Path>,
    options: &FewShotOptions,
    counter: &dyn TokenCount,
    batch_size: usize,
    num_instances: usize,
) -> Result<Vec<Vec<BatchRecord>>, DataError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| DataError::ReadDataset {
        path: path.to_path_buf(),
        source,
    })?;
    let dataset: MsMarcoDataset =
        serde_json::from_str(&raw).map_err(|source| DataError::ParseDataset {
            path: path.to_path_buf(),
            source,
        })?;

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
                    &instance_text(instance),
                    options.max_prompt_tokens,
                    counter,
                )?,
                instance_id: instance.id.clone(),
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;

    Ok(batch_records(records, batch_size, num_instances))
}
