mod batching;
mod helm;
mod msmarco;
mod registry;
mod token_budget;

pub use batching::{batch_records, BatchRecord};
pub use helm::load_helm_batches;
pub use msmarco::load_msmarco_batches;
pub use registry::{data_name, dataset_file, is_msmarco, prompt_prefix, RegistryError};
pub use token_budget::TokenCount;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read dataset file {path}: {source}")]
    ReadDataset {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse dataset file {path}: {source}")]
    ParseDataset {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Few-shot prompt assembly settings shared by all dataset readers.
#[derive(Debug, Clone)]
pub struct FewShotOptions {
    /// Text prepended to every prompt.
    pub prefix: String,
    /// Maximum number of in-context examples.
    pub k: usize,
    /// Token budget for the whole prompt; examples are dropped from the end
    /// until the prompt fits.
    pub max_prompt_tokens: usize,
}
