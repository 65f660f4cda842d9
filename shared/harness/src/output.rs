use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Output filename encoding dataset name, prompt id, few-shot count, and
/// instance-count limit.
pub fn output_filename(data_name: &str, p_id: usize, k: usize, num_instances: usize) -> String {
    format!("{data_name}_{p_id}_{k}_samples{num_instances}.json")
}

/// Write the accumulated completions as a single JSON object. One shot: a
/// crash mid-run loses all progress.
pub fn write_outputs(path: impl AsRef<Path>, completions: &HashMap<String, String>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), completions)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        "Wrote {} completion(s) to {}",
        completions.len(),
        path.display()
    );
    Ok(())
}
