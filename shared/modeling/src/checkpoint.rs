use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub const SHARD_EXTENSION: &str = "safetensors";
pub const PARAMS_FILE: &str = "params.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint directory {dir}: {source}")]
    ReadDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "loading a checkpoint with {shards} shard(s) from {dir} but world size is {world_size}"
    )]
    ShardCountMismatch {
        shards: usize,
        world_size: usize,
        dir: PathBuf,
    },

    #[error("missing hyperparameter file {0}")]
    MissingParams(PathBuf),

    #[error("failed to read {path}: {source}")]
    ReadParams {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ParseParams {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A model-parallel checkpoint directory: one pre-sliced `.safetensors` weight
/// shard per rank (sorted filename order == rank order) next to a shared
/// `params.json` hyperparameter file.
#[derive(Debug, Clone)]
pub struct ShardedCheckpoint {
    shards: Vec<PathBuf>,
    params: PathBuf,
    rank: usize,
}

impl ShardedCheckpoint {
    pub fn discover(
        ckpt_dir: impl AsRef<Path>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, CheckpointError> {
        let dir = ckpt_dir.as_ref();
        let mut shards = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|source| CheckpointError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(SHARD_EXTENSION) {
                shards.push(path);
            }
        }
        shards.sort();

        if shards.len() != world_size {
            return Err(CheckpointError::ShardCountMismatch {
                shards: shards.len(),
                world_size,
                dir: dir.to_path_buf(),
            });
        }

        let params = dir.join(PARAMS_FILE);
        if !params.is_file() {
            return Err(CheckpointError::MissingParams(params));
        }

        info!(
            "Found {} checkpoint shard(s) in {}, this rank loads {}",
            shards.len(),
            dir.display(),
            shards[rank].display()
        );

        Ok(Self {
            shards,
            params,
            rank,
        })
    }

    /// The weight shard belonging to this process rank.
    pub fn shard_path(&self) -> &Path {
        &self.shards[self.rank]
    }

    pub fn world_size(&self) -> usize {
        self.shards.len()
    }

    pub fn load_params<C: serde::de::DeserializeOwned>(&self) -> Result<C, CheckpointError> {
        let raw =
            std::fs::read_to_string(&self.params).map_err(|source| CheckpointError::ReadParams {
                path: self.params.clone(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| CheckpointError::ParseParams {
            path: self.params.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn checkpoint_dir(num_shards: usize, with_params: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..num_shards {
            fs::write(dir.path().join(format!("consolidated.{i:02}.safetensors")), b"").unwrap();
        }
        if with_params {
            fs::write(
                dir.path().join(PARAMS_FILE),
                r#"{"hidden_size": 64, "intermediate_size": 128}"#,
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn shard_count_must_match_world_size() {
        let dir = checkpoint_dir(2, true);
        let err = ShardedCheckpoint::discover(dir.path(), 0, 1).unwrap_err();
        match err {
            CheckpointError::ShardCountMismatch {
                shards, world_size, ..
            } => {
                assert_eq!(shards, 2);
                assert_eq!(world_size, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn shards_are_assigned_by_sorted_order() {
        let dir = checkpoint_dir(4, true);
        let ckpt = ShardedCheckpoint::discover(dir.path(), 2, 4).unwrap();
        assert_eq!(ckpt.world_size(), 4);
        assert!(ckpt
            .shard_path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .contains("consolidated.02"));
    }

    #[test]
    fn missing_params_is_an_error() {
        let dir = checkpoint_dir(1, false);
        let err = ShardedCheckpoint::discover(dir.path(), 0, 1).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingParams(_)));
    }

    #[test]
    fn non_shard_files_are_ignored() {
        let dir = checkpoint_dir(1, true);
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert!(ShardedCheckpoint::discover(dir.path(), 0, 1).is_ok());
    }
}
