use crate::{AttentionImplementation, CheckpointError, Communicator, CommunicatorId, RoPEConfig};
use std::path::Path;
use std::sync::Arc;
use std::fmt::Debug;
use tch::{
    nn::{self, Module},
    Device, Kind, TchError, Tensor,
};
use tracing::warn;

#[cfg(feature = "parallelism")]
use tch::CNCCL;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum EosToks {
    Single(i64),
    Multiple(Vec<i64>),
}

impl EosToks {
    pub fn contains(&self, token: i64) -> bool {
        match self {
            EosToks::Single(x) => *x == token,
            EosToks::Multiple(items) => items.contains(&token),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("models with tied word embeddings are not supported")]
    ModelHasTiedEmbeddings,

    #[error("vocab size missing from hyperparameters and no tokenizer override given")]
    MissingVocabSize,

    #[error("tensor parallelism requested but the `parallelism` feature is not enabled")]
    TensorParallelismNotEnabled,

    #[error("communicator id does not match the enabled backend")]
    CommunicatorMismatch,

    #[cfg(feature = "parallelism")]
    #[error("failed to init tensor parallelism: {0}")]
    TensorParallelismFailedInit(TchError),

    #[error("failed to load shard weights: {0}")]
    LoadWeights(#[from] TchError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Inference surface for any causal language model, independent of its
/// internal implementation. `forward` returns logits of shape
/// `[batch, num_logits_to_keep.unwrap_or(seq), vocab]`.
pub trait CausalLM: Send {
    fn forward(
        &self,
        x: &Tensor,
        position_ids: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> Tensor;
    fn bos_token_id(&self) -> Option<i64>;
    fn eos_token_ids(&self) -> Option<EosToks>;
    fn device(&self) -> Device;
    fn max_context_length(&self) -> usize;
}

pub trait LanguageModelForward: Send + Debug {
    fn forward(&self, x: &Tensor, position_ids: Option<&Tensor>) -> Tensor;
}

pub trait LanguageModelConfig: Send + Debug + serde::de::DeserializeOwned {
    fn tie_word_embeddings(&self) -> bool;
    fn set_max_position_embeddings(&mut self, set: usize);
    fn hidden_size(&self) -> usize;
    fn vocab_size(&self) -> Option<usize>;

    fn rope_config(&self) -> Option<RoPEConfig>;
    fn num_attention_heads(&self) -> usize;
    fn rope_theta(&self) -> f32;
    fn max_position_embeddings(&self) -> usize;
    fn bos_token_id(&self) -> Option<i64>;
    fn eos_token_ids(&self) -> Option<EosToks>;
}

#[derive(Debug)]
pub struct CausalLanguageModel<M: LanguageModelForward, C: LanguageModelConfig> {
    pub model: M,
    pub config: C,
    pub device: Device,
    pub lm_head: nn::Linear,
    pub comm: Option<Arc<Communicator>>,
    variables: nn::VarStore,
}

// NCCL handles are not thread-safe; this type must stay on its loading thread
// when a communicator is attached.
unsafe impl<M: LanguageModelForward, C: LanguageModelConfig> Send for CausalLanguageModel<M, C> {}

pub type LanguageModelBuilder<M, C> = fn(
    vs: nn::Path,
    config: &C,
    attn_implementation: Option<AttentionImplementation>,
    comm: Option<Arc<Communicator>>,
) -> Result<M, ModelLoadError>;

impl<M: LanguageModelForward, C: LanguageModelConfig> CausalLanguageModel<M, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn from_builder(
        builder: LanguageModelBuilder<M, C>,
        config: C,
        shard: Option<&Path>,
        kind: Option<Kind>,
        attn_implementation: Option<AttentionImplementation>,
        device: Option<Device>,
        tensor_parallelism_world: Option<(CommunicatorId, usize, usize)>,
    ) -> Result<Self, ModelLoadError> {
        if config.tie_word_embeddings() {
            return Err(ModelLoadError::ModelHasTiedEmbeddings);
        }
        let vocab_size = config.vocab_size().ok_or(ModelLoadError::MissingVocabSize)?;

        let device = device.unwrap_or(Device::cuda_if_available());

        #[cfg(feature = "parallelism")]
        let comm = match tensor_parallelism_world {
            Some((id, rank, world_size)) => Some(Arc::new(
                CNCCL::new(
                    match id {
                        CommunicatorId::NCCL(cstore) => cstore,
                        _ => return Err(ModelLoadError::CommunicatorMismatch),
                    },
                    rank as i64,
                    world_size as i64,
                    device,
                )
                .map_err(ModelLoadError::TensorParallelismFailedInit)?
                .into(),
            )),
            None => None,
        };

        #[cfg(not(feature = "parallelism"))]
        let comm = match tensor_parallelism_world {
            Some(_) => return Err(ModelLoadError::TensorParallelismNotEnabled),
            None => None,
        };

        let mut variables: nn::VarStore = nn::VarStore::new(device);
        if let Some(kind) = kind {
            variables.set_kind(kind);
        }
        let (model, lm_head) = {
            let _no_grad = tch::no_grad_guard();
            let model = builder(variables.root(), &config, attn_implementation, comm.clone())?;
            let c = nn::LinearConfig {
                bias: false,
                ..Default::default()
            };
            let lm_head = nn::linear(
                &variables.root() / "lm_head",
                config.hidden_size() as i64,
                vocab_size as i64,
                c,
            );

            if let Some(shard) = shard {
                // Meta shards carry extra buffers (e.g. rope.freqs) and omit
                // freshly initialized heads, so loading is non-strict.
                let missing = variables.load_partial(shard)?;
                if !missing.is_empty() {
                    warn!(
                        "{} variable(s) not found in {}: {missing:?}",
                        missing.len(),
                        shard.display()
                    );
                }
            }

            (model, lm_head)
        };
        Ok(Self {
            model,
            config,
            device,
            lm_head,
            comm,
            variables,
        })
    }

}

impl<M: LanguageModelForward, C: LanguageModelConfig> CausalLM for CausalLanguageModel<M, C> {
    fn forward(
        &self,
        x: &Tensor,
        position_ids: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> Tensor {
        let (_, t) = x.size2().unwrap();
        let mut x = self.model.forward(x, position_ids);
        if let Some(num_logits_to_keep) = num_logits_to_keep {
            // Only compute the logits we are asked for.
            x = x.slice(1, t - num_logits_to_keep, t, 1);
        }
        self.lm_head.forward(&x)
    }

    fn bos_token_id(&self) -> Option<i64> {
        self.config.bos_token_id()
    }

    fn eos_token_ids(&self) -> Option<EosToks> {
        self.config.eos_token_ids()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn max_context_length(&self) -> usize {
        self.config.max_position_embeddings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_single_contains() {
        let eos = EosToks::Single(2);
        assert!(eos.contains(2));
        assert!(!eos.contains(3));
    }

    #[test]
    fn eos_multiple_contains() {
        let eos = EosToks::Multiple(vec![2, 32000]);
        assert!(eos.contains(32000));
        assert!(!eos.contains(1));
    }

    #[test]
    fn eos_deserializes_untagged() {
        let single: EosToks = serde_json::from_str("2").unwrap();
        assert!(matches!(single, EosToks::Single(2)));
        let multi: EosToks = serde_json::from_str("[2, 3]").unwrap();
        assert!(matches!(multi, EosToks::Multiple(_)));
    }

    #[test]
    fn shard_load_tolerates_missing_and_extra_tensors() {
        use crate::models::llama::tests::{tiny_config, tiny_model};
        use crate::LlamaForCausalLM;

        let donor = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consolidated.00.safetensors");

        // Drop the head and add a buffer no variable maps to, like the
        // rope.freqs entry in Meta checkpoints.
        let mut tensors: Vec<(String, Tensor)> = donor
            .variables
            .variables()
            .into_iter()
            .filter(|(name, _)| name != "lm_head.weight")
            .collect();
        tensors.push((
            "rope.freqs".to_string(),
            Tensor::from_slice(&[0.5f32, 0.25]),
        ));
        Tensor::write_safetensors(&tensors, &path).unwrap();

        let model = LlamaForCausalLM::from_builder(
            LlamaForCausalLM::builder,
            tiny_config(),
            Some(&path),
            None,
            None,
            Some(Device::Cpu),
            None,
        )
        .unwrap();

        let x = Tensor::from_slice(&[1i64, 2, 3]).reshape([1, 3]);
        assert_eq!(model.forward(&x, None, Some(1)).size(), vec![1, 1, 32]);
    }
}
