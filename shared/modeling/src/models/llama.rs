use crate::{
    default_rope, parallelism::Communicator, AttentionImplementation, CausalLanguageModel,
    CausalSelfAttention, ColumnParallelLinear, CommunicatorId, EosToks, LanguageModelConfig,
    LanguageModelForward, ModelLoadError, RMSNorm, RoPECache, RoPEConfig, RowParallelLinear,
    ShardedCheckpoint,
};
use std::sync::Arc;
use tch::{
    nn::{self, Module},
    Device, Kind, Tensor,
};

/// LLaMA hyperparameters as found in a checkpoint's `params.json`.
///
/// HF-style field names, with aliases for the names Meta's original
/// checkpoints use. A missing or non-positive `vocab_size` means the value
/// must come from the tokenizer at load time.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LlamaConfig {
    #[serde(alias = "dim")]
    pub hidden_size: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub vocab_size: Option<i64>,
    #[serde(alias = "n_layers")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_heads")]
    pub num_attention_heads: usize,
    #[serde(default, alias = "n_kv_heads")]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps", alias = "norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope")]
    pub rope_theta: f32,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: Option<i64>,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: Option<EosToks>,
    #[serde(default)]
    pub rope_scaling: Option<RoPEConfig>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: Option<bool>,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_bos_token_id() -> Option<i64> {
    Some(1)
}

fn default_eos_token_id() -> Option<EosToks> {
    Some(EosToks::Single(2))
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: ColumnParallelLinear,
    up_proj: ColumnParallelLinear,
    down_proj: RowParallelLinear,
}

impl Mlp {
    fn new(vs: nn::Path, n_embd: i64, n_hidden: i64, comm: Option<Arc<Communicator>>) -> Self {
        let tp_size = comm.as_ref().map(|x| x.size()).unwrap_or(1);
        assert_eq!(
            n_hidden % tp_size,
            0,
            "n_hidden must be divisible by tp_size"
        );

        let gate_proj = ColumnParallelLinear::new(
            &vs / "gate_proj",
            n_embd,
            n_hidden,
            false,
            false,
            comm.clone(),
        );
        let up_proj = ColumnParallelLinear::new(
            &vs / "up_proj",
            n_embd,
            n_hidden,
            false,
            false,
            comm.clone(),
        );
        let down_proj =
            RowParallelLinear::new(&vs / "down_proj", n_hidden, n_embd, false, true, comm);

        Self {
            gate_proj,
            up_proj,
            down_proj,
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.down_proj
            .forward(&(self.gate_proj.forward(xs).silu() * self.up_proj.forward(xs)))
    }
}

#[derive(Debug)]
struct Block {
    rms_1: RMSNorm,
    attn: CausalSelfAttention,
    rms_2: RMSNorm,
    mlp: Mlp,
}

impl Block {
    fn new(
        vs: nn::Path,
        config: &LlamaConfig,
        attn_implementation: AttentionImplementation,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let rms_1 = RMSNorm::new(
            &vs / "input_layernorm",
            config.hidden_size as i64,
            config.rms_norm_eps,
        );
        let attn = CausalSelfAttention::new(
            &vs / "self_attn",
            config.num_attention_heads as i64,
            config.num_key_value_heads() as i64,
            config.hidden_size as i64,
            config.attention_bias.unwrap_or(false),
            attn_implementation,
            comm.clone(),
        );
        let rms_2 = RMSNorm::new(
            &vs / "post_attention_layernorm",
            config.hidden_size as i64,
            config.rms_norm_eps,
        );
        let mlp = Mlp::new(
            &vs / "mlp",
            config.hidden_size as i64,
            config.intermediate_size as i64,
            comm,
        );
        Self {
            rms_1,
            attn,
            rms_2,
            mlp,
        }
    }

    fn forward(&self, x: &Tensor, position_ids: Option<&Tensor>, cache: &RoPECache) -> Tensor {
        let x = self.attn.forward(&self.rms_1.forward(x), position_ids, cache) + x;
        self.mlp.forward(&self.rms_2.forward(&x)) + x
    }
}

#[derive(Debug)]
pub struct Llama {
    wte: nn::Embedding,
    blocks: Vec<Block>,
    ln_f: RMSNorm,
    rope_cache: RoPECache,
}

impl Llama {
    pub fn new(
        vs: nn::Path,
        config: &LlamaConfig,
        attn_implementation: AttentionImplementation,
        comm: Option<Arc<Communicator>>,
    ) -> Result<Self, ModelLoadError> {
        let vocab_size = config.vocab_size().ok_or(ModelLoadError::MissingVocabSize)?;
        let wte = nn::embedding(
            &vs / "model" / "embed_tokens",
            vocab_size as i64,
            config.hidden_size as i64,
            Default::default(),
        );
        let ln_f = RMSNorm::new(
            &vs / "model" / "norm",
            config.hidden_size as i64,
            config.rms_norm_eps,
        );
        let blocks = (0..config.num_hidden_layers)
            .map(|i| {
                Block::new(
                    &vs / "model" / "layers" / i,
                    config,
                    attn_implementation,
                    comm.clone(),
                )
            })
            .collect::<Vec<_>>();
        let rope_cache = RoPECache::new(
            &config.rope_config(),
            config.hidden_size / config.num_attention_heads,
            config.rope_theta,
            &vs.device(),
        );
        Ok(Self {
            wte,
            blocks,
            ln_f,
            rope_cache,
        })
    }
}

impl LanguageModelForward for Llama {
    fn forward(&self, x: &Tensor, position_ids: Option<&Tensor>) -> Tensor {
        let mut x = self.wte.forward(x);
        for block in &self.blocks {
            x = block.forward(&x, position_ids, &self.rope_cache);
        }
        self.ln_f.forward(&x)
    }
}

pub type LlamaForCausalLM = CausalLanguageModel<Llama, LlamaConfig>;

impl LlamaForCausalLM {
    pub fn builder(
        vs: nn::Path,
        config: &LlamaConfig,
        attn_implementation: Option<AttentionImplementation>,
        comm: Option<Arc<Communicator>>,
    ) -> Result<Llama, ModelLoadError> {
        Llama::new(vs, config, attn_implementation.unwrap_or_default(), comm)
    }

    /// Build the model from a sharded checkpoint directory, loading this
    /// rank's weight shard.
    ///
    /// `vocab_size` overrides the hyperparameter file when the checkpoint
    /// leaves it unset (Meta checkpoints store `vocab_size: -1` and expect it
    /// from the tokenizer). `max_seq_len` caps the usable context window.
    #[allow(clippy::too_many_arguments)]
    pub fn from_checkpoint(
        checkpoint: &ShardedCheckpoint,
        vocab_size: Option<usize>,
        max_seq_len: Option<usize>,
        kind: Option<Kind>,
        attn_implementation: Option<AttentionImplementation>,
        device: Option<Device>,
        tensor_parallelism_world: Option<(CommunicatorId, usize, usize)>,
    ) -> Result<Self, ModelLoadError> {
        let mut config: LlamaConfig = checkpoint.load_params()?;
        if let Some(vocab_size) = vocab_size {
            config.vocab_size = Some(vocab_size as i64);
        }
        if let Some(max_seq_len) = max_seq_len {
            config.set_max_position_embeddings(max_seq_len);
        }
        Self::from_builder(
            Self::builder,
            config,
            Some(checkpoint.shard_path()),
            kind,
            attn_implementation,
            device,
            tensor_parallelism_world,
        )
    }
}

impl LanguageModelConfig for LlamaConfig {
    fn tie_word_embeddings(&self) -> bool {
        self.tie_word_embeddings
    }

    fn set_max_position_embeddings(&mut self, set: usize) {
        self.max_position_embeddings = set;
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> Option<usize> {
        self.vocab_size.filter(|v| *v > 0).map(|v| v as usize)
    }

    fn rope_config(&self) -> Option<RoPEConfig> {
        self.rope_scaling.clone()
    }

    fn num_attention_heads(&self) -> usize {
        self.num_attention_heads
    }

    fn rope_theta(&self) -> f32 {
        self.rope_theta
    }

    fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    fn bos_token_id(&self) -> Option<i64> {
        self.bos_token_id
    }

    fn eos_token_ids(&self) -> Option<EosToks> {
        self.eos_token_id.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::CausalLM;

    pub(crate) fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            hidden_size: 16,
            intermediate_size: 32,
            vocab_size: Some(32),
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            bos_token_id: Some(1),
            eos_token_id: Some(EosToks::Single(2)),
            rope_scaling: None,
            max_position_embeddings: 64,
            tie_word_embeddings: false,
            attention_bias: None,
        }
    }

    pub(crate) fn tiny_model() -> LlamaForCausalLM {
        LlamaForCausalLM::from_builder(
            LlamaForCausalLM::builder,
            tiny_config(),
            None,
            None,
            None,
            Some(Device::Cpu),
            None,
        )
        .unwrap()
    }

    #[test]
    fn meta_params_json_parses() {
        let raw = r#"{"dim": 512, "intermediate_size": 1376, "n_layers": 8, "n_heads": 8, "norm_eps": 1e-06, "vocab_size": -1}"#;
        let config: LlamaConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.hidden_size, 512);
        assert_eq!(config.num_hidden_layers, 8);
        assert_eq!(config.num_key_value_heads(), 8);
        // -1 means "take it from the tokenizer"
        assert_eq!(config.vocab_size(), None);
        assert_eq!(config.max_position_embeddings, 2048);
    }

    #[test]
    fn forward_keeps_only_requested_logits() {
        let model = tiny_model();
        let x = Tensor::from_slice(&[1i64, 5, 9, 3]).reshape([1, 4]);
        let logits = model.forward(&x, None, Some(1));
        assert_eq!(logits.size(), vec![1, 1, 32]);
        let all = model.forward(&x, None, None);
        assert_eq!(all.size(), vec![1, 4, 32]);
    }
}
