mod attention;
mod causal_language_model;
mod checkpoint;
mod device_utils;
mod generate;
mod models;
mod parallelism;
mod rms_norm;
mod rope;
mod sampling;

pub use attention::{AttentionImplementation, CausalSelfAttention};
pub use causal_language_model::{
    CausalLM, CausalLanguageModel, EosToks, LanguageModelBuilder, LanguageModelConfig,
    LanguageModelForward, ModelLoadError,
};
pub use checkpoint::{CheckpointError, ShardedCheckpoint, PARAMS_FILE, SHARD_EXTENSION};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use generate::{generate, generate_tokens, GenerateError, GenerateOptions};
pub use models::{Llama, LlamaConfig, LlamaForCausalLM};
pub use parallelism::{
    ColumnParallelLinear, Communicator, CommunicatorId, DistributedEnv, DistributedEnvError,
    RowParallelLinear,
};
pub use rms_norm::RMSNorm;
pub use rope::{default_rope, rotate_half, RoPECache, RoPEConfig, RoPEType};
pub use sampling::{LogitsProcessor, Sampling, SamplingError};
