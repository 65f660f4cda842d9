pub(crate) mod llama;

pub use llama::{Llama, LlamaConfig, LlamaForCausalLM};
