use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use quill_data_provider::{
    data_name, dataset_file, is_msmarco, load_helm_batches, load_msmarco_batches, prompt_prefix,
    FewShotOptions,
};
use quill_harness::{output_filename, run, write_outputs, RunOptions};
use quill_modeling::{
    CommunicatorId, Devices, DistributedEnv, GenerateOptions, LlamaForCausalLM, ShardedCheckpoint,
};
use tch::Kind;
use tokenizers::Tokenizer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(about = "Batched completion generation from a sharded checkpoint")]
struct Args {
    /// Directory holding one weight shard per rank plus params.json.
    #[arg(long)]
    ckpt_dir: PathBuf,

    #[arg(long)]
    tokenizer_path: PathBuf,

    /// 0 means greedy decoding.
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,

    /// Nucleus sampling threshold; 1 disables the cutoff.
    #[arg(long, default_value_t = 1.0)]
    top_p: f64,

    #[arg(long, default_value_t = 2048)]
    max_seq_len: usize,

    #[arg(long, default_value_t = 1)]
    max_batch_size: usize,

    /// Overrides the prefix selected by --p-id.
    #[arg(long)]
    prepend_text: Option<String>,

    /// Few-shot example count.
    #[arg(short, long, default_value_t = 5)]
    k: usize,

    #[arg(long, default_value_t = 100)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 0)]
    data_id: usize,

    #[arg(long, default_value_t = 0)]
    p_id: usize,

    /// How many instances to run; 0 means the whole dataset.
    #[arg(long, default_value_t = 0)]
    num_instances: usize,

    #[arg(long, default_value = "/storage1/llama-harness/helm-datasets")]
    dataset_root: PathBuf,

    #[arg(long, default_value = "/storage1/llama-harness/outputs")]
    output_dir: PathBuf,

    #[arg(long, default_value = "auto")]
    device: Devices,

    /// Seed shared by all ranks; also seeds sampling.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[cfg(feature = "parallelism")]
fn tensor_parallelism_world(
    env: &DistributedEnv,
) -> Result<Option<(CommunicatorId, usize, usize)>> {
    Ok(match env.world_size {
        1 => None,
        n => Some((tch::CStore::new().into(), env.local_rank, n)),
    })
}

#[cfg(not(feature = "parallelism"))]
fn tensor_parallelism_world(
    env: &DistributedEnv,
) -> Result<Option<(CommunicatorId, usize, usize)>> {
    match env.world_size {
        1 => Ok(None),
        n => anyhow::bail!("WORLD_SIZE={n} requires a build with the `parallelism` feature"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let env = DistributedEnv::from_env()?;

    // All logging and progress output comes from rank 0.
    let filter = if env.is_main() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("off")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("local_rank is {}", env.local_rank);
    info!("world_size is {}", env.world_size);
    if let Ok(model_size) = std::env::var("MODEL_SIZE") {
        info!("Model name: {model_size}");
    }

    // Seed must be the same in all processes.
    tch::manual_seed(args.seed as i64);

    let device = args
        .device
        .device_for_rank(env.local_rank)
        .ok_or_else(|| {
            anyhow!(
                "no device for rank {} on {} ({} usable)",
                env.local_rank,
                args.device,
                args.device.size()
            )
        })?;

    let tokenizer = Tokenizer::from_file(&args.tokenizer_path)
        .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", args.tokenizer_path.display()))?;

    let checkpoint = ShardedCheckpoint::discover(&args.ckpt_dir, env.local_rank, env.world_size)?;

    info!("Loading");
    let started = Instant::now();
    let kind = if device.is_cuda() {
        Kind::Half
    } else {
        Kind::Float
    };
    let model = LlamaForCausalLM::from_checkpoint(
        &checkpoint,
        Some(tokenizer.get_vocab_size(true)),
        Some(args.max_seq_len),
        Some(kind),
        None,
        Some(device),
        tensor_parallelism_world(&env)?,
    )?;
    info!("Loaded in {:.2} seconds", started.elapsed().as_secs_f64());

    let file = dataset_file(args.data_id)?;
    let name = data_name(file);
    let dataset_path = args.dataset_root.join(file);
    let prefix = match &args.prepend_text {
        Some(text) => text.clone(),
        None => prompt_prefix(args.p_id)?.to_string(),
    };
    let few_shot = FewShotOptions {
        prefix,
        k: args.k,
        max_prompt_tokens: args.max_seq_len.saturating_sub(args.max_new_tokens),
    };

    let batches = if is_msmarco(&name) {
        load_msmarco_batches(
            &dataset_path,
            &few_shot,
            &tokenizer,
            args.max_batch_size,
            args.num_instances,
        )?
    } else {
        load_helm_batches(
            &dataset_path,
            &few_shot,
            &tokenizer,
            args.max_batch_size,
            args.num_instances,
        )?
    };
    info!("data name: {name}");
    info!("len of data: {}", batches.len());

    let options = RunOptions {
        generate: GenerateOptions {
            max_gen_len: args.max_new_tokens,
            temperature: args.temperature,
            top_p: args.top_p,
            seed: args.seed,
        },
        quiet: args.quiet || !env.is_main(),
    };

    let completions = run(&model, &tokenizer, &batches, &options)?;

    if env.is_main() {
        let path = args.output_dir.join(output_filename(
            &name,
            args.p_id,
            args.k,
            args.num_instances,
        ));
        write_outputs(&path, &completions)
            .with_context(|| format!("failed to persist completions to {}", path.display()))?;
    }

    Ok(())
}
