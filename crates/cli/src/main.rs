mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use internvl_core::context::{SequenceStep, StepContextManager};
use internvl_core::engine::{greedy_tokens, run_sequences};
use internvl_core::kv_cache::{CacheConfig, KvCache};
use internvl_core::loader::{self, ModelFiles};
use internvl_core::models::InternVLChatModel;

#[derive(Parser)]
#[command(name = "internvl", about = "InternVL language model runner")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the architectures a checkpoint declares
    Inspect {
        #[command(flatten)]
        source: ModelSource,
    },
    /// Greedy-decode from a list of prompt token ids
    Generate {
        #[command(flatten)]
        source: ModelSource,

        /// Comma separated prompt token ids
        #[arg(long, value_delimiter = ',', required = true)]
        prompt_ids: Vec<u32>,

        #[arg(long, default_value_t = 16)]
        max_new_tokens: usize,

        #[arg(long, value_enum, default_value_t = CliDType::Bf16)]
        dtype: CliDType,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ModelSource {
    /// Local checkpoint directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// HuggingFace Hub model id
    #[arg(long)]
    model_id: Option<String>,
}

impl ModelSource {
    fn resolve(&self) -> anyhow::Result<ModelFiles> {
        match (&self.model_dir, &self.model_id) {
            (Some(dir), _) => ModelFiles::from_directory(dir),
            (None, Some(id)) => loader::fetch_model(id),
            (None, None) => anyhow::bail!("either --model-dir or --model-id is required"),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDType {
    F32,
    Bf16,
    F16,
}

impl From<CliDType> for DType {
    fn from(value: CliDType) -> Self {
        match value {
            CliDType::F32 => DType::F32,
            CliDType::Bf16 => DType::BF16,
            CliDType::F16 => DType::F16,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env())?;

    match cli.command {
        Command::Inspect { source } => inspect(&source),
        Command::Generate {
            source,
            prompt_ids,
            max_new_tokens,
            dtype,
        } => generate(&source, &prompt_ids, max_new_tokens, dtype.into()),
    }
}

fn inspect(source: &ModelSource) -> anyhow::Result<()> {
    let files = source.resolve()?;
    let llm_arch = files.config.llm_architecture()?;
    println!(
        "architecture: {}",
        files.config.architectures.first().map(String::as_str).unwrap_or("<none>")
    );
    println!("language model: {llm_arch}");
    println!("mono: {}", llm_arch == internvl_core::models::internvl::MONO_LLM_ARCH);
    println!("weight shards: {}", files.weights.len());
    Ok(())
}

fn generate(
    source: &ModelSource,
    prompt_ids: &[u32],
    max_new_tokens: usize,
    dtype: DType,
) -> anyhow::Result<()> {
    let files = source.resolve()?;
    let device = Device::Cpu;

    let mut model = InternVLChatModel::new(
        &files.config,
        Arc::new(StepContextManager::new()),
        dtype,
        &device,
    )?;
    let stats = loader::load_streaming(&files.weights, &device, |weights| {
        model.load_weights(weights)
    })?;
    if !stats.missing.is_empty() {
        anyhow::bail!(
            "checkpoint is missing {} language model weights",
            stats.missing.len()
        );
    }

    let mut kv = KvCache::new(&CacheConfig::for_model(&files.config.llm_config, 1));
    let mut history = 0usize;
    let mut step = SequenceStep::text(prompt_ids.to_vec(), history, 0);
    let mut generated = Vec::with_capacity(max_new_tokens);

    for _ in 0..max_new_tokens {
        let tokens = step.token_ids.len();
        let output = run_sequences(&model, &mut kv, std::slice::from_ref(&step))?;
        let next = greedy_tokens(&output.logits)?
            .first()
            .copied()
            .context("step produced no logits")?;
        generated.push(next);
        history += tokens;
        step = SequenceStep::text(vec![next], history, 0);
    }

    info!(
        prompt_tokens = prompt_ids.len(),
        generated = generated.len(),
        "generation finished"
    );
    let ids: Vec<String> = generated.iter().map(u32::to_string).collect();
    println!("{}", ids.join(","));
    Ok(())
}
