//! qmd-repair CLI - Repair tooling for query-expansion training datasets.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qmd_repair::dataset::load_records;
use qmd_repair::models::ConfigError;
use qmd_repair::{
    ChatClient, Config, FileCheckpointStore, FillerNormalizer, HydeGenerator, HydeRepairPipeline,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "qmd-repair.toml";

#[derive(Parser)]
#[command(name = "qmd-repair")]
#[command(version)]
#[command(about = "Repair hyde and lex fields in query-expansion training datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file [default: qmd-repair.toml, optional]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate templated hyde fields through the generation service
    Hyde {
        /// Path to input JSONL dataset
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Path to output JSONL dataset
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Checkpoint file for resumable runs
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Queries per generation call
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Strip excess filler terms from lex fields
    Lex {
        /// Path to input JSONL dataset
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Path to output JSONL dataset
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

/// Load the config file. A missing default file means built-in defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path:?}"))?,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                Config::from_file(default)
                    .with_context(|| format!("Failed to load config from {default:?}"))?
            } else {
                info!("No {DEFAULT_CONFIG} found, using built-in defaults");
                Config::default()
            }
        }
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_example_config() {
    let example = r#"# qmd-repair configuration file
# Every key is optional; shown values are the defaults.

[endpoint]
# API key (can also use the api_key_env variable, ${VAR} is expanded)
# api_key = "sk-..."
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 180
max_retries = 3

[model]
id = "gpt-4o-mini"
max_tokens = 4096
temperature = 0.7

[hyde]
input = "qmd_expansion_v2.jsonl"
output = "qmd_expansion_v3.jsonl"
checkpoint = "fix_hyde_checkpoint.json"
bad_pattern = "comprehensive guide covers everything"
batch_size = 25

[lex]
input = "qmd_expansion_v2.jsonl"
output = "qmd_expansion_v3_lex_fixed.jsonl"
fillers = ["overview", "tutorial", "guide", "examples", "documentation", "best practices"]
sample_limit = 15
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;

            match config.resolve_api_key() {
                Ok(_) => info!("API key resolved"),
                Err(e) => warn!("{e} (only needed when hyde repairs are pending)"),
            }

            info!("Configuration is valid");
            info!("  Endpoint:    {}", config.endpoint.base_url);
            info!("  Model:       {}", config.model.id);
            info!("  Batch size:  {}", config.hyde.batch_size);
            info!("  Checkpoint:  {:?}", config.hyde.checkpoint);
            info!("  Fillers:     {}", config.lex.fillers.join(", "));
            return Ok(());
        }

        Commands::Hyde {
            input,
            output,
            checkpoint,
            batch_size,
        } => {
            let mut config = load_config(cli.config.as_deref())?;

            // CLI flags override the config file
            if let Some(input) = input {
                config.hyde.input = input;
            }
            if let Some(output) = output {
                config.hyde.output = output;
            }
            if let Some(checkpoint) = checkpoint {
                config.hyde.checkpoint = checkpoint;
            }
            if let Some(batch_size) = batch_size {
                if batch_size == 0 {
                    bail!("--batch-size must be at least 1");
                }
                config.hyde.batch_size = batch_size;
            }

            // The key is only required once there is something to send.
            let api_key = match config.resolve_api_key() {
                Ok(key) => Some(key),
                Err(ConfigError::MissingApiKey { .. }) => None,
                Err(e) => return Err(e).context("Failed to resolve API key"),
            };

            let client = Arc::new(ChatClient::from_config(&config.endpoint, api_key.clone())?);
            let generator = HydeGenerator::new(Arc::clone(&client), config.model.clone());
            let store = FileCheckpointStore::new(&config.hyde.checkpoint);
            let pipeline = HydeRepairPipeline::new(
                generator,
                store,
                config.hyde.bad_pattern.clone(),
                config.hyde.batch_size,
            );

            let mut records = load_records(&config.hyde.input)
                .with_context(|| format!("Failed to load {:?}", config.hyde.input))?;

            let pending = pipeline.pending(&records)?;
            if pending > 0 && api_key.is_none() {
                bail!(ConfigError::MissingApiKey {
                    env_var: config.endpoint.api_key_env.clone(),
                });
            }

            let stats = pipeline.run_on(&mut records, &config.hyde.output).await?;
            let (input_tokens, output_tokens) = client.total_tokens();
            let limiter = client.rate_limiter();

            println!("\n=== Hyde Regeneration Complete ===");
            println!("Records:     {}", stats.total_records);
            println!("Defective:   {}", stats.defective);
            println!("Resumed:     {}", stats.previously_completed);
            println!("Batches:     {} ({} empty)", stats.batches_sent, stats.batches_empty);
            println!("Repaired:    {}", stats.repaired);
            println!("Missing:     {}", stats.missing);
            println!("Applied:     {}", stats.applied);
            println!("Residual:    {}", stats.residual);
            println!("Requests:    {}", client.total_requests());
            println!("Tokens:      {input_tokens} in / {output_tokens} out");
            println!(
                "Rate limits: {} hits, {:.1}s waited",
                limiter.total_429s(),
                limiter.total_wait_secs()
            );
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Output:      {:?}", config.hyde.output);
        }

        Commands::Lex { input, output } => {
            let mut config = load_config(cli.config.as_deref())?;

            if let Some(input) = input {
                config.lex.input = input;
            }
            if let Some(output) = output {
                config.lex.output = output;
            }

            let normalizer = FillerNormalizer::new(&config.lex.fillers)?;
            let stats = normalizer.run(&config.lex.input, &config.lex.output, config.lex.sample_limit)?;

            println!("\n=== Lex Normalization Complete ===");
            println!("Records:     {}", stats.total_records);
            println!("Modified:    {}", stats.records_modified);
            println!("Fields:      {}", stats.fields_cleaned);
            println!("Output:      {:?}", config.lex.output);
        }
    }

    Ok(())
}
