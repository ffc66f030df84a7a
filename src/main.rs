use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use taskwright::{workflow, ComponentKind, ComponentRegistry, ExecutionContext, RawExample, RunConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "taskwright")]
#[command(about = "Configuration-driven training, testing, prediction and export", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "TASKWRIGHT_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a task and save its snapshot
    Train {
        /// Run configuration file (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Shard of `distributed_world_size` trained by this process
        #[arg(long, default_value_t = 0, env = "TASKWRIGHT_RANK")]
        rank: usize,
    },

    /// Evaluate a saved task on labeled data
    Test {
        /// Snapshot directory
        #[arg(short, long, default_value = "model.snapshot")]
        snapshot: PathBuf,

        /// Test data file
        #[arg(short, long)]
        data: PathBuf,

        /// Place the model on a GPU when one is available
        #[arg(long)]
        use_cuda: bool,
    },

    /// Predict JSON lines examples with a saved task
    Predict {
        /// Snapshot directory
        #[arg(short, long, default_value = "model.snapshot")]
        snapshot: PathBuf,

        /// Examples file, one JSON object per line (stdin when absent)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Place the model on a GPU when one is available
        #[arg(long)]
        use_cuda: bool,
    },

    /// Export the model of a saved task
    Export {
        /// Snapshot directory
        #[arg(short, long, default_value = "model.snapshot")]
        snapshot: PathBuf,

        /// Export destination
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Validate a run configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List registered components
    Components,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json_logs);

    let registry = ComponentRegistry::global();

    match cli.command {
        Commands::Train { config, rank } => train(&config, rank, registry)?,
        Commands::Test { snapshot, data, use_cuda } => {
            let ctx = context(use_cuda);
            let report = workflow::test_model_from_snapshot(&snapshot, &data, registry, &ctx)
                .context("Failed to test model")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Predict {
            snapshot,
            input,
            output,
            use_cuda,
        } => {
            let examples = read_examples(input.as_deref())?;
            let ctx = context(use_cuda);
            let predictions = workflow::predict_from_snapshot(&snapshot, &examples, registry, &ctx)
                .context("Failed to predict")?;

            let lines = predictions
                .iter()
                .map(serde_json::to_string)
                .collect::<serde_json::Result<Vec<_>>>()?
                .join("\n");
            match output {
                Some(path) => {
                    fs::write(&path, lines + "\n").context("Failed to write predictions")?;
                    info!("Wrote {} predictions to {}", predictions.len(), path.display());
                }
                None => println!("{}", lines),
            }
        }
        Commands::Export { snapshot, output } => {
            let mut ctx = ExecutionContext::cpu();
            workflow::export_saved_model(&snapshot, &output, registry, &mut ctx)
                .context("Failed to export model")?;
        }
        Commands::Config { file } => validate_config(&file, registry)?,
        Commands::Components => list_components(registry),
    }

    Ok(())
}

fn init_logging(verbosity: u8, quiet: bool, json_output: bool) {
    let default_level = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "taskwright=info,warn",
            1 => "taskwright=debug,info",
            _ => "trace",
        }
    };
    let env_filter = if quiet {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}

fn context(use_cuda: bool) -> ExecutionContext {
    if use_cuda && candle_core::utils::cuda_is_available() {
        ExecutionContext::gpu(0)
    } else {
        ExecutionContext::cpu()
    }
}

fn train(config_path: &Path, rank: usize, registry: &ComponentRegistry) -> Result<()> {
    info!("Starting training run");

    let config = RunConfig::from_file(config_path).context("Failed to load configuration file")?;
    let mut ctx = ExecutionContext::from_run_config(&config);

    let outcome = workflow::train_model(&config, rank, registry, &mut ctx).context("Training failed")?;

    if rank == 0 {
        info!("Snapshot saved to: {}", config.save_snapshot_path.display());
    }
    println!(
        "{}",
        serde_json::json!({
            "epochs_run": outcome.epochs_run,
            "best_epoch": outcome.best_epoch,
            "best_metric": outcome.best_metric,
        })
    );
    Ok(())
}

fn read_examples(input: Option<&Path>) -> Result<Vec<RawExample>> {
    let content = match input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read examples from {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read examples from stdin")?;
            buffer
        }
    };

    let mut examples = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line).with_context(|| format!("Invalid JSON on line {}", line_no + 1))? {
            serde_json::Value::Object(map) => examples.push(map),
            _ => bail!("Line {} is not a JSON object", line_no + 1),
        }
    }
    Ok(examples)
}

fn validate_config(config_path: &Path, registry: &ComponentRegistry) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = RunConfig::from_file(config_path).context("Failed to load configuration file")?;
    let task = &config.task;

    let mut components = vec![
        (ComponentKind::Featurizer, &task.featurizer.type_name),
        (ComponentKind::DataHandler, &task.data_handler.type_name),
        (ComponentKind::Model, &task.model.type_name),
        (ComponentKind::MetricReporter, &task.metric_reporter.type_name),
        (ComponentKind::Optimizer, &task.optimizer.type_name),
        (ComponentKind::Trainer, &task.trainer.type_name),
        (ComponentKind::Task, &task.type_name),
    ];
    if let Some(exporter) = &task.exporter {
        components.push((ComponentKind::Exporter, &exporter.type_name));
    }

    for (kind, type_name) in components {
        if !registry.registered_types(kind).contains(type_name) {
            bail!(
                "no {} registered for config type '{}' (known: {})",
                kind,
                type_name,
                registry.registered_types(kind).join(", ")
            );
        }
    }

    info!("Configuration is valid");
    info!("  - Task: {}", task.type_name);
    info!("  - Model: {}", task.model.type_name);
    info!("  - Optimizer: {}", task.optimizer.type_name);
    info!("  - Scheduler: {:?}", task.scheduler);
    info!(
        "  - Exporter: {}",
        task.exporter.as_ref().map(|e| e.type_name.as_str()).unwrap_or("none")
    );
    Ok(())
}

fn list_components(registry: &ComponentRegistry) {
    for kind in ComponentKind::ALL {
        println!("{}: {}", kind, registry.registered_types(kind).join(", "));
    }
}
