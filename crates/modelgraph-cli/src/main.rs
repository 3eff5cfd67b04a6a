use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, Registry};

use modelgraph_core::{ConfigManager, EqualityMode, LoggingConfig, ModelGraphConfig};
use modelgraph_history::{
    diff_checkpoints, list_checkpoints, Checkpoint, CheckpointDiff, EntityComparator,
    RetentionPolicy,
};

#[derive(Parser)]
#[command(name = "modelgraph")]
#[command(about = "ModelGraph CLI - Inspect document checkpoints and their differences", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Configuration file, overriding the default search locations
    #[arg(long, global = true, env = "MODELGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Checkpoint inspection and maintenance
    #[command(subcommand)]
    Checkpoints(CheckpointCommands),

    /// Show the effective configuration
    Config {
        /// Write a default configuration file to this path instead
        #[arg(long)]
        init: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// List the checkpoints in a document directory, newest first
    List {
        /// Document checkpoint directory
        dir: PathBuf,
    },

    /// Summarize a single checkpoint file
    Show {
        /// Checkpoint file
        file: PathBuf,
    },

    /// Compare two checkpoint files
    Diff {
        /// Older checkpoint file
        older: PathBuf,

        /// Newer checkpoint file
        newer: PathBuf,

        /// Also compare names and attribute values
        #[arg(long)]
        deep: bool,

        /// Per-axis coordinate tolerance
        #[arg(short, long)]
        tolerance: Option<f64>,
    },

    /// Delete checkpoints older than the retention window
    Sweep {
        /// Document checkpoint directory
        dir: PathBuf,

        /// Retention window in days
        #[arg(short, long)]
        retain_days: Option<u32>,
    },
}

#[derive(Serialize)]
struct CheckpointSummary {
    document: String,
    description: String,
    timestamp: String,
    schema_version: u32,
    entity_count: usize,
    categories: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct DiffSummary {
    older: String,
    newer: String,
    equality: String,
    tolerance: f64,
    added: Vec<String>,
    deleted: Vec<String>,
    modified: Vec<String>,
    total_changes: usize,
}

#[derive(Serialize)]
struct SweepResult {
    dir: String,
    retain_days: u32,
    removed: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::from_file(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&manager.config().logging, cli.verbose);
    if let Some(path) = manager.config_path() {
        debug!(path = %path.display(), "Configuration loaded");
    }

    match execute_command(&cli, manager.config()) {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match logging.format.as_str() {
        "json" => {
            let subscriber = Registry::default().with(env_filter()).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            );
            install_subscriber(subscriber);
        }
        "compact" => {
            let subscriber = Registry::default().with(env_filter()).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            );
            install_subscriber(subscriber);
        }
        _ => {
            let subscriber = Registry::default()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
            install_subscriber(subscriber);
        }
    }
}

/// Returns false when a global subscriber was already installed.
fn install_subscriber<S>(subscriber: S) -> bool
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("{} logging not initialized: {}", "Warning:".yellow().bold(), e);
            false
        }
    }
}

fn execute_command(cli: &Cli, config: &ModelGraphConfig) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Checkpoints(cmd) => execute_checkpoint_command(cmd, config),
        Commands::Config { init } => execute_config_command(init.as_deref(), config),
    }
}

fn execute_checkpoint_command(
    cmd: &CheckpointCommands,
    config: &ModelGraphConfig,
) -> Result<serde_json::Value> {
    match cmd {
        CheckpointCommands::List { dir } => {
            let infos = list_checkpoints(dir)
                .with_context(|| format!("Failed to list checkpoints in {}", dir.display()))?;
            Ok(serde_json::to_value(infos)?)
        }

        CheckpointCommands::Show { file } => {
            let checkpoint = load(file)?;
            Ok(serde_json::to_value(summarize(&checkpoint))?)
        }

        CheckpointCommands::Diff {
            older,
            newer,
            deep,
            tolerance,
        } => {
            let mut comparator = EntityComparator::from(&config.history);
            if *deep {
                comparator.mode = EqualityMode::Deep;
            }
            if let Some(tolerance) = tolerance {
                anyhow::ensure!(*tolerance >= 0.0, "Tolerance must be non-negative");
                comparator.tolerance = *tolerance;
            }

            let diff = diff_checkpoints(&load(older)?, &load(newer)?, &comparator);
            Ok(serde_json::to_value(describe_diff(&diff, &comparator))?)
        }

        CheckpointCommands::Sweep { dir, retain_days } => {
            let days = retain_days.unwrap_or(config.history.retain_days);
            anyhow::ensure!(days > 0, "Retention must be at least one day");
            let removed = RetentionPolicy::days(i64::from(days))
                .sweep(dir, Utc::now())
                .with_context(|| format!("Failed to sweep {}", dir.display()))?;

            let result = SweepResult {
                dir: dir.display().to_string(),
                retain_days: days,
                removed: removed.iter().map(|p| p.display().to_string()).collect(),
            };
            Ok(serde_json::to_value(result)?)
        }
    }
}

fn execute_config_command(init: Option<&Path>, config: &ModelGraphConfig) -> Result<serde_json::Value> {
    match init {
        Some(path) => {
            ConfigManager::create_default_config(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(serde_json::json!({
                "created": path.display().to_string(),
            }))
        }
        None => Ok(serde_json::to_value(config)?),
    }
}

fn load(path: &Path) -> Result<Checkpoint> {
    Checkpoint::load(path).with_context(|| format!("Failed to read checkpoint {}", path.display()))
}

fn summarize(checkpoint: &Checkpoint) -> CheckpointSummary {
    let mut categories = BTreeMap::new();
    for entity in &checkpoint.entities {
        let category = entity.category().unwrap_or(modelgraph_core::UNKNOWN);
        *categories.entry(category.to_string()).or_insert(0) += 1;
    }

    CheckpointSummary {
        document: checkpoint.document_key.to_string(),
        description: checkpoint.description.clone(),
        timestamp: checkpoint.timestamp.to_rfc3339(),
        schema_version: checkpoint.schema_version,
        entity_count: checkpoint.entities.len(),
        categories,
    }
}

fn describe_diff(diff: &CheckpointDiff, comparator: &EntityComparator) -> DiffSummary {
    let label = |id: modelgraph_core::EntityId, name: Option<&str>| match name {
        Some(name) if !name.is_empty() => format!("{} ({})", id, name),
        _ => id.to_string(),
    };

    DiffSummary {
        older: diff.older_timestamp.to_rfc3339(),
        newer: diff.newer_timestamp.to_rfc3339(),
        equality: match comparator.mode {
            EqualityMode::Shallow => "shallow".to_string(),
            EqualityMode::Deep => "deep".to_string(),
        },
        tolerance: comparator.tolerance,
        added: diff
            .added
            .iter()
            .map(|e| label(e.id, e.name.as_deref()))
            .collect(),
        deleted: diff
            .deleted
            .iter()
            .map(|e| label(e.id, e.name.as_deref()))
            .collect(),
        modified: diff
            .modified
            .iter()
            .map(|m| label(m.entity_id, m.after.name.as_deref()))
            .collect(),
        total_changes: diff.total_changes(),
    }
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value, 0)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}{}: {}", indent, key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}{}: {}", indent, key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b {
                            "true".green()
                        } else {
                            "false".red()
                        };
                        println!("{}{}: {}", indent, key_colored, val_colored);
                    }
                    serde_json::Value::Array(items) if items.is_empty() => {
                        println!("{}{}: {}", indent, key_colored, "none".dimmed());
                    }
                    serde_json::Value::Array(items) if items.iter().all(|i| i.is_string()) => {
                        println!("{}{}:", indent, key_colored);
                        for item in items {
                            println!("{}  - {}", indent, item.as_str().unwrap_or_default());
                        }
                    }
                    _ => {
                        println!("{}{}:", indent, key_colored);
                        print_pretty(val, depth + 1)?;
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            if arr.is_empty() {
                println!("{}{}", indent, "No entries".dimmed());
            }
            for (i, item) in arr.iter().enumerate() {
                println!("\n{}{}{}:", indent, "Item ".cyan(), (i + 1).to_string().yellow());
                print_pretty(item, depth + 1)?;
            }
        }
        _ => {
            println!("{}{}", indent, value);
        }
    }
    Ok(())
}
