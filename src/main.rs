// SPDX-License-Identifier: MIT OR Apache-2.0

//! inject-mi CLI: trace prompt-injection leaks through model internals.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inject_mi::{Experiment, ExperimentConfig, HookPoint, PatchSpec, head_candidates, layer_candidates};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "inject-mi")]
#[command(about = "Activation patching for prompt-injection leaks")]
#[command(version)]
struct Cli {
    /// JSON experiment config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace` or a local directory
    #[arg(short, long)]
    model: Option<String>,

    /// Maximum tokens to generate
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Write the report as JSON to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate on the clean and injected prompts and check for leaks
    Inject,
    /// Show where the last position of the injected prompt attends
    Attention {
        /// Layer to analyse (default: last)
        #[arg(long)]
        layer: Option<usize>,
        /// Tokens per head
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Patch injected activations into the clean run during generation
    Patch {
        /// Site and optional heads, e.g. `z:11@4` or `resid_post:11`; repeatable
        #[arg(short, long = "patch", required = true)]
        patches: Vec<PatchSpec>,
    },
    /// Patch one candidate at a time and tabulate leaks
    Sweep {
        /// Sweep every head of `hook_z` at this layer
        #[arg(long, conflicts_with = "resid")]
        heads: Option<usize>,
        /// Sweep `resid_post` at every layer
        #[arg(long)]
        resid: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(n) = cli.max_new_tokens {
        config.max_new_tokens = n;
    }
    config.force_cpu |= cli.cpu;
    if let Command::Attention { layer, top_k } = &cli.command {
        config.attention_layer = layer.or(config.attention_layer);
        config.top_k = top_k.unwrap_or(config.top_k);
    }

    println!("=== inject-mi ===");
    println!("Model:  {}", config.model);
    println!("Secret: {}", config.secret);
    if config.force_cpu {
        println!("Mode:   CPU (forced)");
    }

    info!("Loading model...");
    let experiment = Experiment::load(config)?;

    match cli.command {
        Command::Inject => {
            let report = experiment.run_injection_test()?;
            println!("\n{report}");
            write_json(cli.json.as_deref(), &report)?;
        }
        Command::Attention { .. } => {
            let report = experiment.run_attention_analysis()?;
            println!("\n{report}");
            write_json(cli.json.as_deref(), &report)?;
        }
        Command::Patch { patches } => {
            let report = experiment.run_patching(&patches)?;
            println!("\n{report}");
            write_json(cli.json.as_deref(), &report)?;
        }
        Command::Sweep { heads, resid } => {
            let model = experiment.model();
            let candidates = match (heads, resid) {
                (Some(layer), _) => head_candidates(HookPoint::AttnZ(layer), model.num_heads()),
                (None, true) => layer_candidates(model.num_layers(), HookPoint::ResidPost),
                (None, false) => anyhow::bail!("sweep needs --heads <layer> or --resid"),
            };
            let report = experiment.run_sweep(&candidates)?;
            println!("\n{report}");
            write_json(cli.json.as_deref(), &report)?;
        }
    }

    Ok(())
}

fn write_json(path: Option<&Path>, report: &impl Serialize) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    info!("Results saved to {}", path.display());
    Ok(())
}
