//! plugind - plugin-hosting daemon.
//!
//! Runs a control-plane node, or installs a single package against an
//! in-process node and prints its progress.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plugind::cluster::shutdown_channel;
use plugind::{Config, DaemonContext, InstallOutcome};

/// Plugin-hosting daemon control plane
#[derive(Parser)]
#[command(name = "plugind")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to ./plugind.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted (default)
    Serve,

    /// Install one plugin package and print its events as JSON lines
    Install {
        /// Package file
        file: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Print the config directory instead
        #[arg(long)]
        path: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        None | Some(Commands::Serve) => cmd_serve(cli.config.as_deref()),
        Some(Commands::Install { file }) => cmd_install(cli.config.as_deref(), &file),
        Some(Commands::Config { path }) => cmd_config(cli.config.as_deref(), path),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load(),
    }
}

fn cmd_serve(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let context = DaemonContext::connect(config).await.context("failed to start daemon")?;
        let (trigger, shutdown) = shutdown_channel();
        let tasks = context.spawn_background(shutdown);

        tracing::info!(node = %context.node().node_id, "plugind running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;

        trigger.trigger();
        tasks.join().await;
        context.shutdown().await;
        anyhow::Ok(())
    })
}

fn cmd_install(config_path: Option<&Path>, file: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let raw =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let context = DaemonContext::connect(config).await.context("failed to start daemon")?;
        let mut stream = context.install_raw(&raw).await?;

        let mut outcome = None;
        let mut stdout = io::stdout().lock();
        while let Some(event) = stream.next().await {
            writeln!(stdout, "{}", event.to_line()?)?;
            if let Some(message) = event.as_session() {
                if event.is_end() {
                    outcome = serde_json::from_value::<InstallOutcome>(message.data).ok();
                }
            }
        }
        drop(stdout);

        context.shutdown().await;
        anyhow::Ok(outcome)
    })?;

    match outcome {
        Some(outcome) if outcome.success => Ok(()),
        Some(outcome) => anyhow::bail!(
            "install of {} failed: {}",
            outcome.identity,
            outcome.error.unwrap_or_default()
        ),
        None => anyhow::bail!("install ended without an outcome"),
    }
}

fn cmd_config(config_path: Option<&Path>, show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = load_config(config_path)?;
    println!("{}", config.to_toml()?);

    Ok(())
}
