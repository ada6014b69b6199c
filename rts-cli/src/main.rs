//! CLI for talking to and simulating rts observatory devices.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod client;
mod dummy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rts::BlockConfig;

#[derive(Parser)]
#[command(name = "rtsmon", version, about = "Talk to rts observatory devices")]
struct Cli {
    /// Configuration file (default: <config dir>/rts/rtsmon.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one command to a device and print its reply and values.
    Send(client::SendArgs),

    /// Follow a device's state, values and messages until interrupted.
    Watch(client::WatchArgs),

    /// Run a simulated camera.
    Dummy(dummy::DummyArgs),

    /// Print the effective configuration.
    Config,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for replies and values.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("rtsmon: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        match self.command {
            Command::Send(args) => client::send(config, &args),
            Command::Watch(args) => client::watch(config, &args, &stop_flag()?),
            Command::Dummy(args) => dummy::run(config, &args, &stop_flag()?),
            Command::Config => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "rtsmon",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

/// Reads `path`, or the default file when it exists, or falls back to
/// built-in defaults.
fn load_config(path: Option<&Path>) -> Result<BlockConfig> {
    if let Some(path) = path {
        return BlockConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let Some(default) = dirs::config_dir().map(|d| d.join("rts").join("rtsmon.json")) else {
        return Ok(BlockConfig::named("rtsmon"));
    };
    if !default.exists() {
        return Ok(BlockConfig::named("rtsmon"));
    }
    BlockConfig::load(&default).with_context(|| format!("loading {}", default.display()))
}

/// Flag raised by SIGINT or SIGTERM.
fn stop_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("installing signal handler")?;
    }
    Ok(stop)
}
