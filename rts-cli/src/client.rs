//! Client commands: send, watch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use rts::{Block, BlockConfig, Command, ConnId, Event, Handler, Outcome};

use crate::OutputFormat;

/// Name of the single device connection.
const DEVICE: &str = "device";

/// Wait per reactor step.
const STEP: Duration = Duration::from_millis(100);

/// Arguments for `rtsmon send`.
///
/// Usage: `rtsmon send [OPTIONS] ADDRESS COMMAND...`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct SendArgs {
    /// Seconds to wait for the reply.
    #[arg(short = 't', long, default_value_t = 10)]
    pub timeout: u64,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Device address (host:port).
    pub address: String,

    /// Command and arguments.
    #[arg(required = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Arguments for `rtsmon watch`.
#[derive(clap::Args)]
pub struct WatchArgs {
    /// Also print debug messages.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Device address (host:port).
    pub address: String,
}

/// Opens a block with one outbound connection to `address`.
fn open(mut config: BlockConfig, address: &str) -> Result<(Block, ConnId)> {
    config.listen = None;
    let mut block = Block::new(config)?;
    block.set_address(DEVICE, address);
    let id = block.connect_device(DEVICE);
    Ok((block, id))
}

/// Waits for one command and the connection's own `info` to return.
#[derive(Default)]
struct Reply {
    command: String,
    outcome: Option<Outcome>,
    broken: Option<String>,
}

impl Handler for Reply {
    fn event(&mut self, _block: &mut Block, _conn: ConnId, event: &Event) {
        match event {
            Event::CommandReturned { command, outcome } if *command == self.command => {
                self.outcome = Some(*outcome);
            }
            Event::Broken { reason } => self.broken = Some(reason.clone()),
            _ => {}
        }
    }
}

pub fn send(config: BlockConfig, args: &SendArgs) -> Result<()> {
    let text = args.command.join(" ");
    let (mut block, id) = open(config, &args.address)?;
    block
        .connection_mut(id)
        .context("connection vanished")?
        .que_command(Command::new(text.as_str()));

    let mut reply = Reply {
        command: text.clone(),
        ..Reply::default()
    };
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let outcome = loop {
        block.run_once(&mut reply, STEP)?;
        if let Some(reason) = &reply.broken {
            bail!("{}: {reason}", args.address);
        }
        let idle = block.connection(id).is_some_and(rts::Connection::que_empty);
        if let (Some(outcome), true) = (reply.outcome, idle) {
            break outcome;
        }
        if Instant::now() > deadline {
            bail!("{}: no reply to {text:?}", args.address);
        }
    };

    let conn = block.connection(id).context("connection vanished")?;
    let values: BTreeMap<&str, String> = conn
        .values()
        .iter()
        .map(|v| (v.name(), v.encode()))
        .collect();
    match args.format {
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "command": text,
                "reply": outcome.code(),
                "state": conn.state().bits(),
                "values": values,
            });
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
        OutputFormat::Table => {
            println!("state: {} ({:#x})", conn.state_string(), conn.state().bits());
            for (name, raw) in &values {
                println!("{name:<24} {raw}");
            }
        }
    }
    if !outcome.is_ok() {
        bail!("{text}: failed with {:+04}", outcome.code());
    }
    Ok(())
}

/// Prints what the watched device reports.
struct Printer {
    debug: bool,
    broken: Option<String>,
}

impl Handler for Printer {
    fn event(&mut self, block: &mut Block, conn: ConnId, event: &Event) {
        match event {
            Event::StateChanged { new, message, .. } => match message {
                Some(m) => println!("state {new} ({:#x}): {m}", new.bits()),
                None => println!("state {new} ({:#x})", new.bits()),
            },
            Event::ValueChanged(name) => {
                if let Some(value) = block
                    .connection(conn)
                    .and_then(|c| c.value(name).ok())
                {
                    println!("{name} = {}", value.encode());
                }
            }
            Event::Message(m) if self.debug || m.is_not_debug() => {
                println!("{} {} {}: {}", m.time(), m.type_str(), m.originator(), m.text());
            }
            Event::Progress { start, end } => println!("progress {start} .. {end}"),
            Event::DataComplete {
                data_conn,
                chan,
                data,
                ..
            } => println!("data {data_conn}/{chan}: {} bytes", data.len()),
            Event::Broken { reason } => self.broken = Some(reason.clone()),
            _ => {}
        }
    }
}

pub fn watch(config: BlockConfig, args: &WatchArgs, stop: &AtomicBool) -> Result<()> {
    let (mut block, _) = open(config, &args.address)?;
    let mut printer = Printer {
        debug: args.debug,
        broken: None,
    };
    while !stop.load(Ordering::Relaxed) {
        block.run_once(&mut printer, STEP)?;
        if let Some(reason) = printer.broken.take() {
            bail!("{}: {reason}", args.address);
        }
    }
    Ok(())
}
