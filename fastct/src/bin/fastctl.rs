//! Management client for a running fastct daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fastct::control::protocol::{Command, ReplyLine};
use fastct_core::{FormatOptions, Zone};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and manage fastct connection tracking", long_about = None)]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, short = 's', default_value = "/tmp/fastct.sock")]
    socket: PathBuf,

    /// Reply timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List tracked connections
    Dump {
        /// Only connections in this zone
        #[arg(long)]
        zone: Option<Zone>,
        /// Show connection ids and per-direction TCP states
        #[arg(long, short = 'm')]
        verbose: bool,
        /// Show packet and byte counters
        #[arg(long)]
        stats: bool,
    },
    /// Remove tracked connections
    Flush {
        /// Only connections in this zone
        #[arg(long)]
        zone: Option<Zone>,
    },
    /// Show tracker counters
    Stats,
    /// Show the connection limit
    GetLimit,
    /// Change the connection limit
    SetLimit { limit: u32 },
}

impl From<Action> for Command {
    fn from(action: Action) -> Self {
        match action {
            Action::Dump {
                zone,
                verbose,
                stats,
            } => Command::Dump {
                zone,
                opts: FormatOptions {
                    verbose,
                    print_stats: stats,
                },
            },
            Action::Flush { zone } => Command::Flush { zone },
            Action::Stats => Command::Stats,
            Action::GetLimit => Command::GetLimit,
            Action::SetLimit { limit } => Command::SetLimit(limit),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = Command::from(cli.command);

    let mut stream = UnixStream::connect(&cli.socket)
        .with_context(|| format!("connecting to {}", cli.socket.display()))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(cli.timeout)))
        .context("setting reply timeout")?;
    writeln!(stream, "{}", command).context("sending command")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in BufReader::new(stream).lines() {
        let line = line.context("reading reply")?;
        match ReplyLine::parse(&line) {
            ReplyLine::Payload(text) => writeln!(out, "{}", text)?,
            ReplyLine::Ok => return Ok(()),
            ReplyLine::Err(msg) => anyhow::bail!("{}: {}", command.name(), msg),
        }
    }

    anyhow::bail!("connection closed before the reply completed")
}
