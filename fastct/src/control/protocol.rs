//! Line-oriented control protocol.
//!
//! A client writes one command per line. The server answers with zero or
//! more payload lines followed by a status line, either `OK` or
//! `ERR <message>`.
//!
//! ```text
//! dump [zone=N] [verbose] [stats]
//! flush [zone=N]
//! stats
//! get-limit
//! set-limit N
//! ```

use fastct_core::{dump_lines, CtDpif, FormatOptions, Zone};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status line closing a successful reply.
pub const STATUS_OK: &str = "OK";

/// Prefix of the status line closing a failed reply.
pub const STATUS_ERR: &str = "ERR";

/// Longest accepted command line, in bytes.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid argument '{arg}' for {command}")]
    InvalidArgument { command: &'static str, arg: String },

    #[error("{0} requires an argument")]
    MissingArgument(&'static str),
}

/// A parsed control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Dump {
        zone: Option<Zone>,
        opts: FormatOptions,
    },
    Flush {
        zone: Option<Zone>,
    },
    Stats,
    GetLimit,
    SetLimit(u32),
}

impl Command {
    /// Command keyword, used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Dump { .. } => "dump",
            Command::Flush { .. } => "flush",
            Command::Stats => "stats",
            Command::GetLimit => "get-limit",
            Command::SetLimit(_) => "set-limit",
        }
    }

    /// Run the command against `dpif`, producing the payload lines.
    pub fn execute(&self, dpif: &dyn CtDpif) -> fastct_core::Result<Vec<String>> {
        match *self {
            Command::Dump { zone, opts } => dump_lines(dpif, zone, opts),
            Command::Flush { zone } => {
                let removed = dpif.ct_flush(zone)?;
                Ok(vec![format!("flushed={}", removed)])
            }
            Command::Stats => Ok(vec![dpif.ct_stats()?.to_string()]),
            Command::GetLimit => Ok(vec![format!("limit={}", dpif.ct_get_limit()?)]),
            Command::SetLimit(limit) => {
                dpif.ct_set_limit(limit)?;
                Ok(Vec::new())
            }
        }
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let keyword = words.next().ok_or(ParseError::Empty)?;

        match keyword {
            "dump" => {
                let mut zone = None;
                let mut opts = FormatOptions::default();
                for arg in words {
                    match arg {
                        "verbose" => opts.verbose = true,
                        "stats" => opts.print_stats = true,
                        _ => zone = Some(parse_zone("dump", arg)?),
                    }
                }
                Ok(Command::Dump { zone, opts })
            }
            "flush" => {
                let zone = match words.next() {
                    Some(arg) => Some(parse_zone("flush", arg)?),
                    None => None,
                };
                reject_extra("flush", words)?;
                Ok(Command::Flush { zone })
            }
            "stats" => {
                reject_extra("stats", words)?;
                Ok(Command::Stats)
            }
            "get-limit" => {
                reject_extra("get-limit", words)?;
                Ok(Command::GetLimit)
            }
            "set-limit" => {
                let arg = words.next().ok_or(ParseError::MissingArgument("set-limit"))?;
                let limit = arg.parse().map_err(|_| ParseError::InvalidArgument {
                    command: "set-limit",
                    arg: arg.to_string(),
                })?;
                reject_extra("set-limit", words)?;
                Ok(Command::SetLimit(limit))
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Command::Dump { zone, opts } => {
                if let Some(zone) = zone {
                    write!(f, " zone={}", zone)?;
                }
                if opts.verbose {
                    f.write_str(" verbose")?;
                }
                if opts.print_stats {
                    f.write_str(" stats")?;
                }
            }
            Command::Flush { zone: Some(zone) } => write!(f, " zone={}", zone)?,
            Command::SetLimit(limit) => write!(f, " {}", limit)?,
            _ => {}
        }
        Ok(())
    }
}

fn parse_zone(command: &'static str, arg: &str) -> Result<Zone, ParseError> {
    arg.strip_prefix("zone=")
        .and_then(|z| z.parse().ok())
        .ok_or_else(|| ParseError::InvalidArgument {
            command,
            arg: arg.to_string(),
        })
}

fn reject_extra<'a>(
    command: &'static str,
    mut words: impl Iterator<Item = &'a str>,
) -> Result<(), ParseError> {
    match words.next() {
        Some(arg) => Err(ParseError::InvalidArgument {
            command,
            arg: arg.to_string(),
        }),
        None => Ok(()),
    }
}

/// Render a full reply: payload lines then the status line.
pub fn render_reply(result: &Result<Vec<String>, String>) -> String {
    let mut out = String::new();
    match result {
        Ok(lines) => {
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(STATUS_OK);
        }
        Err(msg) => {
            out.push_str(STATUS_ERR);
            out.push(' ');
            // keep the status on one line
            out.push_str(&msg.replace('\n', " "));
        }
    }
    out.push('\n');
    out
}

/// Classify one reply line read by a client.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    Payload(&'a str),
    Ok,
    Err(&'a str),
}

impl<'a> ReplyLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if line == STATUS_OK {
            ReplyLine::Ok
        } else if line == STATUS_ERR {
            ReplyLine::Err("")
        } else if let Some(msg) = line.strip_prefix("ERR ") {
            ReplyLine::Err(msg)
        } else {
            ReplyLine::Payload(line)
        }
    }
}
