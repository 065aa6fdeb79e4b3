//! Interactive console commands.
//!
//! Each line typed at a running node is parsed into a `Command`. Which
//! commands exist depends on the node's role.

use std::future::Future;
use thiserror::Error;

/// Which node the console is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleRole {
    Directory,
    Forwarder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a vote on all members (directory).
    CastVote { question: String, options: Vec<String> },
    /// Cast a ballot for a 1-based option of the current vote (forwarder).
    Vote(usize),
    /// Show results. A forwarder without an id queries its current vote.
    Results(Option<String>),
    /// Originate DATA toward a destination (forwarder).
    Send { addr: String, port: u16, data: String },
    Members,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0} (try .help)")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

const CASTVOTE_USAGE: &str = ".castvote <question> | <option1,option2,...>";
const VOTE_USAGE: &str = ".vote <option number>";
const RESULTS_USAGE: &str = ".results <voteId>";
const SEND_USAGE: &str = ".send <addr> <port> <data>";

/// Parse one console line. Blank lines yield `None`.
pub fn parse(role: ConsoleRole, line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let command = match (role, name) {
        (_, ".help") => Command::Help,
        (_, ".quit") => Command::Quit,
        (_, ".members") => Command::Members,
        (ConsoleRole::Directory, ".castvote") => parse_castvote(rest)?,
        (ConsoleRole::Directory, ".results") => {
            if rest.is_empty() {
                return Err(CommandError::Usage(RESULTS_USAGE));
            }
            Command::Results(Some(rest.to_string()))
        }
        (ConsoleRole::Forwarder, ".results") => {
            Command::Results((!rest.is_empty()).then(|| rest.to_string()))
        }
        (ConsoleRole::Forwarder, ".vote") => {
            let option = rest.parse().map_err(|_| CommandError::Usage(VOTE_USAGE))?;
            Command::Vote(option)
        }
        (ConsoleRole::Forwarder, ".send") => parse_send(rest)?,
        _ => return Err(CommandError::Unknown(name.to_string())),
    };
    Ok(Some(command))
}

fn parse_castvote(rest: &str) -> Result<Command, CommandError> {
    let (question, options) = rest
        .split_once('|')
        .ok_or(CommandError::Usage(CASTVOTE_USAGE))?;
    let question = question.trim();
    let options: Vec<String> = options
        .split(',')
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .map(String::from)
        .collect();
    if question.is_empty() || options.is_empty() {
        return Err(CommandError::Usage(CASTVOTE_USAGE));
    }
    Ok(Command::CastVote {
        question: question.to_string(),
        options,
    })
}

fn parse_send(rest: &str) -> Result<Command, CommandError> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let (Some(addr), Some(port), Some(data)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CommandError::Usage(SEND_USAGE));
    };
    let port = port.parse().map_err(|_| CommandError::Usage(SEND_USAGE))?;
    Ok(Command::Send {
        addr: addr.to_string(),
        port,
        data: data.trim().to_string(),
    })
}

/// Help text for a role.
pub fn help(role: ConsoleRole) -> String {
    let specific = match role {
        ConsoleRole::Directory => format!(
            "  {CASTVOTE_USAGE}\n      open a vote on every member\n  \
             {RESULTS_USAGE}\n      show the tally for a vote\n"
        ),
        ConsoleRole::Forwarder => format!(
            "  {VOTE_USAGE}\n      cast a ballot on the current vote\n  \
             .results [voteId]\n      ask the directory for results (default: current vote)\n  \
             {SEND_USAGE}\n      send data anonymously through the overlay\n"
        ),
    };
    format!(
        "Commands:\n{specific}  .members\n      list known members\n  \
         .help\n      show this help\n  .quit\n      shut down this node"
    )
}

/// Run one console command, abandoning it if `interrupt` completes first.
///
/// Returns whether the console should keep reading commands. An interrupted
/// command always stops the console, so a command stuck on a stalled peer
/// never delays shutdown.
pub async fn interruptible<C, I>(command: C, interrupt: I) -> bool
where
    C: Future<Output = bool>,
    I: Future,
{
    tokio::select! {
        keep_running = command => keep_running,
        _ = interrupt => false,
    }
}
