//! crowds: runs one node of a Crowds anonymity overlay.
//!
//! A directory (blender) admits forwarders and tallies votes. A forwarder
//! (jondo) joins the directory and relays traffic for everyone else. Both
//! accept console commands on stdin while serving.

use anyhow::Result;
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crowds_daemon::console::{self, Command, ConsoleRole};
use crowds_daemon::{
    BlenderConfig, Cli, Directory, Forwarder, ForwarderEvent, JondoConfig, NodeConfig, Server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,crowds_daemon=debug"
    } else {
        "info,crowds_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.into_config()? {
        NodeConfig::Blender(config) => run_directory(config).await,
        NodeConfig::Jondo(config) => run_forwarder(config).await,
    }
}

/// Read stdin on a dedicated thread so a blocked read never holds up shutdown.
fn console_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_directory(config: BlenderConfig) -> Result<()> {
    info!("Starting directory on {}:{} with {} thread(s)", config.addr, config.port, config.threads);

    let server = Server::bind(&config.addr, config.port, config.threads).await?;
    let shutdown = server.shutdown_handle();
    let directory = Arc::new(Directory::new(config.node()));
    let server_task = tokio::spawn(server.run(Arc::clone(&directory)));

    info!("Directory running. Type .help for commands, Ctrl+C to stop.");
    let mut lines = console_lines();
    loop {
        tokio::select! {
            Some(line) = lines.recv() => {
                // A command stalled on a peer must not hide Ctrl+C.
                if !console::interruptible(directory_command(&directory, &line), tokio::signal::ctrl_c()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    shutdown.shutdown();
    server_task.await??;
    Ok(())
}

/// Run one directory console line. Returns false on `.quit`.
async fn directory_command(directory: &Directory, line: &str) -> bool {
    let command = match console::parse(ConsoleRole::Directory, line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            println!("{}", e);
            return true;
        }
    };

    match command {
        Command::CastVote { question, options } => {
            match directory.create_and_broadcast_vote(&question, options).await {
                Ok(vote) => {
                    println!("Opened vote {}: {}", vote.vote_id, question);
                    for (i, option) in vote.options.iter().enumerate() {
                        println!("  {}. {}", i + 1, option);
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
        Command::Results(Some(vote_id)) => {
            let results = directory.results(&vote_id);
            if results.is_empty() {
                println!("No ballots counted for {}", vote_id);
            }
            for line in results {
                println!("  {}", line);
            }
        }
        Command::Members => print_members(&directory.members()),
        Command::Help => println!("{}", console::help(ConsoleRole::Directory)),
        Command::Quit => return false,
        other => println!("Not available on the directory: {:?}", other),
    }
    true
}

async fn run_forwarder(config: JondoConfig) -> Result<()> {
    let policy = config.policy()?;
    info!(
        "Starting forwarder on {}:{} with {} thread(s), directory {}:{}",
        config.addr, config.port, config.threads, config.blender_addr, config.blender_port
    );

    // Listen before joining so announcements sent during the join queue up.
    let server = Server::bind(&config.addr, config.port, config.threads).await?;
    let shutdown = server.shutdown_handle();

    let forwarder = match Forwarder::join(config.node(), config.directory(), policy).await {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!("Failed to join the overlay: {}", e);
            return Err(e.into());
        }
    };

    tokio::spawn(print_events(forwarder.subscribe()));
    let server_task = tokio::spawn(server.run(Arc::clone(&forwarder)));

    info!("Forwarder running. Type .help for commands, Ctrl+C to stop.");
    let mut lines = console_lines();
    loop {
        tokio::select! {
            Some(line) = lines.recv() => {
                // A command stalled on a peer must not hide Ctrl+C.
                if !console::interruptible(forwarder_command(&forwarder, &line), tokio::signal::ctrl_c()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    shutdown.shutdown();
    server_task.await??;
    Ok(())
}

/// Run one forwarder console line. Returns false on `.quit`.
async fn forwarder_command(forwarder: &Forwarder, line: &str) -> bool {
    let command = match console::parse(ConsoleRole::Forwarder, line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            println!("{}", e);
            return true;
        }
    };

    match command {
        Command::Vote(option) => match forwarder.cast_vote(option).await {
            Ok((ballot, hop)) => println!(
                "Ballot {} sent ({})",
                ballot.selection.as_deref().unwrap_or_default(),
                hop
            ),
            Err(e) => println!("{}", e),
        },
        Command::Results(vote_id) => {
            let vote_id = vote_id.or_else(|| forwarder.session().current_vote().map(|v| v.vote_id));
            let Some(vote_id) = vote_id else {
                println!("No vote is currently open; use .results <voteId>");
                return true;
            };
            match forwarder.query_results(&vote_id).await {
                Ok(()) => println!("Requested results for {}", vote_id),
                Err(e) => println!("Failed to query results: {}", e),
            }
        }
        Command::Send { addr, port, data } => {
            match forwarder.send_data(&addr, port, &data).await {
                Ok(hop) => println!("Sent ({})", hop),
                Err(e) => println!("Send failed: {:#}", e),
            }
        }
        Command::Members => print_members(&forwarder.members()),
        Command::Help => println!("{}", console::help(ConsoleRole::Forwarder)),
        Command::Quit => return false,
        other => println!("Not available on a forwarder: {:?}", other),
    }
    true
}

async fn print_events(mut events: broadcast::Receiver<ForwarderEvent>) {
    loop {
        match events.recv().await {
            Ok(ForwarderEvent::VoteOpened {
                vote_id,
                question,
                options,
            }) => {
                println!("New vote {}: {}", vote_id, question.unwrap_or_default());
                for (i, option) in options.iter().enumerate() {
                    println!("  {}. {}", i + 1, option);
                }
                println!("Cast with .vote <number>");
            }
            Ok(ForwarderEvent::ResultsReceived { vote_id, results }) => {
                println!("Results for {}:", vote_id);
                for line in results {
                    println!("  {}", line);
                }
            }
            Ok(ForwarderEvent::Delivered { data }) => println!("Received: {}", data),
            Ok(ForwarderEvent::MemberAdded { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Console missed {} event(s)", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_members(members: &[crowds_core::Node]) {
    println!("{} member(s):", members.len());
    for member in members {
        println!("  {} ({})", member, member.uid());
    }
}
