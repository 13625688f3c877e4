//! Command-line front end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio::net::TcpListener;

use crate::commit::{recover, MigrationEnv, Recovery};
use crate::config::MigrationConfig;
use crate::session::{Role, SessionHandle, Status};
use crate::transport::{PeerLink, TcpChannel};

/// Move an account between two devices.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML file with session tunables
    #[arg(long, global = true, env = "PEERMIGRATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Account data directory
    #[arg(long, env = "PEERMIGRATE_DATA_DIR")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for a peer and swap accounts with it
    Offer {
        /// Address to listen on, e.g. 0.0.0.0:7420
        #[arg(long)]
        listen: String,
    },
    /// Dial a peer and swap accounts with it
    Join {
        /// Address of the offering peer
        #[arg(long)]
        connect: String,
    },
    /// Finish or discard an interrupted migration
    Recover,
    /// Report marker and staging state
    Status,
}

/// Run the parsed command. Returns false when a session did not succeed.
pub async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => MigrationConfig::load(path)?,
        None => MigrationConfig::default(),
    };
    let env = MigrationEnv::file_backed(&cli.data_dir);

    match cli.command {
        Command::Offer { listen } => {
            refuse_if_interrupted(&env)?;
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to listen on {}", listen))?;
            eprintln!("Waiting for a peer on {}", listener.local_addr()?);
            let link = TcpChannel::accept(listener).await?;
            migrate(Role::Responder, config, env, link).await
        }
        Command::Join { connect } => {
            refuse_if_interrupted(&env)?;
            let link = TcpChannel::connect(&connect, config.connect_timeout()).await?;
            migrate(Role::Initiator, config, env, link).await
        }
        Command::Recover => {
            let outcome = recover(&env)?;
            let message = match outcome {
                Recovery::Clean => "Nothing to recover",
                Recovery::Committed => "Interrupted migration committed",
                Recovery::Canceled => "Unfinished migration discarded",
                Recovery::StaleStagingRemoved => "Leftover staging removed",
            };
            println!("{}", message);
            Ok(true)
        }
        Command::Status => {
            let layout = &env.layout;
            let report = serde_json::json!({
                "data_dir": layout.data_dir(),
                "session": layout.read_marker(),
                "in_progress": layout.has_marker(),
                "transfer_done": layout.is_done(),
                "staging": layout.has_staging(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }
    }
}

fn refuse_if_interrupted(env: &MigrationEnv) -> Result<()> {
    if env.layout.has_marker() {
        anyhow::bail!(
            "An interrupted migration was found in {}; run `peermigrate recover` first",
            env.layout.data_dir().display()
        );
    }
    Ok(())
}

async fn migrate(
    role: Role,
    config: MigrationConfig,
    env: MigrationEnv,
    link: PeerLink,
) -> Result<bool> {
    let handle = SessionHandle::spawn(role, config, env, link)?;
    let mut updates = handle.subscribe();

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = updates.borrow_and_update().clone();
                render(&bar, &status);
                if status.state.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("canceling");
                handle.cancel();
            }
        }
    }

    let status = handle.wait().await?;
    render(&bar, &status);
    bar.finish();

    if status.is_success() {
        eprintln!("Migration complete");
    } else if status.canceled {
        eprintln!(
            "Migration canceled{}",
            status
                .error_code
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        );
    } else {
        eprintln!(
            "Migration failed{}",
            status
                .error_code
                .map(|c| format!(": {}", c))
                .unwrap_or_default()
        );
    }
    Ok(status.is_success())
}

fn render(bar: &ProgressBar, status: &Status) {
    bar.set_position(u64::from(status.percent));
    bar.set_message(format!(
        "{} sent {}/{} received {}/{}",
        status.state,
        status.bytes_sent,
        status.send_total,
        status.bytes_received,
        status.receive_total
    ));
}
