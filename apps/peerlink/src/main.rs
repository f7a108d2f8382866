use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use peerlink_core::events::PeerEvent;
use peerlink_core::identity::{LocalIdentity, PeerProfile};
use peerlink_core::network::{InitiateOptions, PeerNetwork};
use peerlink_core::rtc::webrtc::WebRtcFactory;
use peerlink_core::session::SessionState;
use peerlink_core::logging::{self, LogSettings, Verbosity};
use peerlink_core::PeerConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "peerlink",
    about = "Peer-to-peer links for LAN games over WebRTC data channels",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(
        long,
        global = true,
        env = "PEERLINK_NAME",
        default_value = "player",
        help = "Display name announced to peers"
    )]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PEERLINK_LOG_LEVEL",
        default_value_t = Verbosity::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: Verbosity,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PEERLINK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_settings(&self) -> LogSettings {
        LogSettings {
            verbosity: self.level,
            file: self.file.clone(),
            ..LogSettings::default()
        }
        .with_env()
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a group and connect to everyone in it.
    Join {
        /// Group id; a `<name>@<n>` id is generated when omitted.
        group: Option<String>,
        /// Advertise a LAN server on this local port.
        #[arg(long, value_name = "PORT")]
        lan: Option<u16>,
    },
    /// Print an offer for manual exchange, then read the answer from stdin.
    Offer,
    /// Answer a pasted offer and print the reply.
    Answer { description: String },
    /// Classify the local NAT.
    Nat,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("peerlink: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_settings = cli.logging.to_settings();
    let _log_guard = logging::init(&log_settings).context("configuring logging")?;
    debug!(filter = %log_settings.directives(), log_file = ?log_settings.file, "logging configured");

    let config = PeerConfig::from_env();
    let identity = LocalIdentity::generate(PeerProfile {
        name: cli.name.clone(),
        ..PeerProfile::default()
    });
    let network = PeerNetwork::with_identity(config, Arc::new(WebRtcFactory::new()), None, identity);
    info!(local = %network.local_id(), "peerlink starting");

    match cli.command {
        Command::Join { group, lan } => join(&network, group, lan).await,
        Command::Offer => offer(&network).await,
        Command::Answer { description } => answer(&network, &description).await,
        Command::Nat => {
            network.ice().init().await;
            let verdict = network.refresh_nat().await;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(())
        }
    }
}

async fn join(network: &PeerNetwork, group: Option<String>, lan: Option<u16>) -> Result<()> {
    let mut events = network.subscribe();
    network.start().await;
    let group = network.join_group(group).await?;
    println!("joined {group} as {}", network.local_id());
    if let Some(port) = lan {
        network
            .advertise_lan(vec![peerlink_core::session::messages::LanServer {
                port,
                motd: String::new(),
            }])
            .await;
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    network.shutdown().await;
    Ok(())
}

async fn offer(network: &PeerNetwork) -> Result<()> {
    let mut events = network.subscribe();
    network.start().await;
    let session = network.initiate(InitiateOptions::default())?;
    let mut printed = false;
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            read = tokio::io::AsyncBufReadExt::read_line(&mut stdin, &mut line), if printed => {
                if read? == 0 {
                    break;
                }
                let pasted = line.trim().to_string();
                line.clear();
                if !pasted.is_empty() {
                    network.set_remote_description(&pasted)?;
                }
            }
            event = events.recv() => match event {
                Ok(PeerEvent::LocalDescription { session: id, description }) if id == session => {
                    println!("{description}");
                    printed = true;
                }
                Ok(event) => {
                    if finished(&event, &session) {
                        break;
                    }
                    report(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    network.shutdown().await;
    Ok(())
}

async fn answer(network: &PeerNetwork, description: &str) -> Result<()> {
    let mut events = network.subscribe();
    network.start().await;
    let session = network.set_remote_description(description)?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PeerEvent::LocalDescription { session: id, description }) if id == session => {
                    println!("{description}");
                }
                Ok(event) => {
                    if finished(&event, &session) {
                        bail!("session {session} ended");
                    }
                    report(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    network.shutdown().await;
    Ok(())
}

fn finished(event: &PeerEvent, session: &str) -> bool {
    match event {
        PeerEvent::ConnectionState { session: id, state, .. } => {
            id == session && *state == SessionState::Closed
        }
        PeerEvent::NoWinner { session: id, .. } => id == session,
        _ => false,
    }
}

fn report(event: &PeerEvent) {
    match event {
        PeerEvent::ConnectionState { session, remote, state } => {
            println!("{session} {state:?} ({})", remote.map(|id| id.to_string()).unwrap_or_default());
        }
        PeerEvent::Identity { peer: Some(peer), profile, .. } => println!("{peer} is {}", profile.name),
        PeerEvent::LanDiscovered { remote_port, local_port, motd, .. } => {
            println!("LAN server {motd:?} on remote port {remote_port} is at localhost:{local_port}");
        }
        PeerEvent::NoWinner { session, .. } => println!("{session}: no route to peer"),
        PeerEvent::NatType { verdict } => debug!(?verdict, "nat classified"),
        other => debug!(event = ?other, "event"),
    }
}
