#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tandem_common::helpers::env_bool;
use tandem_common::{EngineSettings, MediaMode, MediaSettings, TraversalServer};
use tandem_media::{SyntheticBackend, SyntheticConfig};
use tandem_session::{
    channel_pair, ConnectionState, EventStream, Orchestrator, SessionConfig, SessionEvent,
    SignalingClient,
};
use tokio::time;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandem-call", about = "Peer-to-peer call with synthetic media")]
struct Args {
    /// JSON engine settings; omitted fields keep their defaults.
    #[arg(long, env = "TANDEM_SETTINGS")]
    settings: Option<PathBuf>,
    #[arg(long, default_value = "video+audio")]
    mode: MediaMode,
    /// Also enabled by `TANDEM_MIRROR=1`.
    #[arg(long)]
    mirror: bool,
    #[arg(long, default_value_t = 1.0)]
    quality: f32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two sessions in this process, signaling over an in-memory channel.
    Loopback {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Fraction of the caller's media datagrams to drop.
        #[arg(long, default_value_t = 0.0)]
        loss: f32,
    },
    /// One session, signaling through a WebSocket relay.
    Connect {
        #[arg(long, env = "TANDEM_SIGNAL_URL")]
        signal_url: String,
        /// Send the first offer.
        #[arg(long)]
        caller: bool,
        /// Extra STUN servers (`stun:host:port`).
        #[arg(long = "stun")]
        stun: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tandem_common::init_tracing();

    let args = Args::parse();
    let mut engine = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineSettings::from_json(&text)?
        }
        None => EngineSettings::default(),
    };
    let media = MediaSettings {
        mode: args.mode,
        mirror: args.mirror || env_bool("TANDEM_MIRROR", false),
        quality: args.quality,
    };
    media.validate()?;

    match args.command {
        Command::Loopback { seconds, loss } => {
            engine.bind_addr = "127.0.0.1:0".into();
            loopback(engine, media, Duration::from_secs(seconds), loss).await
        }
        Command::Connect {
            signal_url,
            caller,
            stun,
        } => {
            engine
                .traversal_servers
                .extend(stun.into_iter().map(TraversalServer::stun));
            connect(engine, media, &signal_url, caller).await
        }
    }
}

async fn loopback(
    engine: EngineSettings,
    media: MediaSettings,
    duration: Duration,
    loss: f32,
) -> Result<()> {
    let backend = Arc::new(SyntheticBackend::new(SyntheticConfig::default()));
    let (a_signal, b_signal) = channel_pair();

    let mut caller_engine = engine.clone();
    caller_engine.simulated_send_loss = loss;
    caller_engine.validate()?;

    let caller = SessionConfig {
        engine: caller_engine,
        media,
        initiate: true,
    };
    let callee = SessionConfig {
        engine,
        media,
        initiate: false,
    };
    let (a, a_events) = Orchestrator::connect(caller, backend.clone(), a_signal).await?;
    let (b, b_events) = Orchestrator::connect(callee, backend, b_signal).await?;
    info!("loopback call {} <-> {}", a.session_id(), b.session_id());

    let a_watch = tokio::spawn(report("caller", a_events));
    let b_watch = tokio::spawn(report("callee", b_events));

    let mut stats = time::interval(Duration::from_secs(1));
    let deadline = time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            _ = stats.tick() => {
                print_stats("caller", &a).await;
                print_stats("callee", &b).await;
            }
        }
    }

    a.stop().await;
    b.stop().await;
    a_watch.abort();
    b_watch.abort();
    Ok(())
}

async fn connect(
    engine: EngineSettings,
    media: MediaSettings,
    signal_url: &str,
    initiate: bool,
) -> Result<()> {
    engine.validate()?;
    let client = SignalingClient::connect(signal_url).await?;
    let backend = Arc::new(SyntheticBackend::new(SyntheticConfig::default()));
    let config = SessionConfig {
        engine,
        media,
        initiate,
    };
    let (session, events) = Orchestrator::connect(config, backend, client.into_channel()).await?;
    info!("session {} waiting on {}", session.session_id(), signal_url);

    let mut watch = tokio::spawn(report("local", events));
    let mut stats = time::interval(Duration::from_secs(2));
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            ended = &mut watch => {
                break match ended {
                    Ok(ConnectionState::Failed) => Err(anyhow!("call failed")),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
            _ = stats.tick() => print_stats("local", &session).await,
        }
    };

    watch.abort();
    session.stop().await;
    outcome
}

/// Log events until the call ends; returns the final state.
async fn report(label: &'static str, mut events: EventStream) -> ConnectionState {
    let mut frames = 0u64;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                info!(peer = label, "state {}", state);
                if matches!(state, ConnectionState::Closed | ConnectionState::Failed) {
                    return state;
                }
            }
            SessionEvent::TrackAdded { mid, kind, .. } => {
                info!(peer = label, "remote {} track on mid {}", kind, mid);
            }
            SessionEvent::TrackEnabled { mid, enabled } => {
                info!(peer = label, "remote mid {} enabled={}", mid, enabled);
            }
            SessionEvent::FrameReady { .. } => {
                frames += 1;
                if frames % 100 == 0 {
                    info!(peer = label, "{} frames received", frames);
                }
            }
            SessionEvent::Error(e) => warn!(peer = label, "session error: {}", e),
        }
    }
    ConnectionState::Closed
}

async fn print_stats(label: &str, session: &Orchestrator) {
    match session.stats().await {
        Ok(stats) => match serde_json::to_string(&stats) {
            Ok(json) => println!("{label}: {json}"),
            Err(e) => warn!("stats not serializable: {}", e),
        },
        Err(e) => warn!(peer = label, "stats unavailable: {}", e),
    }
}
