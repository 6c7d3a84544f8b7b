//! Kommandozeilen-Oberfläche für Anrufe
//!
//! Startet einen Anruf über den gewählten Transport und zeigt die Events
//! des Call Stores an. Eingaben: `m` + Enter schaltet Mute um, `q` + Enter
//! oder Ctrl-C beendet den Anruf.

use anyhow::Context;
use call_session::audio::CpalBackend;
use call_session::call_engine::{CpalMicrophone, PeerSessionClient};
use call_session::media_stream::MediaStreamClient;
use call_session::{AppConfig, CallApi, CallStore, CustomCallConfig, StoreEvent, Transport};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "call-session")]
#[command(version, about = "Real-time call session client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hört den Media-Stream eines Szenarios ab
    Stream {
        #[arg(short, long)]
        scenario: String,

        /// Session-ID für die Anzeige (Standard: zufällig)
        #[arg(long)]
        session: Option<String>,
    },

    /// Direkte WebRTC-Verbindung über den Signaling-Server
    Peer {
        #[arg(short, long)]
        session: String,

        /// Selbst ein Offer senden statt auf die Gegenseite zu warten
        #[arg(long)]
        offer: bool,
    },

    /// Löst einen Anruf aus und hört optional den Media-Stream ab
    Dial {
        #[arg(short, long)]
        scenario: String,

        #[arg(short, long)]
        phone: String,

        #[arg(long)]
        listen: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    call_session::init_logging();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Command::Stream { scenario, session } => {
            let transport = Arc::new(MediaStreamClient::new(
                config.api_url.clone(),
                config.reconnect,
            ));
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_call(transport, &session, &scenario, None).await
        }
        Command::Peer { session, offer } => {
            let peer = Arc::new(PeerSessionClient::new(
                config.peer_session(),
                Arc::new(CpalMicrophone),
            ));
            let offerer = offer.then(|| Arc::clone(&peer));
            run_call(peer, &session, "peer", offerer).await
        }
        Command::Dial {
            scenario,
            phone,
            listen,
        } => {
            let api = CallApi::new(&config.api_url)?;
            let response = api
                .initiate_custom_call(&CustomCallConfig {
                    scenario_id: scenario.clone(),
                    phone_number: phone,
                })
                .await
                .context("failed to initiate call")?;
            println!("{} (call sid {})", response.message, response.call_sid);

            if !listen {
                return Ok(());
            }
            let transport = Arc::new(MediaStreamClient::new(
                config.api_url.clone(),
                config.reconnect,
            ));
            run_call(transport, &response.call_sid, &scenario, None).await
        }
    }
}

async fn run_call(
    transport: Arc<dyn Transport>,
    session_id: &str,
    scenario: &str,
    offerer: Option<Arc<PeerSessionClient>>,
) -> anyhow::Result<()> {
    let store = CallStore::new(transport, Arc::new(CpalBackend));
    let mut events = store.subscribe();

    let call = store.start_call(session_id, scenario).await?;
    println!(
        "Call {} active over {} (started {})",
        call.session_id,
        call.transport,
        call.started_at.format("%H:%M:%S")
    );

    if let Some(peer) = offerer {
        peer.send_offer().await.context("failed to send offer")?;
    }

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StoreEvent::CallEnded) => {
                    println!("Call ended");
                    break;
                }
                Ok(event) => render(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} store events", n),
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => match line?.as_deref().map(str::trim) {
                Some("m") => match store.toggle_mute().await {
                    Ok(_) => {}
                    Err(e) => eprintln!("{}", e),
                },
                Some("q") | None => {
                    if let Some(stats) = store.playback_stats() {
                        tracing::debug!("Playback: {:?}", stats);
                    }
                    break;
                }
                Some(_) => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if store.active_call().is_some() {
        store.end_call().await?;
        println!("Call ended");
    }

    if let Some(e) = store.last_error() {
        tracing::warn!("Last call error: {}", e);
    }
    Ok(())
}

fn render(event: &StoreEvent) {
    match event {
        StoreEvent::CallStarted(call) => println!("Connected: {}", call.session_id),
        StoreEvent::StreamStarted { stream_sid } => println!("Stream started: {}", stream_sid),
        StoreEvent::MuteChanged { muted } => {
            println!("{}", if *muted { "Muted" } else { "Unmuted" })
        }
        StoreEvent::Error(e) => eprintln!("Error: {}", e),
        StoreEvent::CallEnded => {}
    }
}
