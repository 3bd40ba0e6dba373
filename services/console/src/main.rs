//! Console client for the tutoring bridge.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Initializing logging.
//! 3. Opening a bridge session and the local audio devices.
//! 4. Relaying typed input and printing transcript/tool activity until
//!    Ctrl+C or `/quit`.

use anyhow::Context;
use clap::Parser;
use socratic_bridge::capture::MicCapture;
use socratic_bridge::config::Config;
use socratic_bridge::session::BridgeSession;
use socratic_bridge::transport::TransportConfig;
use socratic_core::reconciler::BridgeEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "console", about = "Interactive console for the tutoring bridge")]
struct Args {
    /// Backend WebSocket base URL; falls back to BRIDGE_WS_URL.
    #[arg(long)]
    url: Option<String>,

    /// Stable user id; falls back to BRIDGE_USER_ID or a random id.
    #[arg(long)]
    user: Option<String>,

    /// Text-only session: no microphone capture, no speaker playback.
    #[arg(long)]
    text_only: bool,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the session.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn print_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::ToolStarted { name } => println!("[tool] {name} started"),
        BridgeEvent::ToolCompleted { name, success } => {
            println!("[tool] {name} {}", if *success { "done" } else { "failed" });
        }
        BridgeEvent::ExperimentGenerated { .. } => println!("[canvas] experiment generated"),
        BridgeEvent::ExperimentModified { .. } => println!("[canvas] experiment modified"),
        BridgeEvent::ComparisonCreated { .. } => println!("[canvas] comparison created"),
        BridgeEvent::ConceptExplained { .. } => println!("[canvas] concept explained"),
        BridgeEvent::CanvasReset => println!("[canvas] reset"),
        BridgeEvent::AgentTransition { from, to } => println!("[agent] {from} -> {to}"),
        BridgeEvent::TurnComplete {
            turn,
            was_interrupted,
        } => {
            if *was_interrupted {
                println!("[turn {turn}] complete (interrupted)");
            } else {
                println!("[turn {turn}] complete");
            }
        }
        BridgeEvent::BackendError { code, message } => {
            println!("[error {code}] {message}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let base_url = args.url.unwrap_or(config.ws_base_url);
    let user_id = args.user.unwrap_or(config.user_id);

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    // --- 3. Open the Bridge Session ---
    let (session, mut events) = BridgeSession::new(TransportConfig::new(base_url, &user_id));
    session.connect();
    info!(%user_id, "bridge session opened");

    let mut mic = None;
    if !args.text_only {
        session
            .initialize_audio()
            .await
            .context("Failed to open the output device")?;
        let audio_session = session.clone();
        mic = Some(
            MicCapture::start(move |frame| {
                audio_session.send_audio_frame(bytes::Bytes::from(frame));
            })
            .context("Failed to open the microphone")?,
        );
        info!("audio devices ready");
    }

    // --- 4. Relay stdin lines as typed messages ---
    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    let input_session = session.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "" => {}
                "/quit" => {
                    let _ = quit_tx.send(()).await;
                    break;
                }
                "/clear" => {
                    input_session.clear_transcript();
                    println!("[transcript cleared]");
                }
                text => input_session.send_text(text),
            }
        }
    });

    // --- 5. Print session activity until shutdown ---
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = quit_rx.recv() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => {
                    warn!("session loop ended");
                    break;
                }
            },
        }
    }

    // --- 6. Tear Down ---
    if let Some(mut mic) = mic {
        mic.stop();
    }
    session.disconnect();
    info!("Session has shut down.");
    Ok(())
}
