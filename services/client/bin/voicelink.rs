//! Command-line voice session client.
//!
//! Connects to a voice agent, streams the microphone (or a raw PCM file), plays
//! or records the agent's audio, and prints the conversation as it happens.
//! Runs until Ctrl+C, the optional duration elapses, or the session ends.

use anyhow::Context;
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use voicelink_client::{
    ClientConfig, PcmFileMicrophone, PcmFileSpeaker, VoiceClient, VoiceEvent,
    client::is_abnormal_close, event_channel,
};

#[derive(Debug, Parser)]
#[command(version, about = "Talk to a voice agent over WebSocket")]
struct Args {
    /// WebSocket endpoint. Overrides VOICE_WS_URL.
    #[arg(long)]
    url: Option<String>,

    /// Identifier sent with start_session. Overrides VOICE_USER_ID.
    #[arg(long)]
    user_id: Option<String>,

    /// Read microphone audio from a raw 16 kHz mono s16le file.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write agent audio to a raw s16le file instead of the speaker.
    #[arg(long)]
    output: Option<PathBuf>,

    /// End the session after this many seconds.
    #[arg(long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = match &args.url {
        Some(url) => ClientConfig::new(url),
        None => ClientConfig::from_env(),
    }
    .context("Failed to load configuration")?;
    if args.user_id.is_some() {
        config.user_id = args.user_id.clone();
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(url = %config.ws_url, "Configuration loaded");

    // --- 3. Build the Client ---
    let (events, mut rx) = event_channel();
    let mut builder = VoiceClient::builder(config).events(Arc::new(events));
    if let Some(path) = &args.input {
        builder = builder.microphone(Arc::new(PcmFileMicrophone::new(path)));
    }
    if let Some(path) = &args.output {
        builder = builder.speaker(Arc::new(PcmFileSpeaker::new(path)));
    }
    let client = builder.build();

    // --- 4. Run the Session ---
    client
        .start_session()
        .await
        .context("Failed to start voice session")?;

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C. Ending session...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed. Ending session...");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    VoiceEvent::SessionStarted(id) => println!("session {id}"),
                    VoiceEvent::StateChange(state) => println!("[{state}]"),
                    VoiceEvent::Transcript(entry) if entry.is_final => {
                        println!("{}: {}", entry.role, entry.text);
                    }
                    VoiceEvent::Interrupt => println!("(interrupted)"),
                    VoiceEvent::Error(e) if e.is_fatal() => {
                        warn!(error = %e, "Session failed");
                        eprintln!("{}", e.user_message());
                        break;
                    }
                    VoiceEvent::Error(e) => warn!(error = %e, "Session error"),
                    VoiceEvent::ConnectionClose { code, reason } if !is_abnormal_close(code) => {
                        info!(code, %reason, "Voice service ended the session");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // --- 5. Shut Down ---
    // Ending the session clears the transcript.
    let transcript = client.transcript();
    client.end_session().await;
    if !transcript.is_empty() {
        println!("\n--- transcript ---");
        for entry in transcript {
            println!("{}: {}", entry.role, entry.text);
        }
    }
    Ok(())
}
