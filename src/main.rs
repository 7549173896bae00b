#![deny(clippy::all)]

mod api;
mod audio;
mod channel;
mod config;
mod error;
mod rtc;
mod session;
mod storage;

use anyhow::{Context, Result};
use api::{ApiClient, EndOutcome};
use audio::CpalDevices;
use clap::{Parser, Subcommand};
use config::Config;
use error::SessionError;
use rtc::{HttpSignaling, WebRtcPeers};
use session::{
    DisplayState, Session, SessionController, SessionDeps, SessionOutcome, SessionUpdate,
    SpeakerLabels,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "interview-client")]
#[command(about = "Voice interview client with live transcript and agent-driven visuals", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file replacing the embedded defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session on the server and start the interview
    New {
        /// Interview prompt for the agent
        #[arg(short, long)]
        prompt: String,
        /// Image or video files the agent may show (repeatable)
        #[arg(short, long = "asset", required = true)]
        assets: Vec<PathBuf>,
        /// Optional knowledge base document
        #[arg(long)]
        kb: Option<PathBuf>,
        /// Save the creation response here so the session can be joined later
        #[arg(short, long)]
        save: Option<PathBuf>,
        /// Create the session without starting it
        #[arg(long)]
        no_run: bool,
    },
    /// Start the interview for a saved session
    Join {
        /// Creation response saved by `new --save`
        descriptor: PathBuf,
    },
    /// Fetch the server-side transcript of a session
    Transcript {
        session_id: String,
        /// Plain text rendering instead of structured turns
        #[arg(long)]
        text: bool,
        /// Also fetch the session summary
        #[arg(long)]
        summary: bool,
    },
    /// End a session on the server
    End { session_id: String },
    /// Show session details and whether its audio connection is active
    Status { session_id: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config);
    debug!(server = %config.server.base_url, "Configuration loaded");

    let config = Arc::new(config);
    let api = ApiClient::new(&config).context("Failed to create API client")?;

    match cli.command {
        Commands::New {
            prompt,
            assets,
            kb,
            save,
            no_run,
        } => {
            let descriptor = api
                .create_session(&prompt, &assets, kb.as_deref())
                .await
                .context("Failed to create session")?;
            println!("Session created: {}", descriptor.session_id);
            if let Some(link) = &descriptor.frontend_link {
                println!("Frontend: {}", link);
            }
            if let Some(path) = &save {
                storage::save_descriptor(path, &descriptor)
                    .context("Failed to save session descriptor")?;
            }
            if no_run {
                return Ok(());
            }
            let session = Session::from_descriptor(descriptor, api.base_url())
                .context("Server returned an invalid asset manifest")?;
            run_session(config, &api, session).await
        }
        Commands::Join { descriptor } => {
            let descriptor = storage::load_descriptor(&descriptor)
                .with_context(|| format!("Failed to load {:?}", descriptor))?;
            let session = Session::from_descriptor(descriptor, api.base_url())
                .context("Saved session has an invalid asset manifest")?;
            run_session(config, &api, session).await
        }
        Commands::Transcript {
            session_id,
            text,
            summary,
        } => {
            if text {
                let rendered = api
                    .transcript_text(&session_id)
                    .await
                    .context("Failed to fetch transcript")?;
                println!("{}", rendered);
            } else {
                let artifact = api
                    .transcript(&session_id)
                    .await
                    .context("Failed to fetch transcript")?;
                let labels = speaker_labels(&config);
                for turn in &artifact.turns {
                    println!("[{}] {}: {}", turn.ts, labels.label(turn.speaker), turn.text);
                }
            }
            if summary {
                let summary = api
                    .summary(&session_id)
                    .await
                    .context("Failed to fetch summary")?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
        Commands::End { session_id } => {
            match api
                .end_session(&session_id)
                .await
                .context("Failed to end session")?
            {
                EndOutcome::Ended { summary } => {
                    println!("Session {} ended", session_id);
                    if let Some(summary) = summary {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    }
                }
                EndOutcome::AlreadyEnded => println!("Session {} was already ended", session_id),
            }
            Ok(())
        }
        Commands::Status { session_id } => {
            let info = api
                .session_info(&session_id)
                .await
                .context("Failed to fetch session")?;
            let connection = api
                .connection_status(&session_id)
                .await
                .context("Failed to fetch connection status")?;
            println!("Session:     {}", info.session_id);
            println!("Created:     {}", info.created_at);
            println!("Ended:       {}", info.ended_at.as_deref().unwrap_or("-"));
            println!("Assets:      {}", info.asset_count);
            println!("Transcript:  {} turns", info.transcript_count);
            println!(
                "Audio:       {}",
                if connection.is_active { "active" } else { "inactive" }
            );
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over `logging.filter`
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn speaker_labels(config: &Config) -> SpeakerLabels {
    SpeakerLabels {
        user: config.transcript.user_label.clone(),
        agent: config.transcript.agent_label.clone(),
    }
}

/// Run one interview until Ctrl-C or transport loss, then end it on the server
async fn run_session(config: Arc<Config>, api: &ApiClient, session: Session) -> Result<()> {
    let signaling = HttpSignaling::new(&config.server.base_url, config.request_timeout())
        .context("Failed to set up signaling")?;
    let deps = SessionDeps {
        devices: Arc::new(CpalDevices),
        peers: Arc::new(WebRtcPeers),
        signaling: Arc::new(signaling),
    };
    let mut controller = SessionController::new(Arc::clone(&config), deps);
    let labels = speaker_labels(&config);
    let render = tokio::spawn(render_updates(controller.subscribe(), labels.clone()));

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping session");
            stop.stop();
        }
    });

    let session_id = session.id.clone();
    println!("Connecting... press Ctrl-C to end the interview");
    let outcome = match controller.start(session).await {
        Ok(()) => controller.run().await,
        Err(SessionError::Cancelled) => SessionOutcome::Stopped,
        Err(e) => {
            drop(controller);
            let _ = render.await;
            return Err(e).context("Failed to start session");
        }
    };

    if outcome == SessionOutcome::TransportLost {
        eprintln!("Audio connection lost. Run `join` to reconnect.");
    }

    match api.end_session(&session_id).await {
        Ok(EndOutcome::Ended { .. }) => info!(session_id = %session_id, "Session ended on server"),
        Ok(EndOutcome::AlreadyEnded) => debug!(session_id = %session_id, "Session already ended"),
        Err(e) => warn!("Failed to end session on server: {}", e),
    }

    let text = controller.transcript().render_text(&labels);
    drop(controller);
    let _ = render.await;

    if config.transcript.save_on_stop && !text.trim().is_empty() {
        let dir = storage::transcripts_dir(&config)
            .context("No transcript directory configured and no Documents directory found")?;
        let path = storage::save_transcript(&dir, &session_id, &text)
            .context("Failed to save transcript")?;
        println!("Transcript saved to {}", path.display());
    }
    Ok(())
}

/// Print what the controller publishes until it goes away
async fn render_updates(mut updates: broadcast::Receiver<SessionUpdate>, labels: SpeakerLabels) {
    loop {
        match updates.recv().await {
            Ok(SessionUpdate::Transcript(entry)) => {
                if entry.is_final {
                    println!("{}: {}", labels.label(entry.speaker), entry.text);
                } else {
                    trace!(seq = entry.seq, "Interim: {}", entry.text);
                }
            }
            Ok(SessionUpdate::Display(DisplayState::Empty)) => println!("[display cleared]"),
            Ok(SessionUpdate::Display(state)) => {
                if let Some(asset) = state.asset() {
                    match state.effective_clip() {
                        Some(clip) => println!(
                            "[showing {} \"{}\" {} from {}s to {}]",
                            asset.id,
                            asset.title,
                            asset.url,
                            clip.start.unwrap_or(0.0),
                            clip.end.map_or("end".to_string(), |end| format!("{}s", end)),
                        ),
                        None => println!("[showing {} \"{}\" {}]", asset.id, asset.title, asset.url),
                    }
                }
            }
            Ok(SessionUpdate::Activity(activity)) => println!("[{} is {}]", labels.agent, activity),
            Ok(SessionUpdate::Connection(status)) => info!(
                lifecycle = status.lifecycle.as_str(),
                phase = %status.phase,
                recording = status.recording,
                "Connection status"
            ),
            Ok(SessionUpdate::ChannelLost { reason }) => {
                eprintln!("Live updates lost ({}); audio continues", reason)
            }
            Ok(SessionUpdate::Levels { inbound, outbound }) => {
                trace!(inbound, outbound, "Levels")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Render fell behind, {} updates skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
