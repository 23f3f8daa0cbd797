//! mmlive - headless live voice session
//!
//! Talks to the Gemini Live API through the default PulseAudio source and
//! sink. Set `GEMINI_API_KEY`; other settings come from the JSON store named
//! by `MMLIVE_CONFIG` (default `mmlive.json`) and `MMLIVE_*` overrides.

use anyhow::Context;
use mmlive::devices::SystemDevices;
use mmlive::transport::WsConnector;
use mmlive::{JsonFileStore, LiveConfig, SessionController, SessionState, ToolRegistry, UiEvent};
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn demo_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_fn(
            "get_current_time",
            "Current local date and time",
            json!({"type": "object", "properties": {}}),
            |_| Ok(json!(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())),
        )
        .register_fn(
            "roll_dice",
            "Roll a die with the given number of sides",
            json!({
                "type": "object",
                "properties": {"sides": {"type": "integer", "minimum": 2}},
                "required": ["sides"]
            }),
            |args| {
                let sides = args["sides"].as_u64().filter(|&s| s >= 2).ok_or("sides must be an integer >= 2")?;
                Ok(json!(rand::rng().random_range(1..=sides)))
            },
        );
    registry
}

/// Log a UI event. Returns true once the session has ended.
fn show(event: UiEvent) -> bool {
    match event {
        UiEvent::ConnectionState(state) => {
            info!("Session state: {:?}", state);
            return state.is_terminal();
        }
        UiEvent::Transcript(entry) => info!("[{:?}] {}", entry.role, entry.text),
        UiEvent::ToolExecuting { name, active: true } => info!("Running tool {}", name),
        UiEvent::ToolExecuting { name, active: false } => info!("Tool {} done", name),
        UiEvent::Warning(message) => warn!("{}", message),
        UiEvent::Error(message) => error!("{}", message),
    }
    false
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting mmlive");

    let store_path = std::env::var("MMLIVE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("mmlive.json"));
    let mut store = JsonFileStore::open(&store_path).with_context(|| format!("Failed to open {:?}", store_path))?;
    let mut config = LiveConfig::from_store(&store)?;
    config.apply_env()?;
    if config.api_key.is_empty() {
        anyhow::bail!("GEMINI_API_KEY is not set");
    }
    config.persist(&mut store).context("Failed to save settings")?;

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(WsConnector::new(&config));
    let (controller, inbox) = SessionController::new(
        config,
        Arc::new(SystemDevices::default()),
        connector,
        Arc::new(demo_tools()),
    );
    let controller = controller.with_ui(ui_tx);
    let handle = controller.handle();
    let actor = tokio::spawn(controller.run(inbox));

    handle.start()?;
    info!("Listening. Press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Stopping session");
                break;
            }
            event = ui_rx.recv() => match event {
                Some(event) => {
                    if show(event) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    handle.shutdown()?;
    let report = actor.await.context("Session controller panicked")?;
    while let Ok(event) = ui_rx.try_recv() {
        show(event);
    }

    match report {
        Some(report) if report.final_state == SessionState::Error => {
            anyhow::bail!("Session failed: {:?}", report.cause)
        }
        Some(report) => info!(
            "Session {} ended with {} transcript entries",
            report.session_id, report.transcript_entries
        ),
        None => info!("No session was started"),
    }
    Ok(())
}
