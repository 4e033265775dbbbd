//! Statekeeper - headless session driver
//!
//! Runs one emulation session against the simulated engine with the directory-backed
//! slot store, until Ctrl-C.
//!
//! # Execution Flow
//!
//! 1. Load `Statekeeper Data/Session Settings.yaml` (plus `STATEKEEPER__*` overrides)
//! 2. Initialize logging → `<log_dir>/statekeeper.<date>`
//! 3. Create the tokio runtime
//! 4. Start the session: auto-save counts down, rewind capture starts after its delay
//! 5. Advance the simulated engine one frame every 16ms
//! 6. On Ctrl-C: shut the session down (pending operations cancelled, in-flight one
//!    completes) and log the metrics summary
//!
//! # Usage
//!
//! ```text
//! statekeeper [ROM file name or URL]
//! ```

use anyhow::{Context, Result};
use statekeeper::services::{FileSlotStore, SimulatedEngine};
use statekeeper::{APP_NAME, ConfigManager, RomIdentity, SessionController, Settings, StateChange, VERSION};
use std::time::Duration;

const FRAME_TIME: Duration = Duration::from_millis(16);

fn main() -> Result<()> {
    let config_manager = ConfigManager::new("Statekeeper Data")?;
    let settings = config_manager.load_settings()?;

    let _guard = statekeeper::logging::setup_logging_with_console(
        &settings.storage.log_dir,
        "statekeeper",
        settings.session.debug_mode,
        true,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("statekeeper-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let source = std::env::args().nth(1).unwrap_or_else(|| "demo.rom".to_string());
    let result = runtime.block_on(run(settings, &source));

    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Application shutdown complete");
    result
}

async fn run(settings: Settings, source: &str) -> Result<()> {
    let rom = RomIdentity::from_source(None, source);
    let store = FileSlotStore::new(&settings.storage.save_dir);
    let session = SessionController::new(settings.session, SimulatedEngine::new(), store, rom);

    let mut changes = session.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            match change {
                StateChange::AutoSaveChanged { state, progress, .. } if progress % 25 == 0 => {
                    tracing::debug!("Auto-save {:?} at {}%", state, progress);
                }
                StateChange::AutoSaveChanged { .. } | StateChange::RewindChanged { .. } => {}
                other => tracing::info!("{:?}", other),
            }
        }
    });

    let mut notifications = session.subscribe_notifications();
    let notices = tokio::spawn(async move {
        while let Ok(note) = notifications.recv().await {
            tracing::info!("[{:?}] {}: {}", note.kind, note.title, note.message);
        }
    });

    session.start();

    let engine = std::sync::Arc::clone(session.engine());
    let frames = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_TIME);
        loop {
            ticker.tick().await;
            engine.advance(1);
        }
    });

    tracing::info!("Session running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    frames.abort();
    session.shutdown().await;

    listener.abort();
    notices.abort();
    Ok(())
}
