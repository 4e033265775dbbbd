// Statekeeper - save-state coordination for single-instance emulator sessions
//
// This is the library crate containing the queue, scheduler, rewind and slot logic.
// The binary crate (main.rs) runs a headless session against a simulated engine.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod session;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::Metrics;
pub use models::{SessionSettings, SessionState, SessionStatus, Settings};
pub use services::{OperationQueue, QueueError, RomIdentity, SlotOutcome};
pub use session::{Notification, Notifier, SessionController};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
