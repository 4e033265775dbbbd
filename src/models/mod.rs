//! Data models for the save-state coordinator.
//!
//! - [`SessionState`]: everything the UI renders about saves, auto-save and rewind
//! - [`Settings`]: session timing/policy and storage locations, loaded from
//!   `Session Settings.yaml` by [`ConfigManager`](crate::config::ConfigManager)
//! - [`MAX_CONCURRENT_ENGINE_OPERATIONS`]: the exclusivity limit for the emulator handle

pub mod config;
pub mod session_state;

pub use config::{SessionSettings, Settings, StorageSettings};
pub use session_state::{
    AutoSaveState, HardcoreRestrictions, SessionState, SessionStatus, SlotModalMode,
};

/// Maximum number of operations touching the emulator handle at once.
///
/// The engine is not reentrant: a capture racing a state replace produces a torn
/// snapshot. [`OperationQueue`](crate::services::OperationQueue) and the rewind capture
/// loop both honor this through the queue's engine gate.
pub const MAX_CONCURRENT_ENGINE_OPERATIONS: usize = 1;
