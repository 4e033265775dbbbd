use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings file (`Session Settings.yaml`).
///
/// Every field has a default so a partial file (or none at all) is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

/// Timing and policy knobs for one emulation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Whether the auto-save scheduler runs at all.
    pub auto_save_enabled: bool,

    /// Time between auto-saves, in milliseconds.
    pub auto_save_interval_ms: u64,

    /// How long the `done` state is displayed before counting restarts.
    pub auto_save_done_display_ms: u64,

    /// Scheduler tick period; controls progress resolution.
    pub auto_save_tick_ms: u64,

    /// Slot index auto-saves are written to. Manual slots start at 1.
    pub auto_save_slot: u32,

    pub rewind_enabled: bool,

    /// Capture cadence of the rewind loop, in milliseconds.
    pub rewind_capture_interval_ms: u64,

    /// Maximum number of snapshots kept in the rewind ring.
    pub rewind_buffer_capacity: usize,

    /// Delay between the session reaching `running` and the first capture.
    pub rewind_start_delay_ms: u64,

    /// Number of manual save slots (indices `1..=slot_count`).
    pub slot_count: u32,

    /// Competitive restriction profile: no save states, no rewind.
    pub hardcore: bool,

    pub debug_mode: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_save_enabled: true,
            auto_save_interval_ms: 20_000,
            auto_save_done_display_ms: 1_500,
            auto_save_tick_ms: 100,
            auto_save_slot: 0,
            rewind_enabled: true,
            rewind_capture_interval_ms: 250,
            rewind_buffer_capacity: 100,
            rewind_start_delay_ms: 2_000,
            slot_count: 5,
            hardcore: false,
            debug_mode: false,
        }
    }
}

impl SessionSettings {
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(self.auto_save_interval_ms)
    }

    pub fn auto_save_done_display(&self) -> Duration {
        Duration::from_millis(self.auto_save_done_display_ms)
    }

    pub fn auto_save_tick(&self) -> Duration {
        Duration::from_millis(self.auto_save_tick_ms.max(1))
    }

    pub fn rewind_capture_interval(&self) -> Duration {
        Duration::from_millis(self.rewind_capture_interval_ms.max(1))
    }

    pub fn rewind_start_delay(&self) -> Duration {
        Duration::from_millis(self.rewind_start_delay_ms)
    }

    /// Check whether `slot` is a valid manual slot index.
    pub fn is_manual_slot(&self, slot: u32) -> bool {
        (1..=self.slot_count).contains(&slot)
    }
}

/// Where save slots and logs live on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub save_dir: String,
    pub log_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            save_dir: "saves".to_string(),
            log_dir: "logs".to_string(),
        }
    }
}
