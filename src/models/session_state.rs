use crate::services::store::SlotMetadata;

/// Lifecycle status of the emulation session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionStatus {
    /// No game running yet.
    #[default]
    Idle,
    Running,
    Paused,
    /// Torn down; every entry point is a no-op from here on.
    Stopped,
}

impl SessionStatus {
    /// Whether the session still owns a live emulator handle.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Display state of the auto-save indicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoSaveState {
    #[default]
    Idle,
    Counting,
    Saving,
    Done,
}

/// Which action the slot modal performs when a slot is picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotModalMode {
    Save,
    Load,
}

/// Feature gates derived from the achievement hardcore flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardcoreRestrictions {
    pub is_hardcore: bool,
    pub can_use_save_states: bool,
    pub can_use_rewind: bool,
    pub can_use_cheats: bool,
    pub can_use_slow_motion: bool,
}

impl HardcoreRestrictions {
    pub fn new(is_hardcore: bool, rewind_enabled: bool) -> Self {
        Self {
            is_hardcore,
            can_use_save_states: !is_hardcore,
            can_use_rewind: !is_hardcore && rewind_enabled,
            can_use_cheats: !is_hardcore,
            can_use_slow_motion: !is_hardcore,
        }
    }
}

impl Default for HardcoreRestrictions {
    fn default() -> Self {
        Self::new(false, true)
    }
}

/// Everything the UI layer renders about the save-state subsystem.
///
/// Wrapped in `Arc<RwLock<_>>` by [`crate::state::StateManager`]; mutate it only
/// through [`StateManager::update`](crate::state::StateManager::update) so change
/// events are emitted.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    // Session
    pub status: SessionStatus,
    pub rom_identity: Option<String>,
    pub restrictions: HardcoreRestrictions,

    // Auto-save indicator
    pub auto_save_enabled: bool,
    pub auto_save_state: AutoSaveState,
    pub auto_save_progress: u8,
    pub auto_save_paused: bool,

    // Rewind
    pub rewind_capturing: bool,
    pub is_rewinding: bool,
    pub rewind_buffer_size: usize,

    // Slot modal
    pub slot_modal: Option<SlotModalMode>,
    pub slots: Vec<SlotMetadata>,
    pub is_slot_loading: bool,
    pub actioning_slot: Option<u32>,
}

impl SessionState {
    pub fn is_paused(&self) -> bool {
        self.status == SessionStatus::Paused
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Seconds left until the next auto-save, derived from progress.
    pub fn auto_save_remaining_secs(&self, interval_secs: f64) -> u64 {
        let remaining = f64::from(100 - self.auto_save_progress.min(100)) * interval_secs / 100.0;
        remaining.ceil() as u64
    }
}
