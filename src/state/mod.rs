// State management module
//
// This module provides the StateManager which wraps SessionState with thread-safe access
// using Arc<RwLock<T>> and emits change events for UI updates.

use crate::models::{AutoSaveState, HardcoreRestrictions, SessionState, SessionStatus, SlotModalMode};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when state is modified
///
/// These events are emitted to notify interested parties (primarily the UI)
/// about state changes without requiring them to poll the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Session lifecycle moved
    StatusChanged { status: SessionStatus },

    /// Auto-save indicator changed
    AutoSaveChanged {
        enabled: bool,
        state: AutoSaveState,
        progress: u8,
        paused: bool,
    },

    /// Rewind capture, playback or buffer size changed
    RewindChanged {
        capturing: bool,
        rewinding: bool,
        buffer_size: usize,
    },

    /// Slot modal opened, switched or closed
    SlotModalChanged { mode: Option<SlotModalMode> },

    /// A slot action started (`Some`) or finished (`None`)
    ActioningSlotChanged { slot: Option<u32> },

    /// Slot list was re-read from the store
    SlotsRefreshed { count: usize, loading: bool },

    /// Hardcore restrictions changed
    RestrictionsChanged { restrictions: HardcoreRestrictions },
}

/// Thread-safe state manager with event emission
///
/// This is the central state management component that:
/// - Provides thread-safe access to [`SessionState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Supports subscribing to state changes via tokio broadcast channels
///
/// # Usage
///
/// Always use `StateManager` instead of accessing [`SessionState`] directly:
/// - [`read()`](Self::read) for reading a few fields
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - [`subscribe()`](Self::subscribe) for listening to state changes
///
/// # Related Types
///
/// - [`crate::models::SessionState`]: The underlying state structure
/// - [`StateChange`]: Event types emitted on state mutations
/// - [`crate::session::SessionController`]: Primary producer of state changes
pub struct StateManager {
    /// The session state protected by RwLock for thread-safe access
    state: Arc<RwLock<SessionState>>,

    /// Broadcast channel for emitting state change events
    /// Multiple subscribers can listen for state changes
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with default state
    ///
    /// # Returns
    /// A new StateManager with a broadcast channel buffer of 100 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            state_tx,
        }
    }

    /// Get a snapshot of the current state
    ///
    /// This clones the entire state, so it's safe to use without holding locks.
    /// For checking individual fields, consider using `read()` with a closure.
    pub fn snapshot(&self) -> SessionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let busy = state_manager.read(|state| state.actioning_slot.is_some());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SessionState) -> R,
    {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// This is the primary way to modify state. It:
    /// 1. Captures the old state
    /// 2. Applies the update function
    /// 3. Detects what changed
    /// 4. Emits appropriate events
    ///
    /// The write lock is held for the whole call, so a read-check-write inside
    /// `update_fn` is atomic.
    ///
    /// # Returns
    /// A vector of StateChange events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut SessionState),
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    /// Multiple subscribers can listen simultaneously.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Detect what changed between two states and generate events
    fn detect_changes(old: &SessionState, new: &SessionState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.status != new.status {
            changes.push(StateChange::StatusChanged { status: new.status });
        }

        if old.restrictions != new.restrictions {
            changes.push(StateChange::RestrictionsChanged {
                restrictions: new.restrictions,
            });
        }

        if old.auto_save_enabled != new.auto_save_enabled
            || old.auto_save_state != new.auto_save_state
            || old.auto_save_progress != new.auto_save_progress
            || old.auto_save_paused != new.auto_save_paused
        {
            changes.push(StateChange::AutoSaveChanged {
                enabled: new.auto_save_enabled,
                state: new.auto_save_state,
                progress: new.auto_save_progress,
                paused: new.auto_save_paused,
            });
        }

        if old.rewind_capturing != new.rewind_capturing
            || old.is_rewinding != new.is_rewinding
            || old.rewind_buffer_size != new.rewind_buffer_size
        {
            changes.push(StateChange::RewindChanged {
                capturing: new.rewind_capturing,
                rewinding: new.is_rewinding,
                buffer_size: new.rewind_buffer_size,
            });
        }

        if old.slot_modal != new.slot_modal {
            changes.push(StateChange::SlotModalChanged {
                mode: new.slot_modal,
            });
        }

        if old.actioning_slot != new.actioning_slot {
            changes.push(StateChange::ActioningSlotChanged {
                slot: new.actioning_slot,
            });
        }

        if old.slots != new.slots || old.is_slot_loading != new.is_slot_loading {
            changes.push(StateChange::SlotsRefreshed {
                count: new.slots.len(),
                loading: new.is_slot_loading,
            });
        }

        changes
    }

    /// Move the session lifecycle to `status`
    pub fn set_status(&self, status: SessionStatus) -> Vec<StateChange> {
        self.update(|state| state.status = status)
    }

    /// Reset everything back to a fresh session for `rom_identity`
    pub fn begin_session(
        &self,
        rom_identity: String,
        restrictions: HardcoreRestrictions,
    ) -> Vec<StateChange> {
        self.update(|state| {
            *state = SessionState {
                rom_identity: Some(rom_identity),
                restrictions,
                ..SessionState::default()
            };
        })
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across tasks
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}
