use crate::metrics::Metrics;
use crate::models::{SessionStatus, SlotModalMode};
use crate::services::engine::{EmulatorEngine, EngineError};
use crate::services::queue::{OperationQueue, QueueError};
use crate::services::rewind::RewindController;
use crate::services::store::{RomIdentity, SlotMetadata, SlotStore, StoreError};
use crate::session::notifier::Notifier;
use crate::state::StateManager;
use std::sync::Arc;
use thiserror::Error;

/// Errors from a slot action that reached the engine or the store
#[derive(Error, Debug)]
pub enum SlotError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// How a slot request was resolved
///
/// Requests that could not run (no session, hardcore, another slot in flight) are
/// outcomes rather than errors; nothing was attempted and the session is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Saved { slot: u32 },
    Loaded { slot: u32 },
    /// The slot holds no save; the engine was not touched
    Empty { slot: u32 },
    Deleted { slot: u32 },
    /// The user did not confirm the deletion
    Declined { slot: u32 },
    /// Another slot action is in flight
    Busy { actioning: u32 },
    /// Save states are disabled by hardcore mode
    Restricted,
    /// No running or paused session
    Inactive,
    InvalidSlot { slot: u32 },
    /// The slot modal is open and the game paused
    ModalOpened { mode: SlotModalMode },
    /// `select_slot` without an open modal
    NoModal,
}

/// Asks the user to confirm a destructive action
pub trait Confirmation {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> Confirmation for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Capture the engine and persist it to `slot`
///
/// Runs inside a queued operation. A failing screenshot is logged and the slot is
/// written without one.
pub(crate) async fn capture_and_persist<E: EmulatorEngine, S: SlotStore>(
    engine: &E,
    store: &S,
    rom: &RomIdentity,
    slot: u32,
) -> Result<(), SlotError> {
    let state = engine.capture_state()?;
    let screenshot = match engine.screenshot() {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!("Saving slot {} without screenshot: {}", slot, e);
            None
        }
    };

    store.save_slot(rom, slot, state, screenshot).await?;
    Ok(())
}

/// Pause or resume the engine and mirror it in the session status
///
/// A session that is not active is left alone.
pub(crate) fn set_running<E: EmulatorEngine>(engine: &E, state: &StateManager, running: bool) {
    let active = state.read(|s| s.status.is_active());
    if !active {
        return;
    }

    if running {
        engine.resume();
    } else {
        engine.pause();
    }
    state.update(|s| {
        s.status = if running {
            SessionStatus::Running
        } else {
            SessionStatus::Paused
        };
    });
}

/// Manual save, load and delete against the slot store
///
/// Save and load go through the operation queue. Loading halts rewind capture and
/// playback and waits for both before the replace is enqueued, then clears the now
/// stale ring.
/// Only one slot action runs at a time; the slot in flight is published as
/// `actioning_slot` and further requests get [`SlotOutcome::Busy`].
pub struct SaveSlotSession<E: EmulatorEngine, S: SlotStore> {
    engine: Arc<E>,
    store: Arc<S>,
    queue: Arc<OperationQueue>,
    rewind: Arc<RewindController<E>>,
    state: StateManager,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    rom: RomIdentity,
    slot_count: u32,
}

impl<E: EmulatorEngine, S: SlotStore> SaveSlotSession<E, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<E>,
        store: Arc<S>,
        queue: Arc<OperationQueue>,
        rewind: Arc<RewindController<E>>,
        state: StateManager,
        notifier: Notifier,
        metrics: Arc<Metrics>,
        rom: RomIdentity,
        slot_count: u32,
    ) -> Self {
        Self {
            engine,
            store,
            queue,
            rewind,
            state,
            notifier,
            metrics,
            rom,
            slot_count,
        }
    }

    pub fn rom(&self) -> &RomIdentity {
        &self.rom
    }

    /// Pause the session, capture, persist
    ///
    /// On success the session resumes and the modal closes. On failure the session is
    /// left paused and a retryable error is shown.
    pub async fn save(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        if let Some(refused) = self.check(slot) {
            return Ok(refused);
        }
        if let Some(busy) = self.claim(slot) {
            return Ok(busy);
        }

        tracing::info!("Saving slot {} for {}", slot, self.rom);
        set_running(self.engine.as_ref(), &self.state, false);

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let rom = self.rom.clone();
        let result = self
            .queue
            .enqueue("slot-save", async move {
                capture_and_persist(engine.as_ref(), store.as_ref(), &rom, slot).await
            })
            .await
            .map_err(SlotError::from)
            .and_then(|r| r);

        let outcome = match result {
            Ok(()) => {
                self.metrics.record_save(true);
                set_running(self.engine.as_ref(), &self.state, true);
                self.notifier.success("Saved", format!("Saved to slot {}", slot));
                self.state.update(|s| s.slot_modal = None);
                if let Err(e) = self.refresh().await {
                    tracing::warn!("Failed to refresh slots after save: {}", e);
                }
                Ok(SlotOutcome::Saved { slot })
            }
            Err(e) => {
                self.metrics.record_save(false);
                tracing::error!("Failed to save slot {}: {}", slot, e);
                self.notifier.error("Save failed", e.to_string(), true);
                Err(e)
            }
        };

        self.release();
        outcome
    }

    /// Fetch the slot, then replace the engine state through the queue
    ///
    /// An empty slot reports "no save found" and leaves the engine untouched.
    pub async fn load(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        if let Some(refused) = self.check(slot) {
            return Ok(refused);
        }
        if let Some(busy) = self.claim(slot) {
            return Ok(busy);
        }

        let outcome = self.load_claimed(slot).await;
        self.release();
        outcome
    }

    async fn load_claimed(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        let blob = match self.store.load_slot(&self.rom, slot).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::info!("No save found in slot {}", slot);
                self.notifier.info("No save found", format!("Slot {} is empty", slot));
                return Ok(SlotOutcome::Empty { slot });
            }
            Err(e) => {
                tracing::error!("Failed to read slot {}: {}", slot, e);
                self.notifier.error("Load failed", e.to_string(), true);
                return Err(e.into());
            }
        };

        tracing::info!("Loading slot {} for {} ({} bytes)", slot, self.rom, blob.len());
        set_running(self.engine.as_ref(), &self.state, false);

        // Playback steps must not land on top of the loaded state
        let resume_capture = self.rewind.suspend().await;

        let engine = Arc::clone(&self.engine);
        let result = self
            .queue
            .enqueue("slot-load", async move { engine.replace_state(&blob) })
            .await
            .map_err(SlotError::from)
            .and_then(|r| r.map_err(SlotError::from));

        match result {
            Ok(()) => {
                self.metrics.record_load();
                self.rewind.clear();
                if resume_capture {
                    self.rewind.start();
                }
                set_running(self.engine.as_ref(), &self.state, true);
                self.notifier.success("Loaded", format!("Loaded slot {}", slot));
                self.state.update(|s| s.slot_modal = None);
                Ok(SlotOutcome::Loaded { slot })
            }
            Err(e) => {
                if resume_capture {
                    self.rewind.start();
                }
                tracing::error!("Failed to load slot {}: {}", slot, e);
                self.notifier.error("Load failed", e.to_string(), true);
                Err(e)
            }
        }
    }

    /// Delete a slot after the user confirms. Never goes through the queue.
    pub async fn delete(
        &self,
        slot: u32,
        confirmation: &impl Confirmation,
    ) -> Result<SlotOutcome, SlotError> {
        if slot > self.slot_count {
            return Ok(SlotOutcome::InvalidSlot { slot });
        }
        if let Some(actioning) = self.state.read(|s| s.actioning_slot) {
            return Ok(SlotOutcome::Busy { actioning });
        }

        if !confirmation.confirm(&format!("Delete the save in slot {}?", slot)) {
            tracing::debug!("Deletion of slot {} declined", slot);
            return Ok(SlotOutcome::Declined { slot });
        }

        if let Err(e) = self.store.delete_slot(&self.rom, slot).await {
            tracing::error!("Failed to delete slot {}: {}", slot, e);
            self.notifier.error("Delete failed", e.to_string(), true);
            return Err(e.into());
        }

        tracing::info!("Deleted slot {} for {}", slot, self.rom);
        self.refresh().await?;
        Ok(SlotOutcome::Deleted { slot })
    }

    /// Re-read slot metadata into the session state
    pub async fn refresh(&self) -> Result<Vec<SlotMetadata>, SlotError> {
        self.state.update(|s| s.is_slot_loading = true);
        let result = self.store.list_slots(&self.rom).await;

        match result {
            Ok(slots) => {
                let published = slots.clone();
                self.state.update(|s| {
                    s.slots = published;
                    s.is_slot_loading = false;
                });
                Ok(slots)
            }
            Err(e) => {
                self.state.update(|s| s.is_slot_loading = false);
                Err(e.into())
            }
        }
    }

    pub async fn open_save_modal(&self) -> SlotOutcome {
        self.open_modal(SlotModalMode::Save).await
    }

    pub async fn open_load_modal(&self) -> SlotOutcome {
        self.open_modal(SlotModalMode::Load).await
    }

    async fn open_modal(&self, mode: SlotModalMode) -> SlotOutcome {
        if !self.state.read(|s| s.status.is_active()) {
            return SlotOutcome::Inactive;
        }
        if !self.state.read(|s| s.restrictions.can_use_save_states) {
            return SlotOutcome::Restricted;
        }

        set_running(self.engine.as_ref(), &self.state, false);
        self.state.update(|s| s.slot_modal = Some(mode));
        if let Err(e) = self.refresh().await {
            tracing::warn!("Failed to list slots: {}", e);
        }
        SlotOutcome::ModalOpened { mode }
    }

    /// Run the open modal's action on `slot`
    pub async fn select_slot(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        match self.state.read(|s| s.slot_modal) {
            Some(SlotModalMode::Save) => self.save(slot).await,
            Some(SlotModalMode::Load) => self.load(slot).await,
            None => Ok(SlotOutcome::NoModal),
        }
    }

    /// Close the modal and resume the game
    pub fn close_modal(&self) {
        let was_open = self.state.read(|s| s.slot_modal.is_some());
        self.state.update(|s| s.slot_modal = None);
        if was_open {
            set_running(self.engine.as_ref(), &self.state, true);
        }
    }

    fn check(&self, slot: u32) -> Option<SlotOutcome> {
        let (active, allowed) = self
            .state
            .read(|s| (s.status.is_active(), s.restrictions.can_use_save_states));

        if !active {
            tracing::debug!("Slot action on slot {} ignored: no active session", slot);
            Some(SlotOutcome::Inactive)
        } else if !allowed {
            Some(SlotOutcome::Restricted)
        } else if slot > self.slot_count {
            Some(SlotOutcome::InvalidSlot { slot })
        } else {
            None
        }
    }

    /// Mark `slot` as in flight, or report the slot that already is
    fn claim(&self, slot: u32) -> Option<SlotOutcome> {
        let mut busy = None;
        self.state.update(|s| match s.actioning_slot {
            Some(actioning) => busy = Some(actioning),
            None => s.actioning_slot = Some(slot),
        });
        busy.map(|actioning| SlotOutcome::Busy { actioning })
    }

    fn release(&self) {
        self.state.update(|s| s.actioning_slot = None);
    }
}
