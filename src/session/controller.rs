use crate::metrics::Metrics;
use crate::models::{HardcoreRestrictions, SessionSettings, SessionStatus};
use crate::services::autosave::{AutoSaveScheduler, AutoSaveTiming};
use crate::services::engine::EmulatorEngine;
use crate::services::queue::{OperationQueue, QueueError};
use crate::services::rewind::RewindController;
use crate::services::slots::{
    Confirmation, SaveSlotSession, SlotError, SlotOutcome, capture_and_persist, set_running,
};
use crate::services::store::{RomIdentity, SlotMetadata, SlotStore};
use crate::session::notifier::{Notification, Notifier};
use crate::state::{StateChange, StateManager};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One emulation session and everything that touches its engine
///
/// Owns the operation queue, the auto-save scheduler, the rewind controller and the
/// slot session. Every entry point is safe to call in any lifecycle state; calls that
/// make no sense (saving before `start`, anything after `shutdown`) are no-ops.
///
/// Must be created inside a tokio runtime. Dropping it without [`shutdown`](Self::shutdown)
/// signals every background loop to stop and cancels waiting operations.
pub struct SessionController<E: EmulatorEngine, S: SlotStore> {
    settings: SessionSettings,
    engine: Arc<E>,
    store: Arc<S>,
    queue: Arc<OperationQueue>,
    rewind: Arc<RewindController<E>>,
    slots: SaveSlotSession<E, S>,
    auto_save: Mutex<Option<AutoSaveScheduler>>,
    rewind_start: Mutex<Option<JoinHandle<()>>>,
    state: StateManager,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    rom: RomIdentity,
}

impl<E: EmulatorEngine, S: SlotStore> SessionController<E, S> {
    pub fn new(settings: SessionSettings, engine: E, store: S, rom: RomIdentity) -> Self {
        Self::with_shared(settings, Arc::new(engine), Arc::new(store), rom)
    }

    /// Build a session around an engine and store the caller keeps handles to
    pub fn with_shared(
        settings: SessionSettings,
        engine: Arc<E>,
        store: Arc<S>,
        rom: RomIdentity,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(OperationQueue::new(Arc::clone(&metrics)));
        let state = StateManager::new();
        let notifier = Notifier::new();

        state.begin_session(
            rom.to_string(),
            HardcoreRestrictions::new(settings.hardcore, settings.rewind_enabled),
        );

        let rewind = Arc::new(RewindController::new(
            Arc::clone(&engine),
            Arc::clone(&queue),
            state.clone(),
            Arc::clone(&metrics),
            settings.rewind_capture_interval(),
            settings.rewind_buffer_capacity,
        ));

        let slots = SaveSlotSession::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&rewind),
            state.clone(),
            notifier.clone(),
            Arc::clone(&metrics),
            rom.clone(),
            settings.slot_count,
        );

        tracing::info!("Session created for {} (storage key {})", rom, rom.storage_key());

        Self {
            settings,
            engine,
            store,
            queue,
            rewind,
            slots,
            auto_save: Mutex::new(None),
            rewind_start: Mutex::new(None),
            state,
            notifier,
            metrics,
            rom,
        }
    }

    /// Start running: auto-save begins counting, rewind capture after its delay
    pub fn start(&self) {
        if self.state.read(|s| s.status) != SessionStatus::Idle {
            tracing::debug!("Session already started");
            return;
        }

        self.engine.resume();
        self.state.set_status(SessionStatus::Running);
        tracing::info!("Session started for {}", self.rom);

        let restrictions = self.state.read(|s| s.restrictions);
        if restrictions.can_use_save_states {
            self.spawn_auto_save(self.settings.auto_save_enabled);
        }
        if restrictions.can_use_rewind {
            self.schedule_rewind_start();
        }
    }

    pub fn pause(&self) {
        set_running(self.engine.as_ref(), &self.state, false);
    }

    pub fn resume(&self) {
        set_running(self.engine.as_ref(), &self.state, true);
    }

    pub fn toggle_pause(&self) {
        match self.state.read(|s| s.status) {
            SessionStatus::Running => self.pause(),
            SessionStatus::Paused => self.resume(),
            _ => {}
        }
    }

    /// Tear the session down
    ///
    /// Stops the scheduler and rewind, closes the queue (waiting operations are
    /// cancelled, the running one completes) and waits for the worker.
    pub async fn shutdown(&self) {
        if self.state.read(|s| s.status) == SessionStatus::Stopped {
            return;
        }
        tracing::info!("Shutting down session for {}", self.rom);

        let pending_start = self
            .rewind_start
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = pending_start {
            task.abort();
        }

        let scheduler = self.auto_save.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        self.rewind.suspend().await;

        self.queue.shutdown().await;

        self.engine.pause();
        self.state.update(|s| {
            s.status = SessionStatus::Stopped;
            s.slot_modal = None;
        });

        self.metrics.log_summary();
        tracing::info!("Session stopped");
    }

    pub async fn save(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        self.slots.save(slot).await
    }

    pub async fn load(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        self.slots.load(slot).await
    }

    pub async fn delete(
        &self,
        slot: u32,
        confirmation: &impl Confirmation,
    ) -> Result<SlotOutcome, SlotError> {
        self.slots.delete(slot, confirmation).await
    }

    pub async fn refresh_slots(&self) -> Result<Vec<SlotMetadata>, SlotError> {
        self.slots.refresh().await
    }

    pub async fn open_save_modal(&self) -> SlotOutcome {
        self.slots.open_save_modal().await
    }

    pub async fn open_load_modal(&self) -> SlotOutcome {
        self.slots.open_load_modal().await
    }

    pub async fn select_slot(&self, slot: u32) -> Result<SlotOutcome, SlotError> {
        self.slots.select_slot(slot).await
    }

    pub fn close_modal(&self) {
        self.slots.close_modal();
    }

    /// Run arbitrary work against the engine in queue order
    pub fn enqueue<F, T>(
        &self,
        label: &'static str,
        op: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + use<E, S, F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.queue.enqueue(label, op)
    }

    /// The auto-save indicator's click: freeze or continue the countdown
    pub fn toggle_auto_save_pause(&self) {
        if let Some(scheduler) = self.auto_save.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
        {
            scheduler.toggle_pause();
        }
    }

    pub fn set_auto_save_enabled(&self, enabled: bool) {
        let guard = self.auto_save.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(scheduler) => scheduler.set_enabled(enabled),
            None => tracing::debug!("Auto-save unavailable in this session"),
        }
    }

    /// Step backwards through the rewind ring until [`stop_rewind`](Self::stop_rewind)
    pub async fn start_rewind(&self) -> bool {
        let allowed = self
            .state
            .read(|s| s.status == SessionStatus::Running && s.restrictions.can_use_rewind);
        if !allowed {
            return false;
        }
        self.rewind.start_rewind().await
    }

    pub async fn stop_rewind(&self) {
        self.rewind.stop_rewind().await;
    }

    /// Switch the hardcore restriction profile
    ///
    /// Entering hardcore stops auto-save and rewind. Leaving it restores them as
    /// configured.
    pub async fn set_hardcore(&self, hardcore: bool) {
        let restrictions = HardcoreRestrictions::new(hardcore, self.settings.rewind_enabled);
        self.state.update(|s| s.restrictions = restrictions);
        tracing::info!("Hardcore mode: {}", hardcore);

        if hardcore {
            self.set_auto_save_enabled(false);
            self.rewind.suspend().await;
            self.rewind.clear();
            return;
        }

        if !self.state.read(|s| s.status.is_active()) {
            return;
        }

        let has_scheduler = self
            .auto_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if has_scheduler {
            self.set_auto_save_enabled(self.settings.auto_save_enabled);
        } else {
            self.spawn_auto_save(self.settings.auto_save_enabled);
        }

        if restrictions.can_use_rewind {
            self.rewind.start();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn rom(&self) -> &RomIdentity {
        &self.rom
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_rewind_capturing(&self) -> bool {
        self.rewind.is_running()
    }

    fn spawn_auto_save(&self, enabled: bool) {
        let mut guard = self.auto_save.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let rom = self.rom.clone();
        let slot = self.settings.auto_save_slot;

        let save_action = move || {
            let engine = Arc::clone(&engine);
            let store = Arc::clone(&store);
            let rom = rom.clone();
            let metrics = Arc::clone(&metrics);

            let outcome = queue.enqueue("auto-save", async move {
                capture_and_persist(engine.as_ref(), store.as_ref(), &rom, slot).await
            });

            async move {
                let result = outcome.await.map_err(SlotError::from).and_then(|r| r);
                metrics.record_save(result.is_ok());
                result.map_err(|e| e.to_string())
            }
        };

        let timing = AutoSaveTiming {
            interval: self.settings.auto_save_interval(),
            done_display: self.settings.auto_save_done_display(),
            tick: self.settings.auto_save_tick(),
        };

        *guard = Some(AutoSaveScheduler::spawn(
            timing,
            enabled,
            save_action,
            self.state.clone(),
            self.notifier.clone(),
            Arc::clone(&self.metrics),
        ));
    }

    fn schedule_rewind_start(&self) {
        let rewind = Arc::clone(&self.rewind);
        let state = self.state.clone();
        let delay = self.settings.rewind_start_delay();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let ready = state.read(|s| s.status.is_active() && s.restrictions.can_use_rewind);
            if ready {
                rewind.start();
            } else {
                tracing::debug!("Session ended before rewind capture could start");
            }
        });

        *self.rewind_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }
}

impl<E: EmulatorEngine, S: SlotStore> Drop for SessionController<E, S> {
    fn drop(&mut self) {
        let pending_start = self
            .rewind_start
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = pending_start {
            task.abort();
        }

        // The scheduler shuts itself down when dropped with the rest of the fields
        self.rewind.halt_now();
        self.queue.close();
    }
}
