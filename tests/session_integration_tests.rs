//! Integration tests for SessionController
//!
//! These tests verify the coordinator end to end:
//! - Manual saves and auto-saves share one queue and never reorder
//! - Slot scenarios (unconfirmed delete, empty load) leave everything untouched
//! - Shutdown cancels waiting work and lets the running operation finish
//! - Rewind capture starts after its delay and never overlaps queued work
//! - A load or hardcore switch during rewind playback halts it first
//! - Dropping a session stops its background loops
//! - Hardcore mode refuses save states, auto-save and rewind

use statekeeper::models::{AutoSaveState, MAX_CONCURRENT_ENGINE_OPERATIONS};
use statekeeper::services::{
    MemorySlotStore, RomIdentity, SimulatedEngine, SlotMetadata, SlotStore, StoreError,
};
use statekeeper::{QueueError, SessionController, SessionSettings, SessionStatus, SlotOutcome};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};
use tokio::time::{Duration, sleep, timeout};

/// Memory store that logs write begin/end and can hold one slot's write open
#[derive(Default)]
struct RecordingStore {
    inner: MemorySlotStore,
    log: Mutex<Vec<String>>,
    hold: Mutex<Option<u32>>,
    release: Notify,
}

impl RecordingStore {
    fn holding(slot: u32) -> Self {
        let store = Self::default();
        *store.hold.lock().unwrap() = Some(slot);
        store
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl SlotStore for RecordingStore {
    async fn save_slot(
        &self,
        rom: &RomIdentity,
        slot: u32,
        state: Vec<u8>,
        screenshot: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        self.log.lock().unwrap().push(format!("begin {}", slot));
        let held = *self.hold.lock().unwrap() == Some(slot);
        if held {
            self.release.notified().await;
        }
        let result = self.inner.save_slot(rom, slot, state, screenshot).await;
        self.log.lock().unwrap().push(format!("end {}", slot));
        result
    }

    async fn load_slot(&self, rom: &RomIdentity, slot: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load_slot(rom, slot).await
    }

    async fn list_slots(&self, rom: &RomIdentity) -> Result<Vec<SlotMetadata>, StoreError> {
        self.inner.list_slots(rom).await
    }

    async fn delete_slot(&self, rom: &RomIdentity, slot: u32) -> Result<(), StoreError> {
        self.inner.delete_slot(rom, slot).await
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        rewind_enabled: false,
        ..SessionSettings::default()
    }
}

fn session<S: SlotStore>(settings: SessionSettings, store: S) -> Arc<SessionController<SimulatedEngine, S>> {
    Arc::new(SessionController::new(
        settings,
        SimulatedEngine::new(),
        store,
        RomIdentity::new("Session Test (USA).sfc"),
    ))
}

#[tokio::test]
async fn test_lifecycle() {
    let session = session(settings(), MemorySlotStore::new());
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Idle);

    // Nothing to save before the game runs
    assert_eq!(session.save(1).await.unwrap(), SlotOutcome::Inactive);

    session.start();
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Running);
    assert!(!session.engine().is_paused());

    session.toggle_pause();
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Paused);
    assert!(session.engine().is_paused());

    session.toggle_pause();
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Running);

    session.shutdown().await;
    session.shutdown().await;
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Stopped);

    session.resume();
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Stopped);
    assert_eq!(session.save(1).await.unwrap(), SlotOutcome::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_manual_save_waits_for_in_flight_auto_save() {
    let session = session(settings(), RecordingStore::holding(0));
    session.start();

    // Auto-save fires at 20s and blocks inside the store
    sleep(Duration::from_millis(20_050)).await;
    assert_eq!(session.state().read(|s| s.auto_save_state), AutoSaveState::Saving);
    assert_eq!(session.store().log(), vec!["begin 0"]);

    let manual = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.save(1).await })
    };
    while session.metrics().operations_enqueued.load(Ordering::Relaxed) < 2 {
        tokio::task::yield_now().await;
    }

    sleep(Duration::from_millis(500)).await;
    assert_eq!(session.store().log(), vec!["begin 0"]);

    session.store().release.notify_one();
    let outcome = manual.await.unwrap().unwrap();

    assert_eq!(outcome, SlotOutcome::Saved { slot: 1 });
    assert_eq!(session.store().log(), vec!["begin 0", "end 0", "begin 1", "end 1"]);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_save_waits_for_earlier_queued_work() {
    let session = session(settings(), RecordingStore::default());
    session.start();

    sleep(Duration::from_millis(19_000)).await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let log = Arc::new(Mutex::new(Vec::new()));

    let manual = {
        let log = Arc::clone(&log);
        session.enqueue("manual", async move {
            let _ = release_rx.await;
            log.lock().unwrap().push("manual");
        })
    };

    sleep(Duration::from_secs(3)).await;
    assert_eq!(session.state().read(|s| s.auto_save_state), AutoSaveState::Saving);
    assert!(session.store().log().is_empty());

    release_tx.send(()).unwrap();
    manual.await.unwrap();
    session.queue().flush().await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["manual"]);
    assert_eq!(session.store().log(), vec!["begin 0", "end 0"]);

    session.shutdown().await;
}

#[tokio::test]
async fn test_delete_without_confirmation_leaves_store_unchanged() {
    let session = session(settings(), MemorySlotStore::new());
    session.start();

    session.save(2).await.unwrap();
    let rom = session.rom().clone();
    let before = session.store().list_slots(&rom).await.unwrap();

    let outcome = session.delete(2, &|_: &str| false).await.unwrap();

    assert_eq!(outcome, SlotOutcome::Declined { slot: 2 });
    assert_eq!(session.store().list_slots(&rom).await.unwrap(), before);
    assert!(session.store().contains(&rom, 2));

    session.shutdown().await;
}

#[tokio::test]
async fn test_load_empty_slot_reports_no_save() {
    let session = session(settings(), MemorySlotStore::new());
    session.start();
    session.engine().advance(120);
    let mut notes = session.subscribe_notifications();

    let outcome = session.load(3).await.unwrap();

    assert_eq!(outcome, SlotOutcome::Empty { slot: 3 });
    assert_eq!(session.engine().replace_count(), 0);
    assert_eq!(session.engine().frame(), 120);
    assert_eq!(session.state().read(|s| s.status), SessionStatus::Running);
    assert_eq!(notes.try_recv().unwrap().title, "No save found");

    session.shutdown().await;
}

#[tokio::test]
async fn test_save_then_load_roundtrip() {
    let session = session(settings(), MemorySlotStore::new());
    session.start();

    session.engine().advance(300);
    session.save(1).await.unwrap();
    session.engine().advance(60);

    assert_eq!(session.load(1).await.unwrap(), SlotOutcome::Loaded { slot: 1 });
    assert_eq!(session.engine().frame(), 300);
    assert_eq!(session.metrics().loads_completed.load(Ordering::Relaxed), 1);

    let slots = session.refresh_slots().await.unwrap();
    assert_eq!(slots.len(), 1);
    assert!(slots[0].has_screenshot);

    session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_waiting_operations() {
    let session = session(settings(), MemorySlotStore::new());
    session.start();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let running = session.enqueue("running", async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        "finished"
    });
    let waiting = session.enqueue("waiting", async { "never" });
    started_rx.await.unwrap();

    let shutdown = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.shutdown().await })
    };
    while !session.queue().is_closed() {
        tokio::task::yield_now().await;
    }

    release_tx.send(()).unwrap();
    assert_eq!(running.await.unwrap(), "finished");
    assert!(matches!(waiting.await, Err(QueueError::Cancelled { .. })));

    timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("Timeout waiting for shutdown")
        .unwrap();

    assert_eq!(session.state().read(|s| s.status), SessionStatus::Stopped);
    assert_eq!(
        session.enqueue("late", async { 1 }).await,
        Err(QueueError::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rewind_capture_starts_after_delay() {
    let session = session(SessionSettings::default(), MemorySlotStore::new());
    session.start();

    sleep(Duration::from_millis(1_900)).await;
    assert!(!session.is_rewind_capturing());

    sleep(Duration::from_millis(1_000)).await;
    assert!(session.is_rewind_capturing());
    assert!(session.state().read(|s| s.rewind_buffer_size) > 0);

    session.shutdown().await;
    assert!(!session.is_rewind_capturing());
    assert!(!session.state().read(|s| s.rewind_capturing));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_rewind_delay() {
    let session = session(SessionSettings::default(), MemorySlotStore::new());
    session.start();

    sleep(Duration::from_millis(500)).await;
    session.shutdown().await;
    sleep(Duration::from_secs(5)).await;

    assert!(!session.is_rewind_capturing());
    assert_eq!(session.engine().capture_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_load_stops_and_restarts_rewind() {
    let session = session(SessionSettings::default(), MemorySlotStore::new());
    session.start();
    session.engine().advance(10);

    sleep(Duration::from_millis(3_000)).await;
    assert!(session.state().read(|s| s.rewind_buffer_size) > 0);

    session.save(1).await.unwrap();
    session.engine().advance(50);
    session.load(1).await.unwrap();

    assert_eq!(session.engine().replaced_frames(), vec![10]);
    assert!(session.is_rewind_capturing());
    assert!(session.state().read(|s| s.rewind_buffer_size) <= 1);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rewind_playback_through_controller() {
    let session = session(SessionSettings::default(), MemorySlotStore::new());
    session.start();

    for _ in 0..12 {
        session.engine().advance(1);
        sleep(Duration::from_millis(250)).await;
    }

    assert!(session.start_rewind().await);
    assert!(session.state().read(|s| s.is_rewinding));
    sleep(Duration::from_millis(1_000)).await;
    session.stop_rewind().await;

    let replaced = session.engine().replaced_frames();
    assert!(!replaced.is_empty());
    assert!(replaced.windows(2).all(|w| w[0] >= w[1]));
    assert!(!session.state().read(|s| s.is_rewinding));
    assert!(session.is_rewind_capturing());

    session.shutdown().await;
}

fn fast_rewind_settings() -> SessionSettings {
    SessionSettings {
        auto_save_enabled: false,
        rewind_capture_interval_ms: 10,
        rewind_start_delay_ms: 0,
        ..SessionSettings::default()
    }
}

fn shared_session(
    settings: SessionSettings,
    engine: &Arc<SimulatedEngine>,
) -> SessionController<SimulatedEngine, MemorySlotStore> {
    SessionController::with_shared(
        settings,
        Arc::clone(engine),
        Arc::new(MemorySlotStore::new()),
        RomIdentity::new("Rewind Race (USA).sfc"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_during_rewind_playback_keeps_loaded_state() {
    let engine = Arc::new(SimulatedEngine::with_access_delay(Duration::from_millis(15)));
    let session = shared_session(fast_rewind_settings(), &engine);
    session.start();

    engine.advance(1000);
    assert_eq!(session.save(1).await.unwrap(), SlotOutcome::Saved { slot: 1 });

    for _ in 0..8 {
        engine.advance(1);
        sleep(Duration::from_millis(30)).await;
    }
    assert!(session.state().read(|s| s.rewind_buffer_size) > 0);

    assert!(session.start_rewind().await);
    sleep(Duration::from_millis(15)).await;
    assert_eq!(session.load(1).await.unwrap(), SlotOutcome::Loaded { slot: 1 });

    // Nothing replaces the state after the load settles
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.frame(), 1000);
    assert_eq!(engine.replaced_frames().last(), Some(&1000));
    assert!(!session.state().read(|s| s.is_rewinding));

    // Capture picks up again on the loaded timeline
    assert!(session.is_rewind_capturing());
    session.stop_rewind().await;
    assert!(session.is_rewind_capturing());
    let captured = engine.capture_count();
    sleep(Duration::from_millis(150)).await;
    assert!(engine.capture_count() > captured);

    session.shutdown().await;
}

#[tokio::test]
async fn test_hardcore_during_rewind_playback_stops_it() {
    let engine = Arc::new(SimulatedEngine::new());
    let session = shared_session(fast_rewind_settings(), &engine);
    session.start();

    for _ in 0..8 {
        engine.advance(1);
        sleep(Duration::from_millis(20)).await;
    }
    assert!(session.start_rewind().await);

    session.set_hardcore(true).await;
    assert!(!session.state().read(|s| s.is_rewinding));
    assert!(!session.is_rewind_capturing());
    assert_eq!(session.state().read(|s| s.rewind_buffer_size), 0);

    let replaced = engine.replace_count();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.replace_count(), replaced);

    session.shutdown().await;
}

#[tokio::test]
async fn test_dropping_session_stops_background_work() {
    let engine = Arc::new(SimulatedEngine::new());
    let session = shared_session(fast_rewind_settings(), &engine);
    session.start();

    sleep(Duration::from_millis(80)).await;
    assert!(engine.capture_count() > 0);

    drop(session);
    sleep(Duration::from_millis(30)).await;
    let captured = engine.capture_count();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.capture_count(), captured);
}

#[tokio::test]
async fn test_dropping_session_before_rewind_delay() {
    let engine = Arc::new(SimulatedEngine::new());
    let settings = SessionSettings {
        rewind_start_delay_ms: 50,
        ..fast_rewind_settings()
    };
    let session = shared_session(settings, &engine);
    session.start();

    drop(session);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.capture_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hardcore_refuses_save_states_and_rewind() {
    let settings = SessionSettings {
        hardcore: true,
        ..SessionSettings::default()
    };
    let session = session(settings, MemorySlotStore::new());
    session.start();

    assert_eq!(session.save(1).await.unwrap(), SlotOutcome::Restricted);
    assert_eq!(session.load(1).await.unwrap(), SlotOutcome::Restricted);
    assert_eq!(session.open_save_modal().await, SlotOutcome::Restricted);
    assert!(!session.start_rewind().await);

    sleep(Duration::from_secs(30)).await;
    assert!(!session.is_rewind_capturing());
    assert_eq!(session.state().read(|s| s.auto_save_state), AutoSaveState::Idle);
    assert_eq!(session.store().write_count(), 0);

    // Leaving hardcore brings auto-save and rewind back
    session.set_hardcore(false).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(session.state().read(|s| s.auto_save_state), AutoSaveState::Counting);
    assert!(session.is_rewind_capturing());

    session.set_hardcore(true).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state().read(|s| s.auto_save_state), AutoSaveState::Idle);
    assert!(!session.is_rewind_capturing());

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_save_indicator_toggle() {
    let session = session(settings(), MemorySlotStore::new());
    session.start();

    sleep(Duration::from_millis(8_050)).await;
    session.toggle_auto_save_pause();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(session.state().read(|s| s.auto_save_progress), 40);
    assert!(session.state().read(|s| s.auto_save_paused));
    assert_eq!(session.store().write_count(), 0);

    session.toggle_auto_save_pause();
    sleep(Duration::from_secs(13)).await;
    assert_eq!(session.store().write_count(), 1);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_never_accessed_concurrently() {
    let settings = SessionSettings {
        auto_save_interval_ms: 40,
        auto_save_done_display_ms: 10,
        auto_save_tick_ms: 5,
        rewind_capture_interval_ms: 3,
        rewind_start_delay_ms: 0,
        ..SessionSettings::default()
    };
    let session = Arc::new(SessionController::new(
        settings,
        SimulatedEngine::with_access_delay(Duration::from_millis(1)),
        MemorySlotStore::new(),
        RomIdentity::new("stress.nes"),
    ));
    session.start();

    let frames = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                session.engine().advance(1);
                sleep(Duration::from_millis(1)).await;
            }
        })
    };

    for round in 0..20u32 {
        let slot = round % 5 + 1;
        session.save(slot).await.unwrap();
        sleep(Duration::from_millis(7)).await;
        session.load(slot).await.unwrap();
        sleep(Duration::from_millis(5)).await;
    }

    frames.abort();
    session.shutdown().await;

    assert!(session.engine().capture_count() >= 20);
    assert_eq!(session.engine().max_concurrent_access(), MAX_CONCURRENT_ENGINE_OPERATIONS);
    assert_eq!(session.metrics().max_engine_concurrency(), MAX_CONCURRENT_ENGINE_OPERATIONS);
}
