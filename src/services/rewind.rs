use crate::metrics::Metrics;
use crate::models::SessionStatus;
use crate::services::engine::EmulatorEngine;
use crate::services::queue::OperationQueue;
use crate::state::StateManager;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Bounded ring of recent snapshots, oldest evicted first
#[derive(Debug)]
pub struct RewindBuffer {
    snapshots: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl RewindBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a snapshot; returns true when the oldest one was evicted
    pub fn push(&mut self, snapshot: Vec<u8>) -> bool {
        let evicted = if self.snapshots.len() == self.capacity {
            self.snapshots.pop_front();
            true
        } else {
            false
        };
        self.snapshots.push_back(snapshot);
        evicted
    }

    /// Remove and return the newest snapshot
    pub fn pop_latest(&mut self) -> Option<Vec<u8>> {
        self.snapshots.pop_back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

/// A background loop and the means to stop it
struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Ask the loop to exit at its next tick without waiting for it
    fn signal(self) {
        let _ = self.stop_tx.send(true);
    }

    async fn stop(self, name: &str) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Rewind {} loop failed: {}", name, e);
        }
    }
}

/// Continuous rewind capture plus backward playback
///
/// The capture loop snapshots the engine at a fixed cadence without going through the
/// queue. Each tick takes the queue's engine gate with
/// [`OperationQueue::try_acquire_idle`] and skips when anything is running or waiting,
/// so a capture never overlaps a queued operation and never delays one.
///
/// Playback is the opposite direction: every step back is a queued `replace_state`, and
/// capture is suspended for as long as playback runs. Lifecycle calls are serialized, so
/// once [`suspend`](Self::suspend) returns neither loop can touch the engine again until
/// capture is started anew.
pub struct RewindController<E: EmulatorEngine> {
    engine: Arc<E>,
    queue: Arc<OperationQueue>,
    buffer: Arc<Mutex<RewindBuffer>>,
    state: StateManager,
    metrics: Arc<Metrics>,
    cadence: Duration,

    capture: Mutex<Option<LoopHandle>>,
    playback: Mutex<Option<LoopHandle>>,
    lifecycle: tokio::sync::Mutex<()>,

    /// Set from the moment playback is requested until it is stopped
    rewinding: AtomicBool,

    /// Whether capture should be running when playback is not
    capture_wanted: AtomicBool,
}

impl<E: EmulatorEngine> RewindController<E> {
    pub fn new(
        engine: Arc<E>,
        queue: Arc<OperationQueue>,
        state: StateManager,
        metrics: Arc<Metrics>,
        cadence: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            engine,
            queue,
            buffer: Arc::new(Mutex::new(RewindBuffer::new(capacity))),
            state,
            metrics,
            cadence,
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            rewinding: AtomicBool::new(false),
            capture_wanted: AtomicBool::new(false),
        }
    }

    /// Start the capture loop. Idempotent.
    ///
    /// While playback runs the start is deferred until [`stop_rewind`](Self::stop_rewind).
    pub fn start(&self) {
        self.capture_wanted.store(true, Ordering::SeqCst);
        self.spawn_capture();
    }

    /// Stop the capture loop and wait until it has fully halted. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.capture_wanted.store(false, Ordering::SeqCst);
        self.halt_capture().await;
    }

    /// Halt playback and capture before the engine state is replaced from outside
    ///
    /// Waits for an in-flight playback step to settle. Returns whether capture was
    /// wanted, so the caller can [`start`](Self::start) it again afterwards.
    pub async fn suspend(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let wanted = self.capture_wanted.swap(false, Ordering::SeqCst);
        self.halt_playback().await;
        self.halt_capture().await;
        wanted
    }

    /// Signal both loops to exit without waiting for them
    ///
    /// For teardown paths that cannot await. The loops stop at their next tick.
    pub fn halt_now(&self) {
        self.capture_wanted.store(false, Ordering::SeqCst);
        for slot in [&self.capture, &self.playback] {
            let handle = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                handle.signal();
            }
        }
        self.rewinding.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn is_rewinding(&self) -> bool {
        self.rewinding.load(Ordering::SeqCst)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every snapshot; used after a load replaces the timeline
    pub fn clear(&self) {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.state.update(|s| s.rewind_buffer_size = 0);
    }

    /// Begin stepping backwards through the ring
    ///
    /// Returns false when playback is already running or there is nothing to rewind to.
    pub async fn start_rewind(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_rewinding() || self.buffer_len() == 0 {
            return false;
        }

        // Raised before capture halts so a concurrent start() defers instead of respawning
        self.rewinding.store(true, Ordering::SeqCst);
        self.halt_capture().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_playback(
            Arc::clone(&self.engine),
            Arc::clone(&self.queue),
            Arc::clone(&self.buffer),
            self.state.clone(),
            self.cadence,
            stop_rx,
        ));

        *self.playback.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(LoopHandle { stop_tx, task });

        self.state.update(|s| s.is_rewinding = true);
        tracing::info!("Rewind playback started");
        true
    }

    /// Stop playback and resume capture if it was running before
    pub async fn stop_rewind(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.halt_playback().await {
            return;
        }

        if self.capture_wanted.load(Ordering::SeqCst) {
            self.spawn_capture();
        }
    }

    /// Returns whether playback was running
    async fn halt_playback(&self) -> bool {
        let handle = self
            .playback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(handle) = handle else { return false };
        handle.stop("playback").await;

        self.rewinding.store(false, Ordering::SeqCst);
        self.state.update(|s| s.is_rewinding = false);
        tracing::info!("Rewind playback stopped");
        true
    }

    fn spawn_capture(&self) {
        let mut capture = self.capture.lock().unwrap_or_else(|e| e.into_inner());
        if capture.is_some() || self.is_rewinding() {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_capture(
            Arc::clone(&self.engine),
            Arc::clone(&self.queue),
            Arc::clone(&self.buffer),
            self.state.clone(),
            Arc::clone(&self.metrics),
            self.cadence,
            stop_rx,
        ));
        *capture = Some(LoopHandle { stop_tx, task });
        drop(capture);

        self.state.update(|s| s.rewind_capturing = true);
        tracing::info!("Rewind capture started (every {:?})", self.cadence);
    }

    async fn halt_capture(&self) {
        let handle = self
            .capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            handle.stop("capture").await;
            self.state.update(|s| s.rewind_capturing = false);
            tracing::info!("Rewind capture stopped");
        }
    }
}

impl<E: EmulatorEngine> Drop for RewindController<E> {
    fn drop(&mut self) {
        self.halt_now();
    }
}

async fn run_capture<E: EmulatorEngine>(
    engine: Arc<E>,
    queue: Arc<OperationQueue>,
    buffer: Arc<Mutex<RewindBuffer>>,
    state: StateManager,
    metrics: Arc<Metrics>,
    cadence: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if state.read(|s| s.status != SessionStatus::Running || s.is_rewinding) {
            continue;
        }

        let snapshot = {
            let Some(_gate) = queue.try_acquire_idle() else {
                metrics.record_rewind_skip();
                continue;
            };
            let _access = metrics.enter_engine();
            engine.capture_state()
        };

        match snapshot {
            Ok(snapshot) => {
                let size = {
                    let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                    buffer.push(snapshot);
                    buffer.len()
                };
                metrics.record_rewind_capture();
                state.update(|s| s.rewind_buffer_size = size);
            }
            Err(e) => tracing::warn!("Rewind capture failed: {}", e),
        }
    }
}

async fn run_playback<E: EmulatorEngine>(
    engine: Arc<E>,
    queue: Arc<OperationQueue>,
    buffer: Arc<Mutex<RewindBuffer>>,
    state: StateManager,
    cadence: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let (snapshot, remaining) = {
            let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
            (buffer.pop_latest(), buffer.len())
        };
        let Some(snapshot) = snapshot else {
            tracing::debug!("Rewind buffer exhausted");
            break;
        };
        state.update(|s| s.rewind_buffer_size = remaining);

        let engine = Arc::clone(&engine);
        let step = queue.enqueue("rewind-step", async move { engine.replace_state(&snapshot) });
        match step.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Rewind step failed: {}", e),
            Err(e) => {
                tracing::warn!("Rewind step not executed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::SimulatedEngine;

    const CADENCE: Duration = Duration::from_millis(10);

    fn setup(
        engine: SimulatedEngine,
        capacity: usize,
    ) -> (RewindController<SimulatedEngine>, Arc<SimulatedEngine>, Arc<OperationQueue>, Arc<Metrics>, StateManager) {
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(OperationQueue::new(Arc::clone(&metrics)));
        let engine = Arc::new(engine);
        let state = StateManager::new();
        state.update(|s| s.status = SessionStatus::Running);

        let controller = RewindController::new(
            Arc::clone(&engine),
            Arc::clone(&queue),
            state.clone(),
            Arc::clone(&metrics),
            CADENCE,
            capacity,
        );
        (controller, engine, queue, metrics, state)
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = RewindBuffer::new(3);
        assert!(!buffer.push(vec![1]));
        assert!(!buffer.push(vec![2]));
        assert!(!buffer.push(vec![3]));
        assert!(buffer.push(vec![4]));

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.pop_latest(), Some(vec![4]));
        assert_eq!(buffer.pop_latest(), Some(vec![3]));
        assert_eq!(buffer.pop_latest(), Some(vec![2]));
        assert_eq!(buffer.pop_latest(), None);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut buffer = RewindBuffer::new(0);
        buffer.push(vec![1]);
        buffer.push(vec![2]);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (controller, engine, _queue, _metrics, state) = setup(SimulatedEngine::new(), 100);

        controller.start();
        controller.start();
        assert!(controller.is_running());
        tokio::time::sleep(CADENCE * 6).await;

        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_running());
        assert!(!state.read(|s| s.rewind_capturing));

        let captured = engine.capture_count();
        assert!(captured > 0);
        assert_eq!(state.read(|s| s.rewind_buffer_size), controller.buffer_len());

        // Nothing captures after stop returns
        tokio::time::sleep(CADENCE * 4).await;
        assert_eq!(engine.capture_count(), captured);
    }

    #[tokio::test]
    async fn test_capture_skips_when_not_running() {
        let (controller, engine, _queue, _metrics, state) = setup(SimulatedEngine::new(), 100);
        state.update(|s| s.status = SessionStatus::Paused);

        controller.start();
        tokio::time::sleep(CADENCE * 5).await;
        controller.stop().await;

        assert_eq!(engine.capture_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_yields_to_busy_queue() {
        let (controller, engine, queue, metrics, _state) = setup(SimulatedEngine::new(), 100);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let blocked = queue.enqueue("long-save", async move {
            let _ = release_rx.await;
        });

        controller.start();
        tokio::time::sleep(CADENCE * 5).await;
        assert_eq!(engine.capture_count(), 0);
        assert!(metrics.rewind_ticks_skipped.load(Ordering::Relaxed) > 0);

        release_tx.send(()).unwrap();
        blocked.await.unwrap();
        tokio::time::sleep(CADENCE * 5).await;
        controller.stop().await;

        assert!(engine.capture_count() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capture_never_overlaps_queued_operations() {
        let (controller, engine, queue, metrics, _state) =
            setup(SimulatedEngine::with_access_delay(Duration::from_millis(2)), 100);

        controller.start();

        let mut results = Vec::new();
        for i in 0..30u64 {
            let engine = Arc::clone(&engine);
            results.push(queue.enqueue("replace", async move {
                engine.replace_state(&SimulatedEngine::encode_frame(i))
            }));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        for result in results {
            result.await.unwrap().unwrap();
        }

        controller.stop().await;
        assert!(engine.capture_count() > 0 || metrics.rewind_ticks_skipped.load(Ordering::Relaxed) > 0);
        assert_eq!(engine.max_concurrent_access(), 1);
        assert_eq!(metrics.max_engine_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let (controller, _engine, _queue, _metrics, state) = setup(SimulatedEngine::new(), 3);

        controller.start();
        tokio::time::sleep(CADENCE * 10).await;
        controller.stop().await;

        assert_eq!(controller.buffer_len(), 3);
        assert_eq!(state.read(|s| s.rewind_buffer_size), 3);

        controller.clear();
        assert_eq!(controller.buffer_len(), 0);
        assert_eq!(state.read(|s| s.rewind_buffer_size), 0);
    }

    #[tokio::test]
    async fn test_playback_steps_backwards_through_queue() {
        let (controller, engine, _queue, _metrics, state) = setup(SimulatedEngine::new(), 100);

        controller.start();
        for _ in 0..6 {
            engine.advance(1);
            tokio::time::sleep(CADENCE * 2).await;
        }

        assert!(controller.start_rewind().await);
        assert!(!controller.is_running());
        assert!(state.read(|s| s.is_rewinding));
        assert!(!controller.start_rewind().await);

        tokio::time::sleep(CADENCE * 5).await;
        controller.stop_rewind().await;

        let replaced = engine.replaced_frames();
        assert!(!replaced.is_empty());
        assert!(replaced.windows(2).all(|w| w[0] >= w[1]));

        assert!(!state.read(|s| s.is_rewinding));
        assert!(controller.is_running());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_rewind_with_empty_buffer_is_refused() {
        let (controller, _engine, _queue, _metrics, _state) = setup(SimulatedEngine::new(), 10);
        assert!(!controller.start_rewind().await);
        assert!(!controller.is_rewinding());
    }

    #[tokio::test]
    async fn test_suspend_halts_playback_and_capture() {
        let (controller, engine, _queue, _metrics, state) = setup(SimulatedEngine::new(), 100);

        controller.start();
        for _ in 0..4 {
            engine.advance(1);
            tokio::time::sleep(CADENCE * 2).await;
        }

        assert!(controller.start_rewind().await);
        assert!(controller.suspend().await);
        assert!(!controller.is_rewinding());
        assert!(!controller.is_running());
        assert!(!state.read(|s| s.is_rewinding));

        // No step lands after suspend returns
        let replaced = engine.replace_count();
        tokio::time::sleep(CADENCE * 5).await;
        assert_eq!(engine.replace_count(), replaced);

        assert!(!controller.suspend().await);
        controller.start();
        assert!(controller.is_running());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_start_during_playback_is_deferred() {
        let (controller, engine, _queue, _metrics, _state) = setup(SimulatedEngine::new(), 100);

        controller.start();
        for _ in 0..4 {
            engine.advance(1);
            tokio::time::sleep(CADENCE * 2).await;
        }
        assert!(controller.start_rewind().await);

        controller.start();
        assert!(!controller.is_running());

        controller.stop_rewind().await;
        assert!(controller.is_running());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_halt_now_stops_loops_without_waiting() {
        let (controller, engine, _queue, _metrics, _state) = setup(SimulatedEngine::new(), 100);

        controller.start();
        tokio::time::sleep(CADENCE * 4).await;
        controller.halt_now();
        assert!(!controller.is_running());

        tokio::time::sleep(CADENCE * 2).await;
        let captured = engine.capture_count();
        tokio::time::sleep(CADENCE * 6).await;
        assert_eq!(engine.capture_count(), captured);
    }
}
