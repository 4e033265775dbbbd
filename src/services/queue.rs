use crate::metrics::Metrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{MutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work waiting in the queue
///
/// Insertion order is the only ordering key; `seq` mirrors it for logging.
struct QueuedOperation {
    seq: u64,
    label: &'static str,
    job: Job,
}

/// Errors reported to the caller of [`OperationQueue::enqueue`]
///
/// The operation's own failure is never one of these: it travels inside the
/// operation's output (`T` is usually a `Result`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Operation queue is closed")]
    Closed,

    #[error("Operation {label} (#{seq}) was cancelled before it started")]
    Cancelled { seq: u64, label: &'static str },

    #[error("Operation {label} (#{seq}) panicked")]
    Panicked { seq: u64, label: &'static str },
}

/// Strict FIFO serializer for everything that touches the emulator handle
///
/// A single worker task owns execution order: [`enqueue`](Self::enqueue) pushes into an
/// unbounded channel synchronously, so the position in line is fixed at call time, and
/// the worker runs one operation at a time, waiting for each to settle before it pulls
/// the next. A failing or panicking operation only rejects its own result.
///
/// The worker holds the engine gate while an operation runs. Readers that bypass the
/// queue (the rewind capture loop) must take the gate through
/// [`try_acquire_idle`](Self::try_acquire_idle), which also refuses while anything is
/// waiting in line.
///
/// Must be created inside a tokio runtime.
pub struct OperationQueue {
    /// `None` once the queue is closed. Assigning `seq` and sending happen under this
    /// lock so sequence numbers match channel order.
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedOperation>>>,

    next_seq: AtomicU64,

    /// Operations enqueued but not yet settled (running one included)
    pending: Arc<AtomicUsize>,

    gate: Arc<tokio::sync::Mutex<()>>,

    shutdown_tx: watch::Sender<bool>,

    worker: Mutex<Option<JoinHandle<()>>>,

    metrics: Arc<Metrics>,
}

impl OperationQueue {
    /// Create a queue and spawn its worker on the current runtime
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Mutex::new(()));

        let worker = tokio::spawn(run_worker(
            rx,
            shutdown_rx,
            Arc::clone(&gate),
            Arc::clone(&pending),
            Arc::clone(&metrics),
        ));

        tracing::debug!("Operation queue worker started");

        Self {
            sender: Mutex::new(Some(tx)),
            next_seq: AtomicU64::new(0),
            pending,
            gate,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    /// Add an operation to the end of the line
    ///
    /// `op` is not polled until every previously enqueued operation has settled. The
    /// returned future resolves with the operation's output; dropping it does not
    /// cancel the operation.
    pub fn enqueue<F, T>(
        &self,
        label: &'static str,
        op: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + use<F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.push(label, op);

        async move {
            let (seq, rx) = receiver?;
            rx.await
                .unwrap_or(Err(QueueError::Cancelled { seq, label }))
        }
    }

    #[allow(clippy::type_complexity)]
    fn push<F, T>(
        &self,
        label: &'static str,
        op: F,
    ) -> Result<(u64, oneshot::Receiver<Result<T, QueueError>>), QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(QueueError::Closed)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let metrics = Arc::clone(&self.metrics);

        let job = Box::pin(async move {
            // A panic inside `op` is confined to its own task
            let outcome = match tokio::spawn(op).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_panic() => {
                    tracing::error!("Queued operation {} (#{}) panicked", label, seq);
                    metrics.record_failed();
                    Err(QueueError::Panicked { seq, label })
                }
                Err(_) => Err(QueueError::Cancelled { seq, label }),
            };

            // The caller may have stopped listening; the work still happened
            let _ = result_tx.send(outcome);
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(QueuedOperation { seq, label, job }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }

        self.metrics.record_enqueued();
        tracing::debug!("Enqueued {} (#{}), {} pending", label, seq, self.pending_len());

        Ok((seq, result_rx))
    }

    /// Wait until everything enqueued before this call has settled
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.enqueue("flush", async {}).await
    }

    /// Number of operations enqueued and not yet settled
    pub fn pending_len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether any operation is running or waiting
    pub fn is_busy(&self) -> bool {
        self.pending_len() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Take the engine gate for an out-of-band read, if the queue is idle
    ///
    /// Returns `None` while any operation is running or waiting, so out-of-band readers
    /// yield to queued work instead of delaying it.
    pub fn try_acquire_idle(&self) -> Option<MutexGuard<'_, ()>> {
        if self.is_busy() {
            return None;
        }
        self.gate.try_lock().ok()
    }

    /// Stop accepting operations and cancel those that have not started
    ///
    /// An operation already running finishes normally.
    pub fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if sender.is_some() {
            tracing::info!("Closing operation queue with {} pending", self.pending_len());
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Close the queue and wait for the worker to exit
    pub async fn shutdown(&self) {
        self.close();

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Operation queue worker failed: {}", e);
            }
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedOperation>,
    mut shutdown_rx: watch::Receiver<bool>,
    gate: Arc<tokio::sync::Mutex<()>>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let _gate = gate.lock().await;
        let _access = metrics.enter_engine();
        let started = Instant::now();

        tracing::debug!("Running {} (#{})", op.label, op.seq);
        op.job.await;

        let elapsed = started.elapsed();
        metrics.record_completed(elapsed);
        pending.fetch_sub(1, Ordering::SeqCst);

        tracing::debug!(
            "Settled {} (#{}) in {:.1}ms",
            op.label,
            op.seq,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    // Drop everything still in line so their callers see `Cancelled`
    rx.close();
    while let Ok(op) = rx.try_recv() {
        tracing::debug!("Cancelled {} (#{})", op.label, op.seq);
        metrics.record_cancelled();
        pending.fetch_sub(1, Ordering::SeqCst);
    }

    tracing::debug!("Operation queue worker stopped");
}
