use crate::metrics::Metrics;
use crate::models::{AutoSaveState, SessionStatus};
use crate::session::notifier::Notifier;
use crate::state::StateManager;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Phase of the auto-save cycle, with the time spent in it where that matters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSavePhase {
    Idle,
    Counting { elapsed: Duration },
    Saving,
    Done { shown: Duration },
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSaveEffect {
    /// Push a save operation into the queue
    EnqueueSave,
    /// The save failed; tell the user, counting already restarted
    NotifyFailure,
}

/// Pure auto-save state machine
///
/// Time only moves through [`tick`](Self::tick), so the machine can be driven by a real
/// interval, tokio's paused clock, or plain test code.
///
/// Pausing freezes the phase and its progress. A save already dispatched still reports
/// back through [`save_finished`](Self::save_finished), but while paused no new save is
/// requested and no new cycle begins. Resuming continues from the frozen progress.
#[derive(Debug, Clone)]
pub struct AutoSaveMachine {
    phase: AutoSavePhase,
    paused: bool,
    /// Set by `start`, cleared by `disable`. An armed machine left in `Idle` because it
    /// was paused starts counting on resume.
    armed: bool,
    interval: Duration,
    done_display: Duration,
}

impl AutoSaveMachine {
    pub fn new(interval: Duration, done_display: Duration) -> Self {
        Self {
            phase: AutoSavePhase::Idle,
            paused: false,
            armed: false,
            interval,
            done_display,
        }
    }

    pub fn phase(&self) -> AutoSavePhase {
        self.phase
    }

    pub fn state(&self) -> AutoSaveState {
        match self.phase {
            AutoSavePhase::Idle => AutoSaveState::Idle,
            AutoSavePhase::Counting { .. } => AutoSaveState::Counting,
            AutoSavePhase::Saving => AutoSaveState::Saving,
            AutoSavePhase::Done { .. } => AutoSaveState::Done,
        }
    }

    /// Countdown progress in percent
    pub fn progress(&self) -> u8 {
        match self.phase {
            AutoSavePhase::Idle => 0,
            AutoSavePhase::Counting { elapsed } => {
                if self.interval.is_zero() {
                    return 100;
                }
                let ratio = elapsed.as_secs_f64() / self.interval.as_secs_f64();
                (ratio * 100.0).floor().clamp(0.0, 100.0) as u8
            }
            AutoSavePhase::Saving | AutoSavePhase::Done { .. } => 100,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm the machine and begin counting unless paused
    pub fn start(&mut self) {
        self.armed = true;
        if self.phase == AutoSavePhase::Idle && !self.paused {
            self.phase = AutoSavePhase::Counting {
                elapsed: Duration::ZERO,
            };
        }
    }

    /// Back to `Idle`; future scheduling stops, an in-flight save is unaffected
    pub fn disable(&mut self) {
        self.armed = false;
        self.phase = AutoSavePhase::Idle;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        if self.armed && self.phase == AutoSavePhase::Idle {
            self.phase = AutoSavePhase::Counting {
                elapsed: Duration::ZERO,
            };
        }
    }

    /// Advance time by `dt`
    pub fn tick(&mut self, dt: Duration) -> Option<AutoSaveEffect> {
        if self.paused {
            return None;
        }

        match self.phase {
            AutoSavePhase::Counting { elapsed } => {
                let elapsed = (elapsed + dt).min(self.interval);
                if elapsed >= self.interval {
                    self.phase = AutoSavePhase::Saving;
                    Some(AutoSaveEffect::EnqueueSave)
                } else {
                    self.phase = AutoSavePhase::Counting { elapsed };
                    None
                }
            }
            AutoSavePhase::Done { shown } => {
                let shown = shown + dt;
                self.phase = if shown >= self.done_display {
                    AutoSavePhase::Counting {
                        elapsed: Duration::ZERO,
                    }
                } else {
                    AutoSavePhase::Done { shown }
                };
                None
            }
            AutoSavePhase::Idle | AutoSavePhase::Saving => None,
        }
    }

    /// Report the outcome of the save requested by `EnqueueSave`
    pub fn save_finished(&mut self, success: bool) -> Option<AutoSaveEffect> {
        if self.phase != AutoSavePhase::Saving {
            // Disabled while the save was in flight
            return None;
        }

        if success {
            self.phase = AutoSavePhase::Done {
                shown: Duration::ZERO,
            };
            None
        } else {
            self.phase = AutoSavePhase::Counting {
                elapsed: Duration::ZERO,
            };
            Some(AutoSaveEffect::NotifyFailure)
        }
    }
}

/// Timing for the scheduler driver
#[derive(Debug, Clone, Copy)]
pub struct AutoSaveTiming {
    pub interval: Duration,
    pub done_display: Duration,
    pub tick: Duration,
}

#[derive(Debug)]
enum SchedulerCommand {
    Pause,
    Resume,
    TogglePause,
    Enable,
    Disable,
    SaveFinished(Result<(), String>),
    Shutdown,
}

/// Drives an [`AutoSaveMachine`] from a tokio interval
///
/// The scheduler never touches the emulator: when the machine asks for a save it calls
/// `save_action`, which is expected to push the save into the operation queue and
/// return a future for its outcome. A busy queue just means the save waits its turn.
pub struct AutoSaveScheduler {
    cmd_tx: mpsc::UnboundedSender<SchedulerCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSaveScheduler {
    /// Spawn the driver; it starts counting immediately when `enabled`
    pub fn spawn<A, Fut>(
        timing: AutoSaveTiming,
        enabled: bool,
        save_action: A,
        state: StateManager,
        notifier: Notifier,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        A: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_scheduler(
            timing,
            enabled,
            save_action,
            cmd_tx.clone(),
            cmd_rx,
            state,
            notifier,
            metrics,
        ));

        Self {
            cmd_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn pause(&self) {
        self.send(SchedulerCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(SchedulerCommand::Resume);
    }

    pub fn toggle_pause(&self) {
        self.send(SchedulerCommand::TogglePause);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.send(if enabled {
            SchedulerCommand::Enable
        } else {
            SchedulerCommand::Disable
        });
    }

    /// Stop the driver and wait for it; the indicator returns to `Idle`
    pub async fn shutdown(&self) {
        self.send(SchedulerCommand::Shutdown);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Auto-save scheduler task failed: {}", e);
            }
        }
    }

    fn send(&self, command: SchedulerCommand) {
        // Ignore send errors - the driver is already gone
        let _ = self.cmd_tx.send(command);
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(SchedulerCommand::Shutdown);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler<A, Fut>(
    timing: AutoSaveTiming,
    enabled: bool,
    save_action: A,
    cmd_tx: mpsc::UnboundedSender<SchedulerCommand>,
    mut cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    state: StateManager,
    notifier: Notifier,
    metrics: Arc<Metrics>,
) where
    A: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let mut machine = AutoSaveMachine::new(timing.interval, timing.done_display);
    if enabled {
        machine.start();
    }
    publish(&state, &machine, enabled);

    let mut ticker = tokio::time::interval(timing.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();

    tracing::info!(
        "Auto-save scheduler started: interval={:?}, enabled={}",
        timing.interval,
        enabled
    );

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    SchedulerCommand::Pause => machine.pause(),
                    SchedulerCommand::Resume => machine.resume(),
                    SchedulerCommand::TogglePause => {
                        if machine.is_paused() {
                            machine.resume();
                        } else {
                            machine.pause();
                        }
                        tracing::info!("Auto-save paused: {}", machine.is_paused());
                    }
                    SchedulerCommand::Enable => machine.start(),
                    SchedulerCommand::Disable => machine.disable(),
                    SchedulerCommand::SaveFinished(result) => {
                        let success = result.is_ok();
                        if success {
                            metrics.record_auto_save();
                        }
                        if let Some(AutoSaveEffect::NotifyFailure) = machine.save_finished(success) {
                            let message = result.err().unwrap_or_default();
                            tracing::warn!("Auto-save failed: {}", message);
                            notifier.error("Auto-save failed", message, true);
                        }
                    }
                    SchedulerCommand::Shutdown => break,
                }
            }
            now = ticker.tick() => {
                let dt = now.saturating_duration_since(last_tick);
                last_tick = now;

                // A paused game freezes the countdown just like the indicator toggle
                if state.read(|s| s.status != SessionStatus::Running) {
                    continue;
                }

                if let Some(AutoSaveEffect::EnqueueSave) = machine.tick(dt) {
                    // Show the full ring before switching to the saving indicator
                    state.update(|s| {
                        s.auto_save_state = AutoSaveState::Counting;
                        s.auto_save_progress = 100;
                    });

                    tracing::debug!("Auto-save interval elapsed, enqueueing save");
                    let outcome = save_action();
                    let reply = cmd_tx.clone();
                    tokio::spawn(async move {
                        let result = outcome.await;
                        let _ = reply.send(SchedulerCommand::SaveFinished(result));
                    });
                }
            }
        }

        publish(&state, &machine, machine.is_armed());
    }

    machine.disable();
    publish(&state, &machine, false);
    tracing::info!("Auto-save scheduler stopped");
}

fn publish(state: &StateManager, machine: &AutoSaveMachine, enabled: bool) {
    let (auto_save_state, progress, paused) =
        (machine.state(), machine.progress(), machine.is_paused());

    state.update(|s| {
        s.auto_save_enabled = enabled;
        s.auto_save_state = auto_save_state;
        s.auto_save_progress = progress;
        s.auto_save_paused = paused;
    });
}
