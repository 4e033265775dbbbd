//! Services module - the save-state coordination core.
//!
//! Everything that reads or writes the emulator's run-state lives here. The services have
//! no UI dependencies; they publish through [`StateManager`](crate::state::StateManager)
//! and [`Notifier`](crate::session::Notifier) and are wired together by
//! [`SessionController`](crate::session::SessionController).
//!
//! # Components
//!
//! - [`OperationQueue`]: strict FIFO serializer; at most one operation touches the engine
//!   at a time, and a failing or panicking operation only fails its own result.
//! - [`AutoSaveMachine`] / [`AutoSaveScheduler`]: pure countdown state machine and the
//!   tokio timer that drives it, producing saves into the queue.
//! - [`RewindController`]: fixed-cadence capture into a bounded [`RewindBuffer`] that
//!   yields to queued work, plus backward playback as queued replace steps.
//! - [`SaveSlotSession`]: manual save, load and delete against a [`SlotStore`].
//! - [`EmulatorEngine`]: the narrow capability interface to the emulator core, with
//!   [`SimulatedEngine`] for headless runs and tests.
//!
//! # Exclusivity
//!
//! The engine is not reentrant. Every mutating access goes through the queue; the
//! only out-of-band reader, rewind capture, takes the queue's engine gate and only when
//! nothing is running or waiting:
//!
//! ```ignore
//! let Some(_gate) = queue.try_acquire_idle() else {
//!     return; // skip this tick
//! };
//! let snapshot = engine.capture_state()?;
//! ```

pub mod autosave;
pub mod engine;
pub mod queue;
pub mod rewind;
pub mod slots;
pub mod store;

pub use autosave::{AutoSaveEffect, AutoSaveMachine, AutoSavePhase, AutoSaveScheduler, AutoSaveTiming};
pub use engine::{EmulatorEngine, EngineError, SimulatedEngine};
pub use queue::{OperationQueue, QueueError};
pub use rewind::{RewindBuffer, RewindController};
pub use slots::{Confirmation, SaveSlotSession, SlotError, SlotOutcome};
pub use store::{FileSlotStore, MemorySlotStore, RomIdentity, SlotMetadata, SlotStore, StoreError};
