//! Session layer
//!
//! [`SessionController`] owns one emulation session: it wires the operation queue,
//! auto-save scheduler, rewind controller and slot session to a single engine handle
//! and drives the session lifecycle. [`Notifier`] carries user-facing messages out.

pub mod controller;
pub mod notifier;

pub use controller::SessionController;
pub use notifier::{Notification, NotificationKind, Notifier};
