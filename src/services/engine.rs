use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the emulator capability interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to capture state: {0}")]
    Capture(String),

    #[error("Failed to replace state: {0}")]
    Replace(String),

    #[error("Screenshot unavailable: {0}")]
    Screenshot(String),
}

/// Narrow view of the emulator core used by the save-state subsystem
///
/// Implementations are not expected to be reentrant: `capture_state` racing
/// `replace_state` is undefined. Callers go through
/// [`OperationQueue`](crate::services::OperationQueue), or take its engine gate, before
/// calling anything here other than `pause`/`resume`.
#[cfg_attr(test, mockall::automock)]
pub trait EmulatorEngine: Send + Sync + 'static {
    /// Snapshot the current run-state
    fn capture_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Replace the run-state with a previously captured snapshot
    fn replace_state(&self, state: &[u8]) -> Result<(), EngineError>;

    /// Best-effort PNG of the current frame; `Ok(None)` when nothing is rendered yet
    fn screenshot(&self) -> Result<Option<Vec<u8>>, EngineError>;

    /// Stop executing frames. Idempotent.
    fn pause(&self);

    /// Continue executing frames. Idempotent.
    fn resume(&self);
}

/// In-process engine that advances a frame counter
///
/// Used by the headless driver and by tests. It records how many callers are inside
/// `capture_state`/`replace_state` at once, so exclusivity violations show up as
/// [`max_concurrent_access`](Self::max_concurrent_access) above one.
pub struct SimulatedEngine {
    frame: AtomicU64,
    paused: AtomicBool,

    /// Simulated work inside capture/replace; widens any overlap window
    access_delay: Duration,

    fail_next_capture: AtomicBool,
    fail_next_replace: AtomicBool,
    fail_screenshots: AtomicBool,

    in_use: AtomicUsize,
    max_in_use: AtomicUsize,
    captures: AtomicU64,
    replaces: AtomicU64,

    /// Every state passed to `replace_state`, oldest first
    replaced: Mutex<Vec<u64>>,
}

const STATE_MAGIC: &[u8; 4] = b"SKST";

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::with_access_delay(Duration::ZERO)
    }

    pub fn with_access_delay(access_delay: Duration) -> Self {
        Self {
            frame: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            access_delay,
            fail_next_capture: AtomicBool::new(false),
            fail_next_replace: AtomicBool::new(false),
            fail_screenshots: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            max_in_use: AtomicUsize::new(0),
            captures: AtomicU64::new(0),
            replaces: AtomicU64::new(0),
            replaced: Mutex::new(Vec::new()),
        }
    }

    /// Run `frames` frames unless paused
    pub fn advance(&self, frames: u64) {
        if !self.is_paused() {
            self.frame.fetch_add(frames, Ordering::SeqCst);
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn fail_next_capture(&self) {
        self.fail_next_capture.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_replace(&self) {
        self.fail_next_replace.store(true, Ordering::SeqCst);
    }

    pub fn set_screenshots_failing(&self, failing: bool) {
        self.fail_screenshots.store(failing, Ordering::SeqCst);
    }

    pub fn capture_count(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn replace_count(&self) -> u64 {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Frames restored through `replace_state`, oldest first
    pub fn replaced_frames(&self) -> Vec<u64> {
        self.replaced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn max_concurrent_access(&self) -> usize {
        self.max_in_use.load(Ordering::SeqCst)
    }

    /// Encode a frame number the way `capture_state` does
    pub fn encode_frame(frame: u64) -> Vec<u8> {
        let mut state = Vec::with_capacity(12);
        state.extend_from_slice(STATE_MAGIC);
        state.extend_from_slice(&frame.to_le_bytes());
        state
    }

    fn decode_frame(state: &[u8]) -> Option<u64> {
        let payload = state.strip_prefix(STATE_MAGIC.as_slice())?;
        let bytes: [u8; 8] = payload.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    fn enter(&self) -> AccessGuard<'_> {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_use.fetch_max(now, Ordering::SeqCst);
        if !self.access_delay.is_zero() {
            std::thread::sleep(self.access_delay);
        }
        AccessGuard { engine: self }
    }
}

struct AccessGuard<'a> {
    engine: &'a SimulatedEngine,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.engine.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorEngine for SimulatedEngine {
    fn capture_state(&self) -> Result<Vec<u8>, EngineError> {
        let _guard = self.enter();
        if self.fail_next_capture.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Capture("simulated capture fault".to_string()));
        }

        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Self::encode_frame(self.frame()))
    }

    fn replace_state(&self, state: &[u8]) -> Result<(), EngineError> {
        let _guard = self.enter();
        if self.fail_next_replace.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Replace("simulated replace fault".to_string()));
        }

        let frame = Self::decode_frame(state)
            .ok_or_else(|| EngineError::Replace(format!("unrecognized state ({} bytes)", state.len())))?;

        self.frame.store(frame, Ordering::SeqCst);
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.replaced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        Ok(())
    }

    fn screenshot(&self) -> Result<Option<Vec<u8>>, EngineError> {
        if self.fail_screenshots.load(Ordering::SeqCst) {
            return Err(EngineError::Screenshot("canvas not ready".to_string()));
        }
        // PNG signature followed by the frame number stands in for an encoded frame
        let mut image = b"\x89PNG\r\n\x1a\n".to_vec();
        image.extend_from_slice(&self.frame().to_le_bytes());
        Ok(Some(image))
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_replace_restores_frame() {
        let engine = SimulatedEngine::new();
        engine.advance(10);
        let state = engine.capture_state().unwrap();

        engine.advance(5);
        assert_eq!(engine.frame(), 15);

        engine.replace_state(&state).unwrap();
        assert_eq!(engine.frame(), 10);
        assert_eq!(engine.replaced_frames(), vec![10]);
    }

    #[test]
    fn test_paused_engine_does_not_advance() {
        let engine = SimulatedEngine::new();
        engine.pause();
        engine.pause();
        engine.advance(3);
        assert_eq!(engine.frame(), 0);

        engine.resume();
        engine.advance(3);
        assert_eq!(engine.frame(), 3);
    }

    #[test]
    fn test_injected_faults_are_one_shot() {
        let engine = SimulatedEngine::new();
        engine.fail_next_capture();

        assert!(matches!(engine.capture_state(), Err(EngineError::Capture(_))));
        assert!(engine.capture_state().is_ok());
        assert_eq!(engine.capture_count(), 1);
    }

    #[test]
    fn test_replace_rejects_foreign_state() {
        let engine = SimulatedEngine::new();
        let result = engine.replace_state(b"not a state");
        assert!(matches!(result, Err(EngineError::Replace(_))));
        assert_eq!(engine.replace_count(), 0);
    }

    #[test]
    fn test_screenshot_failure_is_reported() {
        let engine = SimulatedEngine::new();
        assert!(engine.screenshot().unwrap().is_some());

        engine.set_screenshots_failing(true);
        assert!(matches!(engine.screenshot(), Err(EngineError::Screenshot(_))));
    }
}
