//! In-memory input injector.
//!
//! Each action is appended to `actions` so callers can inspect exactly what
//! would have been injected, in order.  Set `should_fail` to exercise error
//! paths without a broken platform tool.

use std::sync::Mutex;

use mirror_core::InputAction;
use tracing::info;

use crate::application::control::{InjectionError, InputInjector};

#[derive(Default)]
pub struct RecordingInjector {
    pub actions: Mutex<Vec<InputAction>>,
    pub should_fail: bool,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything injected so far.
    pub fn recorded(&self) -> Vec<InputAction> {
        self.actions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl InputInjector for RecordingInjector {
    fn inject(&self, action: &InputAction) -> Result<(), InjectionError> {
        if self.should_fail {
            return Err(InjectionError::Unavailable("recording backend set to fail".into()));
        }
        info!("input: {action}");
        self.actions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(*action);
        Ok(())
    }
}
