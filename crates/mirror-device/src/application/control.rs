//! Use case: translate inbound control events into injected input.
//!
//! Control events arrive two ways: as raw bytes on a session's `control` data
//! channel and as the `event` object of a `control_event` signaling message.
//! Both go through [`mirror_core::decode_control_event`] and then to an
//! [`InputInjector`] in the infrastructure layer.
//!
//! Dispatch is fire-and-forget.  Nothing is reported back to the controller:
//! a malformed event or an injection failure is logged and dropped.

use std::sync::Arc;

use mirror_core::{
    decode_control_event, parse_control_payload, ControlEvent, GestureTimings, InputAction,
    SessionId,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for input injection.
#[derive(Debug, Error, PartialEq)]
pub enum InjectionError {
    #[error("input backend unavailable: {0}")]
    Unavailable(String),
    #[error("input backend rejected {action}: {reason}")]
    Rejected { action: String, reason: String },
}

/// OS-level input injection.
///
/// `inject` must not wait for the gesture to finish; a long press or a swipe
/// takes hundreds of milliseconds on the device.
#[cfg_attr(test, mockall::automock)]
pub trait InputInjector: Send + Sync {
    fn inject(&self, action: &InputAction) -> Result<(), InjectionError>;
}

/// Decodes control events and hands the resulting actions to the injector.
pub struct ControlTranslator {
    injector: Arc<dyn InputInjector>,
    timings: GestureTimings,
}

impl ControlTranslator {
    pub fn new(injector: Arc<dyn InputInjector>, timings: GestureTimings) -> Self {
        Self { injector, timings }
    }

    pub fn timings(&self) -> GestureTimings {
        self.timings
    }

    /// Handles a decoded control event.  Returns the action dispatched, or
    /// `None` if the event was dropped.
    pub fn handle_event(&self, session: SessionId, event: &ControlEvent) -> Option<InputAction> {
        let action = match decode_control_event(event, &self.timings) {
            Ok(action) => action,
            Err(e) => {
                warn!("session {session}: control event dropped: {e}");
                return None;
            }
        };

        debug!("session {session}: injecting {action}");
        if let Err(e) = self.injector.inject(&action) {
            warn!("session {session}: injection failed: {e}");
        }
        Some(action)
    }

    /// Handles the raw bytes of one data-channel message.
    pub fn handle_payload(&self, session: SessionId, payload: &[u8]) -> Option<InputAction> {
        match parse_control_payload(payload) {
            Ok(event) => self.handle_event(session, &event),
            Err(e) => {
                warn!(
                    "session {session}: control payload dropped ({} bytes): {e}",
                    payload.len()
                );
                None
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
