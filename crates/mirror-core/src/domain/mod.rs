//! Domain entities for Screen-Mirror.
//!
//! Pure value types with no I/O: session identity and negotiation state, and
//! the capture-side types shared between the capture manager and the
//! negotiation engine.  Outer layers depend on these; nothing here depends on
//! them.

/// Session identity and the negotiation state enum.
pub mod session;

/// Capture grants, screen metrics, video frames, and the attach policy.
pub mod capture;
