//! Session identity and negotiation state.

use std::fmt;

use uuid::Uuid;

/// Opaque identifier assigned to every accepted connection, derived from UUID v4.
pub type SessionId = Uuid;

/// Lifecycle of one session's media negotiation.
///
/// ```text
/// New ──start──▶ Negotiating ──capture ready──▶ Attached
///  │                 │                             │
///  └─────────────────┴──────connection closed──────┴──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NegotiationState {
    /// Connection accepted; no peer connection yet.
    #[default]
    New,
    /// Peer connection created and offer sent; waiting for the answer, the
    /// transport, or an active capture.
    Negotiating,
    /// Receiving frames from the capture manager.
    Attached,
    /// Terminal.  All resources released.
    Closed,
}

impl NegotiationState {
    /// `true` once the session can never change state again.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// `true` while the session holds, or is acquiring, media resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Negotiating | Self::Attached)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Attached => "attached",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
