//! Application close codes for QUIC connections.
//!
//! The relay closes a connection with one of these codes so the client can
//! tell an authentication rejection apart from a server fault or a
//! replacement by a newer login.

use std::fmt;

/// Reason a connection was closed by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Orderly close, or connection replaced by a newer login
    Normal,
    /// Server shutting down
    GoingAway,
    /// Authentication failed
    PolicyViolation,
    /// Unexpected server fault
    InternalError,
    /// Accept step failed or the relay is at capacity
    TryAgainLater,
    /// No heartbeat within the liveness timeout
    StaleConnection,
}

impl CloseCode {
    /// Every close code, in numeric order.
    pub const ALL: [Self; 6] = [
        Self::Normal,
        Self::GoingAway,
        Self::PolicyViolation,
        Self::InternalError,
        Self::TryAgainLater,
        Self::StaleConnection,
    ];

    /// Numeric application error code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::PolicyViolation => 1008,
            Self::InternalError => 1011,
            Self::TryAgainLater => 1013,
            Self::StaleConnection => 4000,
        }
    }

    /// Look up a close code by number.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Default reason text sent alongside the code.
    #[must_use]
    pub const fn default_reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::PolicyViolation => "authentication failed",
            Self::InternalError => "internal error",
            Self::TryAgainLater => "try again later",
            Self::StaleConnection => "stale connection",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.default_reason())
    }
}
