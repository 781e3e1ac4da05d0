//! Session lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[default]
    Stopped,
    Starting,
    ScanQrCode,
    Working,
    Failed,
}

impl SessionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-entering the current state is allowed (QR refreshes repeat `SCAN_QR_CODE`).
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Failed) => true,
            (Stopped, Starting) => true,
            (Starting, ScanQrCode | Working | Stopped) => true,
            (ScanQrCode, ScanQrCode | Starting | Working | Stopped) => true,
            (Working, Stopped | Starting) => true,
            (Failed, Stopped | Starting) => true,
            (Starting, Starting) | (Working, Working) | (Stopped, Stopped) => true,
            _ => false,
        }
    }

    /// Whether boot recovery should restart a session persisted in this state.
    pub const fn should_recover(self) -> bool {
        !matches!(self, Self::Stopped)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::ScanQrCode => "SCAN_QR_CODE",
            Self::Working => "WORKING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
