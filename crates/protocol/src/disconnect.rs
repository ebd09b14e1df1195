use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason attached to a connection close, carried as the service's numeric
/// status code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Unavailable,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::Unavailable => 503,
            Self::RestartRequired => 515,
            Self::Other(code) => code,
        }
    }

    /// Codes after which reconnecting can never succeed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::ConnectionReplaced | Self::BadSession | Self::MultideviceMismatch
        )
    }

    /// Only a logout invalidates the stored key material.
    pub fn wipes_credentials(self) -> bool {
        self == Self::LoggedOut
    }
}

impl From<u16> for DisconnectReason {
    fn from(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::Unavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }
}

impl From<DisconnectReason> for u16 {
    fn from(reason: DisconnectReason) -> Self {
        reason.code()
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection_lost",
            Self::MultideviceMismatch => "multidevice_mismatch",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::Unavailable => "unavailable",
            Self::RestartRequired => "restart_required",
            Self::Other(_) => "other",
        };
        write!(f, "{name} ({})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_form() {
        for code in [401u16, 403, 408, 411, 428, 440, 500, 503, 515, 499] {
            assert_eq!(DisconnectReason::from(code).code(), code);
        }
        let reason: DisconnectReason = serde_json::from_str("440").unwrap();
        assert_eq!(reason, DisconnectReason::ConnectionReplaced);
    }

    #[test]
    fn terminal_set() {
        assert!(DisconnectReason::LoggedOut.is_terminal());
        assert!(DisconnectReason::ConnectionReplaced.is_terminal());
        assert!(DisconnectReason::BadSession.is_terminal());
        assert!(DisconnectReason::MultideviceMismatch.is_terminal());
        assert!(!DisconnectReason::RestartRequired.is_terminal());
        assert!(!DisconnectReason::ConnectionLost.is_terminal());
        assert!(!DisconnectReason::Other(499).is_terminal());
    }

    #[test]
    fn only_logout_wipes() {
        assert!(DisconnectReason::LoggedOut.wipes_credentials());
        assert!(!DisconnectReason::BadSession.wipes_credentials());
    }
}
