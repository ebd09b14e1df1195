use std::{borrow::Borrow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Longest accepted session id, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSessionId {
    #[error("session id is empty")]
    Empty,
    #[error("session id exceeds {MAX_SESSION_ID_LEN} bytes")]
    TooLong,
    #[error("session id contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Tenant-scoped opaque session identifier.
///
/// Ids travel inside URL paths, so whitespace, control characters and `/`
/// are rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidSessionId::Empty);
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidSessionId::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || *c == '/' || *c == '?')
        {
            return Err(InvalidSessionId::ForbiddenChar(c));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Externally visible lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Open,
    /// Open, and the credentials have been confirmed by the service.
    Authenticated,
    /// Socket closed; a reconnect may be pending.
    Closing,
    Destroyed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Authenticated => "authenticated",
            Self::Closing => "closing",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        let id = SessionId::new("tenant-a_main.1").unwrap();
        assert_eq!(id.as_str(), "tenant-a_main.1");
        assert_eq!(id.to_string(), "tenant-a_main.1");
    }

    #[test]
    fn rejects_unroutable_ids() {
        assert_eq!(SessionId::new(""), Err(InvalidSessionId::Empty));
        assert_eq!(
            SessionId::new("a/b"),
            Err(InvalidSessionId::ForbiddenChar('/'))
        );
        assert_eq!(
            SessionId::new("a b"),
            Err(InvalidSessionId::ForbiddenChar(' '))
        );
        assert_eq!(
            SessionId::new("x".repeat(MAX_SESSION_ID_LEN + 1)),
            Err(InvalidSessionId::TooLong)
        );
    }

    #[test]
    fn serde_validates() {
        let id: SessionId = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(id.as_str(), "s1");
        assert!(serde_json::from_str::<SessionId>("\"\"").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Authenticated).unwrap();
        assert_eq!(json, "\"authenticated\"");
    }
}
