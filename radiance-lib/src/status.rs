use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

/// Process-wide tunnel status. Mutated only by the tunnel service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Broadcast on the event bus for every status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Status {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Status::Disconnected => 0,
            Status::Connecting => 1,
            Status::Connected => 2,
            Status::Disconnecting => 3,
            Status::Error => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Status {
        match raw {
            1 => Status::Connecting,
            2 => Status::Connected,
            3 => Status::Disconnecting,
            4 => Status::Error,
            _ => Status::Disconnected,
        }
    }
}

impl StatusUpdate {
    pub fn new(status: Status) -> Self {
        StatusUpdate { status, cause: None }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        StatusUpdate {
            status: Status::Error,
            cause: Some(cause.into()),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Disconnected => write!(f, "disconnected"),
            Status::Connecting => write!(f, "connecting"),
            Status::Connected => write!(f, "connected"),
            Status::Disconnecting => write!(f, "disconnecting"),
            Status::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Status::Connected)?, "\"connected\"");
        let parsed: Status = serde_json::from_str("\"disconnecting\"")?;
        assert_eq!(parsed, Status::Disconnecting);
        Ok(())
    }

    #[test]
    fn atomic_encoding_round_trips() {
        for status in [
            Status::Disconnected,
            Status::Connecting,
            Status::Connected,
            Status::Disconnecting,
            Status::Error,
        ] {
            assert_eq!(Status::from_u8(status.as_u8()), status);
        }
    }
}
