//! Request/response API envelope exchanged on `{prefix}/request|response/{name}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Outcome reported by the cloud for an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiStatus {
    Failed,
    Running,
    Succeeded,
    TimedOut,
    Aborted,
}

/// Response payload published by the cloud on `{prefix}/response/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status == ApiStatus::Succeeded
    }

    /// Human-readable message, when the response carries one.
    pub fn message(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.get("message"))
            .and_then(|m| m.as_str())
    }
}

/// API names the device knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiTopic {
    Hello,
    Ping,
}

impl ApiTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Ping => "ping",
        }
    }
}

impl fmt::Display for ApiTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiTopic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hello" => Ok(Self::Hello),
            "ping" => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownApiTopic(other.to_string())),
        }
    }
}
