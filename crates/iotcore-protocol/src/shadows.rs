use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Device-reported state, serialized as `{"reported": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedState {
    #[serde(default)]
    pub reported: Map<String, Value>,
}

/// Shadow update request from the device.
///
/// Serializes to the AWS IoT body `{"state":{"reported":{...}}}`. The shadow
/// name is carried in the topic, not the body. No local merge is performed:
/// the shadow service owns conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowUpdateDocument {
    /// Shadow name (empty for the classic shadow).
    #[serde(skip)]
    pub shadow_name: String,
    pub state: ReportedState,
    /// Echoed back on the accepted/rejected topics.
    #[serde(
        rename = "clientToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_token: Option<String>,
}

impl ShadowUpdateDocument {
    pub fn new(shadow_name: impl Into<String>, reported: Map<String, Value>) -> Self {
        Self {
            shadow_name: shadow_name.into(),
            state: ReportedState { reported },
            client_token: None,
        }
    }

    /// Build a document from any serializable value that maps to a JSON object.
    pub fn from_state<T: Serialize + ?Sized>(
        shadow_name: impl Into<String>,
        state: &T,
    ) -> ProtocolResult<Self> {
        match serde_json::to_value(state)? {
            Value::Object(reported) => Ok(Self::new(shadow_name, reported)),
            other => Err(ProtocolError::ReportedNotObject(json_kind(&other))),
        }
    }

    /// Attach a random client token for correlating the broker's answer.
    pub fn with_client_token(mut self) -> Self {
        self.client_token = Some(Uuid::new_v4().to_string());
        self
    }

    pub fn reported(&self) -> &Map<String, Value> {
        &self.state.reported
    }
}

/// Body of `.../update/accepted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowAccepted {
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
}

/// Body of `.../update/rejected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowRejected {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
