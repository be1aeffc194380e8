//! Wire protocol
//!
//! One JSON document per line. Requests are `{action, payload}`, responses are
//! `{action, status, message, data}`. The action string is validated into the
//! closed [`Action`] set at the boundary; payloads are decoded into typed
//! structs by the handlers that own them.

use std::{fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{MeshError, MeshResult},
    sync::EntityType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    AddPeer,
    SyncRequest,
    Ping,
    Pong,
    ListPeersRequest,
    CheckRoots,
    GetIds,
    GetEntity,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::AddPeer,
        Action::SyncRequest,
        Action::Ping,
        Action::Pong,
        Action::ListPeersRequest,
        Action::CheckRoots,
        Action::GetIds,
        Action::GetEntity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AddPeer => "add-peer",
            Action::SyncRequest => "sync-request",
            Action::Ping => "ping",
            Action::Pong => "pong",
            Action::ListPeersRequest => "list-peers-request",
            Action::CheckRoots => "check-roots",
            Action::GetIds => "get-ids",
            Action::GetEntity => "get-entity",
        }
    }

    /// Action name carried by the reply to this request
    pub fn reply_action(&self) -> Action {
        match self {
            Action::Ping => Action::Pong,
            other => *other,
        }
    }

    /// Fire-and-forget actions never get an error reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Action::Ping | Action::ListPeersRequest)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| MeshError::UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(action: Action, payload: Option<Value>) -> Self {
        Self {
            action: action.as_str().to_string(),
            payload,
        }
    }

    pub fn with_payload<P: Serialize>(action: Action, payload: &P) -> MeshResult<Self> {
        Ok(Self::new(action, Some(serde_json::to_value(payload)?)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub action: String,
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ResponseEnvelope {
    pub fn success(action: Action, data: Option<Value>) -> Self {
        Self {
            action: action.as_str().to_string(),
            status: Status::Success,
            message: None,
            data,
        }
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: Status::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    /// Decode one line. A document carrying `status` is a response.
    pub fn decode(line: &str) -> MeshResult<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| MeshError::MalformedEnvelope(format!("invalid json: {}", e)))?;

        let obj = value
            .as_object()
            .ok_or_else(|| MeshError::MalformedEnvelope("envelope is not an object".into()))?;
        match obj.get("action") {
            Some(Value::String(_)) => {}
            _ => return Err(MeshError::MalformedEnvelope("missing action".into())),
        }

        let envelope = if obj.contains_key("status") {
            Envelope::Response(
                serde_json::from_value(value)
                    .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?,
            )
        } else {
            Envelope::Request(
                serde_json::from_value(value)
                    .map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?,
            )
        };
        Ok(envelope)
    }

    pub fn action(&self) -> &str {
        match self {
            Envelope::Request(req) => &req.action,
            Envelope::Response(resp) => &resp.action,
        }
    }

    /// Encode as a single line without the trailing newline.
    pub fn encode(&self) -> MeshResult<String> {
        let line = match self {
            Envelope::Request(req) => serde_json::to_string(req)?,
            Envelope::Response(resp) => serde_json::to_string(resp)?,
        };
        Ok(line)
    }
}

impl From<RequestEnvelope> for Envelope {
    fn from(req: RequestEnvelope) -> Self {
        Envelope::Request(req)
    }
}

impl From<ResponseEnvelope> for Envelope {
    fn from(resp: ResponseEnvelope) -> Self {
        Envelope::Response(resp)
    }
}

/// Decode a typed payload, mapping a missing or mistyped payload to
/// [`MeshError::InvalidPayload`].
pub fn decode_payload<P: DeserializeOwned>(action: Action, payload: Option<Value>) -> MeshResult<P> {
    let value = payload.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| MeshError::invalid_payload(action.as_str(), e.to_string()))
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerPayload {
    pub ip: String,
    pub port: u16,
}

/// Carried by both `ping` and `pong`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub uuid: uuid::Uuid,
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEntityPayload {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdsReply {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReply {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub data: Value,
}
