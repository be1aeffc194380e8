//! Mesh error types.
//!
//! One error enum for the whole core. Transport faults, protocol faults and
//! store failures all surface as [`MeshError`]; the message router decides
//! whether a given error becomes an error-status reply or a log line.

use thiserror::Error;

use crate::sync::EntityType;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("{entity_type} entity not found: {id}")]
    EntityNotFound { entity_type: EntityType, id: String },

    #[error("Connection limit reached ({0} connections)")]
    ConnectionLimit(usize),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Reconnect budget exhausted for {peer} after {attempts} attempts")]
    ReconnectExhausted { peer: String, attempts: u32 },

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Peer directory error: {0}")]
    Directory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    pub fn invalid_payload(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Transport faults end the connection they happened on.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            MeshError::MalformedEnvelope(_)
                | MeshError::Io(_)
                | MeshError::ConnectTimeout(_)
                | MeshError::NotConnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MeshError::EntityNotFound {
            entity_type: EntityType::User,
            id: "u-1".to_string(),
        };
        assert_eq!(err.to_string(), "USER entity not found: u-1");

        let err = MeshError::invalid_payload("add-peer", "missing field `ip`");
        assert_eq!(
            err.to_string(),
            "Invalid payload for 'add-peer': missing field `ip`"
        );
    }

    #[test]
    fn test_transport_fault_classification() {
        assert!(MeshError::MalformedEnvelope("x".into()).is_transport_fault());
        assert!(!MeshError::UnknownAction("x".into()).is_transport_fault());
        assert!(!MeshError::invalid_payload("ping", "bad").is_transport_fault());
    }
}
