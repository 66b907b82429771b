use thiserror::Error;

use crate::model::ConnectionId;
use crate::signaling::SignalingError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("signaling failure: {0}")]
    Signaling(#[from] SignalingError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("connection {0} has not been started")]
    NotStarted(ConnectionId),
    #[error("lifecycle hook failed: {0}")]
    Hook(String),
}

impl MeshError {
    pub fn peer_not_found(id: impl ToString) -> Self {
        MeshError::NotFound {
            kind: "peer",
            id: id.to_string(),
        }
    }

    pub fn connection_not_found(id: impl ToString) -> Self {
        MeshError::NotFound {
            kind: "connection",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound { .. })
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
