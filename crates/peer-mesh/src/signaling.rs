//! Signaling pipe between the two sides of one peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::transport::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling send failed: {0}")]
    Send(String),
}

/// Named messages exchanged for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Ice {
        candidate: IceCandidate,
    },
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalMessage {
    pub fn from_description(desc: &SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => SignalMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SdpKind::Answer => SignalMessage::Answer {
                sdp: desc.sdp.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice { .. } => "ice",
            SignalMessage::Close { .. } => "close",
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Next message from the remote side, or `None` once the pipe is gone.
    async fn recv(&self) -> Option<SignalMessage>;
}

/// In-process signaling pipe; messages arrive in send order.
#[derive(Clone)]
pub struct LocalSignalingChannel {
    tx: mpsc::UnboundedSender<SignalMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<SignalMessage>>>,
}

impl LocalSignalingChannel {
    /// Create a pair of connected channels for one connection.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let left = Self {
            tx: tx2,
            rx: Arc::new(AsyncMutex::new(rx1)),
        };
        let right = Self {
            tx: tx1,
            rx: Arc::new(AsyncMutex::new(rx2)),
        };
        (left, right)
    }

    /// Non-blocking receive, for inspecting what a side has emitted.
    pub fn try_recv(&self) -> Option<SignalMessage> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingChannel {
    async fn emit(&self, message: SignalMessage) -> Result<(), SignalingError> {
        tracing::trace!(message = message.name(), "emitting signal");
        self.tx.send(message).map_err(|_| SignalingError::Closed)
    }

    async fn recv(&self) -> Option<SignalMessage> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
