//! Native transport abstraction.
//!
//! A [`TransportFactory`] yields one [`RtcTransport`] per peer connection
//! together with the stream of [`TransportEvent`]s it raises. The WebRTC
//! backed implementation lives in [`crate::rtc`]; [`crate::mock`] provides a
//! scripted one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("transport closed")]
    Closed,
}

/// Offer/answer progress of the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }

    /// States a consumer should treat as the end of the connection.
    pub fn is_fatal(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Closed)
    }
}

/// Signaling and ICE state observed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombinedState {
    pub signaling: SignalingState,
    pub ice: IceConnectionState,
}

impl CombinedState {
    pub const INITIAL: CombinedState = CombinedState {
        signaling: SignalingState::Stable,
        ice: IceConnectionState::New,
    };

    pub fn is_connected(&self) -> bool {
        self.signaling == SignalingState::Stable && self.ice.is_connected()
    }
}

impl fmt::Display for CombinedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.signaling, self.ice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// A media stream announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamInfo {
    pub stream_id: String,
    pub track_id: String,
}

#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Everything the native handle reports, dispatched through one handler.
#[derive(Clone)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the remote side.
    IceCandidate(IceCandidate),
    SignalingChange(SignalingState),
    IceConnectionChange(IceConnectionState),
    NegotiationNeeded,
    StreamAdded(MediaStreamInfo),
    ChannelAdded(Arc<dyn DataChannelHandle>),
    ChannelOpened { label: String },
    ChannelMessage { label: String, payload: String },
    ChannelError { label: String, error: String },
    Closed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            TransportEvent::SignalingChange(state) => {
                f.debug_tuple("SignalingChange").field(state).finish()
            }
            TransportEvent::IceConnectionChange(state) => {
                f.debug_tuple("IceConnectionChange").field(state).finish()
            }
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::StreamAdded(stream) => {
                f.debug_tuple("StreamAdded").field(stream).finish()
            }
            TransportEvent::ChannelAdded(channel) => {
                f.debug_tuple("ChannelAdded").field(&channel.label()).finish()
            }
            TransportEvent::ChannelOpened { label } => {
                f.debug_struct("ChannelOpened").field("label", label).finish()
            }
            TransportEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("bytes", &payload.len())
                .finish(),
            TransportEvent::ChannelError { label, error } => f
                .debug_struct("ChannelError")
                .field("label", label)
                .field("error", error)
                .finish(),
            TransportEvent::Closed => f.write_str("Closed"),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait RtcTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn ice_connection_state(&self) -> IceConnectionState;
    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Open a data channel from this side. Its open/message/error events
    /// arrive on the transport's event stream.
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn RtcTransport>, TransportEvents), TransportError>;
}
