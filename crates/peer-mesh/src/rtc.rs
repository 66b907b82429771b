//! [`RtcTransport`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::transport::{
    DataChannelHandle, IceCandidate, IceConnectionState, MediaStreamInfo, RtcTransport, SdpKind,
    SessionDescription, SignalingState, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Creates one `RTCPeerConnection` per call using the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn RtcTransport>, TransportEvents), TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(setup_error)?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        wire_peer_connection(&peer, &tx);
        tracing::debug!(servers = self.ice_servers.len(), "webrtc transport created");

        let transport: Arc<dyn RtcTransport> = Arc::new(WebRtcTransport { peer, events: tx });
        Ok((transport, rx))
    }
}

fn setup_error(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn wire_peer_connection(peer: &Arc<RTCPeerConnection>, events: &EventSender) {
    let tx = events.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode local candidate"),
            }
        })
    }));

    let tx = events.clone();
    peer.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let _ = tx.send(TransportEvent::SignalingChange(map_signaling(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = tx.send(TransportEvent::IceConnectionChange(map_ice(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if state == RTCPeerConnectionState::Closed {
            let _ = tx.send(TransportEvent::Closed);
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    peer.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            wire_data_channel(&channel, &tx);
            let _ = tx.send(TransportEvent::ChannelAdded(Arc::new(WebRtcDataChannel {
                channel,
            })));
        })
    }));

    let tx = events.clone();
    peer.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = tx.send(TransportEvent::StreamAdded(MediaStreamInfo {
                stream_id: track.stream_id(),
                track_id: track.id(),
            }));
            Box::pin(async {})
        },
    ));
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: &EventSender) {
    let label = channel.label().to_string();

    let (tx, open_label) = (events.clone(), label.clone());
    channel.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelOpened { label: open_label });
        Box::pin(async {})
    }));

    let (tx, message_label) = (events.clone(), label.clone());
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        // Binary payloads are not part of the channel protocol.
        if message.is_string {
            let _ = tx.send(TransportEvent::ChannelMessage {
                label: message_label.clone(),
                payload: String::from_utf8_lossy(&message.data).into_owned(),
            });
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        let _ = tx.send(TransportEvent::ChannelError {
            label: label.clone(),
            error: err.to_string(),
        });
        Box::pin(async {})
    }));
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_ice(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|err| TransportError::Description(err.to_string()))
}

fn from_native(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Description(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn description_error(err: webrtc::Error) -> TransportError {
    TransportError::Description(err.to_string())
}

pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    events: EventSender,
}

#[async_trait]
impl RtcTransport for WebRtcTransport {
    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.peer.signaling_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice(self.peer.ice_connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(description_error)?;
        from_native(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(description_error)?;
        from_native(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.peer
            .set_local_description(to_native(desc)?)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer
            .set_remote_description(to_native(desc)?)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError> {
        let channel = self
            .peer
            .create_data_channel(label, None)
            .await
            .map_err(|err| TransportError::DataChannel(err.to_string()))?;
        wire_data_channel(&channel, &self.events);
        Ok(Arc::new(WebRtcDataChannel { channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer
            .close()
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))
    }
}

struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::DataChannel(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            tracing::debug!(label = %self.channel.label(), error = %err, "data channel close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn pranswer_states_collapse_onto_offer_states() {
        assert_eq!(
            map_signaling(RTCSignalingState::HaveLocalPranswer),
            SignalingState::HaveRemoteOffer
        );
        assert_eq!(
            map_signaling(RTCSignalingState::HaveRemotePranswer),
            SignalingState::HaveLocalOffer
        );
        assert_eq!(map_signaling(RTCSignalingState::Unspecified), SignalingState::Stable);
        assert_eq!(map_ice(RTCIceConnectionState::Unspecified), IceConnectionState::New);
    }

    #[test_timeout::timeout]
    fn empty_server_list_yields_no_ice_servers() {
        let factory = WebRtcTransportFactory::new(&MeshConfig::localhost());
        assert!(factory.rtc_configuration().ice_servers.is_empty());
        let factory = WebRtcTransportFactory::new(&MeshConfig::default());
        assert_eq!(factory.rtc_configuration().ice_servers.len(), 1);
    }
}
