//! Scripted in-process transport.
//!
//! [`MockTransport`] follows the offer/answer state machine closely enough
//! to drive [`crate::negotiation::PeerConnection`] without a network. Once
//! signaling settles with both descriptions in place ICE jumps straight to
//! `Connected` and locally created data channels report open.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{
    DataChannelHandle, IceCandidate, IceConnectionState, MediaStreamInfo, RtcTransport, SdpKind,
    SessionDescription, SignalingState, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Remote descriptions and candidates starting with this are refused.
pub const REJECTED_PREFIX: &str = "invalid";

#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn RtcTransport>, TransportEvents), TransportError> {
        let (transport, events) = MockTransport::new();
        self.created.lock().push(Arc::clone(&transport));
        let transport: Arc<dyn RtcTransport> = transport;
        Ok((transport, events))
    }
}

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    ice: IceConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    offers: usize,
    answers: usize,
    channels: Vec<Arc<MockDataChannel>>,
    closed: bool,
}

pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                local_description: None,
                remote_description: None,
                applied: Vec::new(),
                offers: 0,
                answers: 0,
                channels: Vec::new(),
                closed: false,
            }),
        });
        (transport, rx)
    }

    /// Candidates the transport accepted, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers
    }

    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.send(TransportEvent::IceConnectionChange(ice));
    }

    /// Push an arbitrary event onto the transport's stream.
    pub fn inject(&self, event: TransportEvent) {
        self.send(event);
    }

    /// Announce a remote data channel the way a real transport would when
    /// the other side opens one.
    pub fn announce_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = MockDataChannel::new(label);
        self.state.lock().channels.push(Arc::clone(&channel));
        self.send(TransportEvent::ChannelAdded(channel.clone()));
        channel
    }

    pub fn announce_stream(&self, stream_id: &str, track_id: &str) {
        self.send(TransportEvent::StreamAdded(MediaStreamInfo {
            stream_id: stream_id.to_string(),
            track_id: track_id.to_string(),
        }));
    }

    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, state: &mut MockState, signaling: SignalingState) {
        state.signaling = signaling;
        self.send(TransportEvent::SignalingChange(signaling));
        if signaling == SignalingState::Stable
            && state.remote_description.is_some()
            && state.local_description.is_some()
            && state.ice == IceConnectionState::New
        {
            state.ice = IceConnectionState::Connected;
            self.send(TransportEvent::IceConnectionChange(IceConnectionState::Connected));
            for channel in &state.channels {
                self.send(TransportEvent::ChannelOpened {
                    label: channel.label.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl RtcTransport for MockTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!("mock-offer-{}", state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Description(
                "no remote offer to answer".into(),
            ));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!("mock-answer-{}", state.answers)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(TransportError::Description(format!(
                    "cannot apply local {kind:?} in {current:?}"
                )));
            }
        };
        state.local_description = Some(desc);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if desc.sdp.starts_with(REJECTED_PREFIX) {
            return Err(TransportError::Description("unparseable sdp".into()));
        }
        let mut state = self.state.lock();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(TransportError::Description(format!(
                    "cannot apply remote {kind:?} in {current:?}"
                )));
            }
        };
        state.remote_description = Some(desc);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote_description.is_none() {
            return Err(TransportError::Candidate("no remote description".into()));
        }
        if candidate.candidate.starts_with(REJECTED_PREFIX) {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError> {
        let channel = MockDataChannel::new(label);
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.channels.push(Arc::clone(&channel));
        self.send(TransportEvent::NegotiationNeeded);
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        self.send(TransportEvent::Closed);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockDataChannel {
    label: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannelHandle for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::DataChannel(format!("{} is closed", self.label)));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_path_settles_and_connects() {
        let (transport, mut events) = MockTransport::new();
        transport
            .set_remote_description(SessionDescription::offer("remote"))
            .await
            .unwrap();
        let answer = transport.create_answer().await.unwrap();
        transport.set_local_description(answer).await.unwrap();

        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert_eq!(transport.ice_connection_state(), IceConnectionState::Connected);
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::SignalingChange(SignalingState::HaveRemoteOffer))
        ));
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let (transport, _events) = MockTransport::new();
        let err = transport
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Candidate(_)));
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn answering_without_an_offer_is_refused() {
        let (transport, _events) = MockTransport::new();
        assert!(transport.create_answer().await.is_err());
        assert!(
            transport
                .set_local_description(SessionDescription::answer("x"))
                .await
                .is_err()
        );
    }
}
