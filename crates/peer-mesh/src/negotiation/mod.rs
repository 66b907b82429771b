//! Per-connection negotiation engine.
//!
//! A [`PeerConnection`] drives one side of the offer/answer exchange over a
//! [`SignalingChannel`], buffers remote ICE candidates until the transport
//! can take them, debounces renegotiation and commits progress to the store
//! through the connection graph.

mod debounce;
mod ice;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

pub use debounce::Debounce;
pub use ice::IceQueue;

use crate::error::{MeshError, MeshResult};
use crate::graph::ConnectionGraph;
use crate::lifecycle::MeshContext;
use crate::model::{ConnectionFilter, ConnectionId, ConnectionState, PeerConnectionRecord, PeerId, Role};
use crate::signaling::{SignalMessage, SignalingChannel};
use crate::transport::{
    CombinedState, DataChannelHandle, IceCandidate, MediaStreamInfo, RtcTransport,
    SessionDescription, SignalingState, TransportEvent, TransportEvents, TransportFactory,
};

/// The two peers a connection joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInit {
    pub initiator: PeerId,
    pub endpoint: PeerId,
}

impl ConnectionInit {
    pub fn new(initiator: impl Into<PeerId>, endpoint: impl Into<PeerId>) -> Self {
        Self {
            initiator: initiator.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// What a [`PeerConnection`] reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    /// Entered stable signaling with connected ICE. Fires once per entry.
    Connected,
    Change {
        previous: CombinedState,
        current: CombinedState,
    },
    NewStream(MediaStreamInfo),
    NewDataChannel {
        label: String,
    },
    Message {
        label: String,
        payload: String,
    },
    Close {
        reason: Option<String>,
    },
}

enum Input {
    Transport(Option<TransportEvent>),
    Signal(Option<SignalMessage>),
    Renegotiate,
}

pub struct PeerConnection {
    ctx: MeshContext,
    graph: ConnectionGraph,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    role: Role,
    record: PeerConnectionRecord,
    transport: Option<Arc<dyn RtcTransport>>,
    transport_events: Option<TransportEvents>,
    ice_queue: IceQueue,
    renegotiation: Debounce,
    data_channels: Vec<Arc<dyn DataChannelHandle>>,
    streams: Vec<MediaStreamInfo>,
    last_state: CombinedState,
    signaling_open: bool,
    closed: bool,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>,
    span: tracing::Span,
}

impl PeerConnection {
    /// Reserve a new connection in the store and build the initiating side.
    pub async fn create_local(
        ctx: MeshContext,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        init: ConnectionInit,
    ) -> MeshResult<Self> {
        let record = ctx
            .store
            .reserve_connection(&init.initiator, &init.endpoint)
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    initiator = %init.initiator,
                    endpoint = %init.endpoint,
                    error = %err,
                    "connection reservation rejected"
                );
            })?;
        tracing::debug!(connection = %record.id, "reserved connection");
        Ok(Self::build(ctx, factory, signaling, Role::Initiator, record))
    }

    /// Build the receiving side of a connection the remote peer reserved.
    pub fn create_remote(
        ctx: MeshContext,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        id: ConnectionId,
        init: ConnectionInit,
    ) -> Self {
        let record = PeerConnectionRecord {
            id,
            initiator: init.initiator,
            endpoint: init.endpoint,
            state: ConnectionState::Reserved,
        };
        Self::build(ctx, factory, signaling, Role::Receiver, record)
    }

    fn build(
        ctx: MeshContext,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        role: Role,
        record: PeerConnectionRecord,
    ) -> Self {
        let span = tracing::info_span!(
            "peer_connection",
            connection = %record.id,
            role = ?role,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            graph: ctx.graph(),
            renegotiation: Debounce::new(ctx.config.renegotiation_delay),
            ctx,
            factory,
            signaling,
            role,
            record,
            transport: None,
            transport_events: None,
            ice_queue: IceQueue::default(),
            data_channels: Vec::new(),
            streams: Vec::new(),
            last_state: CombinedState::INITIAL,
            signaling_open: true,
            closed: false,
            events_tx,
            events_rx: Some(events_rx),
            span,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.record.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Last state this side committed or observed.
    pub fn state(&self) -> ConnectionState {
        self.record.state
    }

    pub fn record(&self) -> &PeerConnectionRecord {
        &self.record
    }

    pub fn combined_state(&self) -> CombinedState {
        self.last_state
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice_queue.len()
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation.is_armed()
    }

    pub fn data_channel_labels(&self) -> Vec<String> {
        self.data_channels.iter().map(|channel| channel.label()).collect()
    }

    pub fn streams(&self) -> &[MediaStreamInfo] {
        &self.streams
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hand out the event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
        self.events_rx.take()
    }

    /// Create the native transport. Calling it again is a no-op.
    pub async fn start_connection(&mut self) -> MeshResult<()> {
        let span = self.span.clone();
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> MeshResult<()> {
        if self.transport.is_some() || self.closed {
            return Ok(());
        }
        let (transport, events) = self.factory.create().await?;
        self.transport = Some(Arc::clone(&transport));
        self.transport_events = Some(events);
        tracing::debug!("transport created");

        if self.role == Role::Receiver {
            let label = self.ctx.config.heartbeat_label.clone();
            match transport.create_data_channel(&label).await {
                Ok(channel) => self.track_channel(channel),
                Err(err) => {
                    tracing::warn!(label = %label, error = %err, "failed to open heartbeat channel")
                }
            }
        }
        Ok(())
    }

    /// Tear the connection down: tell the remote side, release the
    /// transport and remove the record.
    pub async fn destroy(&mut self, reason: Option<String>) -> MeshResult<()> {
        let span = self.span.clone();
        self.destroy_inner(reason).instrument(span).await
    }

    async fn destroy_inner(&mut self, reason: Option<String>) -> MeshResult<()> {
        if let Err(err) = self
            .signaling
            .emit(SignalMessage::Close {
                reason: reason.clone(),
            })
            .await
        {
            tracing::debug!(error = %err, "close signal not delivered");
        }
        self.release_transport().await;
        self.graph
            .destroy_connections(&ConnectionFilter::by_id(self.record.id.clone()))
            .await
            .inspect_err(|err| tracing::warn!(error = %err, "failed to remove connection record"))?;
        tracing::info!(reason = reason.as_deref().unwrap_or(""), "connection destroyed");
        self.emit(PeerConnectionEvent::Close { reason });
        Ok(())
    }

    /// Start the transport, then process inputs until the connection ends.
    pub async fn run(&mut self) -> MeshResult<()> {
        self.start_connection().await?;
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err @ MeshError::NotStarted(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(connection = %self.record.id, error = %err, "negotiation step failed");
                }
            }
        }
    }

    /// Wait for the next transport event, signaling message or renegotiation
    /// deadline and handle it. Returns `false` once the connection is over.
    pub async fn step(&mut self) -> MeshResult<bool> {
        let span = self.span.clone();
        self.step_inner().instrument(span).await
    }

    async fn step_inner(&mut self) -> MeshResult<bool> {
        if self.closed {
            return Ok(false);
        }
        let signaling = Arc::clone(&self.signaling);
        let signaling_open = self.signaling_open;
        let deadline = self.renegotiation.deadline();
        let Some(events) = self.transport_events.as_mut() else {
            return Err(MeshError::NotStarted(self.record.id.clone()));
        };

        let input = tokio::select! {
            biased;
            event = events.recv() => Input::Transport(event),
            message = signaling.recv(), if signaling_open => Input::Signal(message),
            () = debounce::elapsed(deadline) => Input::Renegotiate,
        };

        match input {
            Input::Transport(Some(event)) => self.handle_transport_event(event).await,
            Input::Transport(None) => {
                self.shutdown(None).await;
                Ok(false)
            }
            Input::Signal(Some(message)) => self.handle_signal(message).await,
            Input::Signal(None) => {
                tracing::debug!("signaling channel ended");
                self.signaling_open = false;
                Ok(true)
            }
            Input::Renegotiate => {
                self.on_renegotiation_due().await?;
                Ok(true)
            }
        }
    }

    /// Apply one message from the remote side. Returns `false` when the
    /// remote side closed the connection.
    pub async fn handle_signal(&mut self, message: SignalMessage) -> MeshResult<bool> {
        tracing::trace!(message = message.name(), "signal received");
        match message {
            SignalMessage::Offer { sdp } => self.handle_offer(sdp).await?,
            SignalMessage::Answer { sdp } => self.handle_answer(sdp).await?,
            SignalMessage::Ice { candidate } => self.on_got_ice(candidate).await,
            SignalMessage::Close { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or(""), "remote side closed");
                self.shutdown(reason).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply a remote candidate now if the transport can take it, otherwise
    /// queue it for the next drain. Older queued candidates always go first.
    pub async fn on_got_ice(&mut self, candidate: IceCandidate) {
        if !self.accepts_candidates().await {
            tracing::trace!(queued = self.ice_queue.len() + 1, "queueing remote candidate");
            self.ice_queue.push(candidate);
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if !self.ice_queue.is_empty() {
            self.ice_queue.push(candidate);
            self.drain_candidates(&transport).await;
            return;
        }
        if let Err(err) = transport.add_ice_candidate(candidate).await {
            tracing::warn!(error = %err, "failed to add remote candidate");
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> MeshResult<bool> {
        tracing::trace!(?event, "transport event");
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if let Err(err) = self.signaling.emit(SignalMessage::Ice { candidate }).await {
                    tracing::warn!(error = %err, "local candidate not delivered");
                }
            }
            TransportEvent::SignalingChange(_) | TransportEvent::IceConnectionChange(_) => {
                self.refresh_state().await;
            }
            TransportEvent::NegotiationNeeded => {
                self.renegotiation.arm();
                tracing::debug!("renegotiation scheduled");
            }
            TransportEvent::StreamAdded(stream) => {
                tracing::debug!(stream = %stream.stream_id, "remote stream added");
                self.streams.push(stream.clone());
                self.emit(PeerConnectionEvent::NewStream(stream));
            }
            TransportEvent::ChannelAdded(channel) => self.track_channel(channel),
            TransportEvent::ChannelOpened { label } => self.greet(&label).await,
            TransportEvent::ChannelMessage { label, payload } => {
                self.emit(PeerConnectionEvent::Message { label, payload });
            }
            TransportEvent::ChannelError { label, error } => {
                tracing::warn!(label = %label, error = %error, "data channel error");
            }
            TransportEvent::Closed => {
                self.shutdown(None).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_offer(&mut self, sdp: String) -> MeshResult<()> {
        let transport = self.require_transport()?;
        if let Err(err) = transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            tracing::warn!(error = %err, "remote offer rejected");
            return Ok(());
        }
        if let Err(err) = self.answer(&transport).await {
            tracing::warn!(error = %err, "failed to answer remote offer");
        }
        self.refresh_state().await;
        self.drain_candidates(&transport).await;
        self.finalize().await
    }

    async fn answer(&self, transport: &Arc<dyn RtcTransport>) -> MeshResult<()> {
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.signaling
            .emit(SignalMessage::from_description(&answer))
            .await?;
        tracing::debug!("answer sent");
        Ok(())
    }

    async fn handle_answer(&mut self, sdp: String) -> MeshResult<()> {
        let transport = self.require_transport()?;
        if let Err(err) = transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            tracing::warn!(error = %err, "remote answer rejected");
            return Ok(());
        }
        self.refresh_state().await;
        self.drain_candidates(&transport).await;
        self.finalize().await
    }

    async fn on_renegotiation_due(&mut self) -> MeshResult<()> {
        self.renegotiation.cancel();
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        if transport.signaling_state() != SignalingState::Stable {
            tracing::debug!(
                signaling = ?transport.signaling_state(),
                "signaling not stable, deferring offer"
            );
            self.renegotiation.arm();
            return Ok(());
        }
        if let Err(err) = self.offer(&transport).await {
            tracing::warn!(error = %err, "failed to send offer");
            return Ok(());
        }
        if self.record.state == ConnectionState::Reserved {
            if let Err(err) = self.mark_connecting().await {
                tracing::warn!(error = %err, "failed to mark connection connecting");
            }
        }
        Ok(())
    }

    async fn offer(&self, transport: &Arc<dyn RtcTransport>) -> MeshResult<()> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.signaling
            .emit(SignalMessage::from_description(&offer))
            .await?;
        tracing::debug!("offer sent");
        Ok(())
    }

    /// Move a still-reserved record to `connecting`. If the other side got
    /// further first, adopt the stored record instead.
    async fn mark_connecting(&mut self) -> MeshResult<()> {
        let previous = self.record.clone();
        let applied = self
            .ctx
            .store
            .transition_connection(
                &self.record.id,
                ConnectionState::Reserved,
                ConnectionState::Connecting,
            )
            .await?;
        match applied {
            Some(current) => {
                self.record = current.clone();
                self.ctx.connection_updated(previous, current).await
            }
            None => self.reload_record().await,
        }
    }

    async fn reload_record(&mut self) -> MeshResult<()> {
        let id = self.record.id.clone();
        let current = self
            .ctx
            .store
            .find_connections(&ConnectionFilter::by_id(id.clone()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::connection_not_found(&id))?;
        tracing::debug!(state = ?current.state, "record already advanced");
        self.record = current;
        Ok(())
    }

    /// Commit this side's half of a completed exchange.
    async fn finalize(&mut self) -> MeshResult<()> {
        let previous = self.record.clone();
        let current = self
            .ctx
            .store
            .finalize_connection(&self.record.id, self.role)
            .await
            .inspect_err(|err| tracing::warn!(error = %err, "failed to finalize connection"))?;
        tracing::info!(
            from = ?previous.state,
            to = ?current.state,
            "connection finalized"
        );
        self.record = current.clone();
        self.ctx.connection_updated(previous, current).await
    }

    async fn refresh_state(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let current = CombinedState {
            signaling: transport.signaling_state(),
            ice: transport.ice_connection_state(),
        };
        if current == self.last_state {
            return;
        }
        let previous = std::mem::replace(&mut self.last_state, current);
        tracing::debug!(%previous, %current, "connection state changed");
        self.emit(PeerConnectionEvent::Change { previous, current });
        if current.is_connected() && !previous.is_connected() {
            tracing::info!("peer connection connected");
            self.emit(PeerConnectionEvent::Connected);
        }
        self.drain_candidates(&transport).await;
    }

    /// One pass over the queue, in arrival order. Candidates that fail are
    /// dropped.
    async fn drain_candidates(&mut self, transport: &Arc<dyn RtcTransport>) {
        if self.ice_queue.is_empty() || !self.accepts_candidates().await {
            return;
        }
        let pending = self.ice_queue.take_all();
        tracing::debug!(count = pending.len(), "draining queued candidates");
        for candidate in pending {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %err, "dropping queued candidate");
            }
        }
    }

    async fn accepts_candidates(&self) -> bool {
        match &self.transport {
            Some(transport) => {
                transport.signaling_state() == SignalingState::Stable
                    && transport.has_remote_description().await
            }
            None => false,
        }
    }

    fn track_channel(&mut self, channel: Arc<dyn DataChannelHandle>) {
        let label = channel.label();
        tracing::debug!(label = %label, "data channel added");
        self.data_channels.push(channel);
        self.emit(PeerConnectionEvent::NewDataChannel { label });
    }

    async fn greet(&self, label: &str) {
        let Some(channel) = self
            .data_channels
            .iter()
            .rev()
            .find(|channel| channel.label() == label)
        else {
            tracing::debug!(label = %label, "open event for unknown data channel");
            return;
        };
        if let Err(err) = channel.send_text(&self.ctx.config.greeting).await {
            tracing::warn!(label = %label, error = %err, "failed to greet data channel");
        }
    }

    /// End the connection locally without touching the store.
    async fn shutdown(&mut self, reason: Option<String>) {
        if self.closed {
            return;
        }
        self.release_transport().await;
        self.emit(PeerConnectionEvent::Close { reason });
    }

    async fn release_transport(&mut self) {
        self.closed = true;
        self.renegotiation.cancel();
        self.transport_events = None;
        for channel in self.data_channels.drain(..) {
            channel.close().await;
        }
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                tracing::debug!(error = %err, "transport close failed");
            }
        }
    }

    fn require_transport(&self) -> MeshResult<Arc<dyn RtcTransport>> {
        self.transport
            .clone()
            .ok_or_else(|| MeshError::NotStarted(self.record.id.clone()))
    }

    fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events_tx.send(event);
    }
}
