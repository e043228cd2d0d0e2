//! Session protocol handler
//!
//! One [`SessionHandler`] per connection drives the request/response state
//! machine against the shared [`RoomRegistry`] and media engine:
//!
//! ```text
//! Unjoined -> Joining -> Joined -> Closed
//!     ^                    |
//!     +------ leave -------+
//! ```
//!
//! Requests of one connection are dispatched in arrival order but may complete
//! out of order, so every handler re-checks its preconditions after each
//! engine call. A resource the engine hands back after its owning session is
//! gone is closed on the spot.

use crate::admission::Admission;
use crate::admission::AdmissionPolicy;
use crate::engine::{
    DtlsParameters, DtlsState, EngineResource, RtpCapabilities, RtpParameters,
};
use crate::error::{Error, Result};
use crate::hub::{MessageSender, RoomMessageHub};
use crate::peer::PeerSession;
use crate::protocol::{
    ClientEnvelope, ClientRequest, InvalidFrame, ProducerInfo, ResponseData, ServerMessage,
};
use crate::registry::RoomRegistry;
use crate::resource::{ConsumerHandle, ProducerHandle, ResourceHandle, TransportHandle};
use crate::room::SfuRoom;
use crate::types::{Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId, UserId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport-agnostic duplex channel of one connection
#[async_trait]
pub trait MessageStream: Send {
    /// Next validated client frame. `None` once the connection is closed.
    async fn recv(&mut self) -> Option<std::result::Result<ClientEnvelope, InvalidFrame>>;

    /// Deliver one server frame
    async fn send(&mut self, message: ServerMessage) -> std::result::Result<(), String>;
}

/// Lifecycle of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unjoined,
    /// Admitted, room creation or attachment pending
    Joining(RoomId),
    Joined(RoomId),
    Closed,
}

/// Shared dependencies of every connection
#[derive(Clone)]
pub struct SignalingService {
    registry: Arc<RoomRegistry>,
    hub: RoomMessageHub,
    admission: Arc<dyn AdmissionPolicy>,
}

impl SignalingService {
    pub fn new(registry: Arc<RoomRegistry>, admission: Arc<dyn AdmissionPolicy>) -> Self {
        Self {
            registry,
            hub: RoomMessageHub::new(),
            admission,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn hub(&self) -> &RoomMessageHub {
        &self.hub
    }

    /// Open a session for a new connection.
    ///
    /// The receiver yields every frame addressed to this connection:
    /// responses and room broadcasts.
    pub fn connect(&self) -> (SessionHandler, mpsc::UnboundedReceiver<ServerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = SessionHandler {
            service: self.clone(),
            peer_id: PeerId::generate(),
            state: Mutex::new(ConnectionState::Unjoined),
            sender,
        };
        debug!(peer_id = %handler.peer_id, "Connection opened");
        (handler, receiver)
    }

    /// Run a connection to completion
    pub async fn serve<S: MessageStream>(&self, mut stream: S) {
        let (handler, outbound) = self.connect();
        handler.run(&mut stream, outbound).await;
    }
}

/// Per-connection protocol state machine
pub struct SessionHandler {
    service: SignalingService,
    peer_id: PeerId,
    state: Mutex<ConnectionState>,
    sender: MessageSender,
}

impl SessionHandler {
    /// Connection identity, used as the peer id in rooms
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Main loop: dispatch inbound frames, forward outbound frames, clean up on close
    pub async fn run<S: MessageStream>(
        &self,
        stream: &mut S,
        mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let mut in_flight: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();

        loop {
            tokio::select! {
                frame = stream.recv() => {
                    match frame {
                        Some(Ok(envelope)) => in_flight.push(self.dispatch(envelope)),
                        Some(Err(invalid)) => {
                            warn!(peer_id = %self.peer_id, reason = %invalid.reason, "Rejected malformed frame");
                            self.send(ServerMessage::error(
                                invalid.request_id,
                                &Error::InvalidMessage(invalid.reason),
                            ));
                        }
                        None => {
                            info!(peer_id = %self.peer_id, "Client disconnected");
                            break;
                        }
                    }
                }

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = stream.send(message).await {
                        warn!(peer_id = %self.peer_id, error = %e, "Failed to send message, closing connection");
                        break;
                    }
                }
            }
        }

        self.disconnect();

        // Pending requests now observe the closed session and release whatever they created
        while in_flight.next().await.is_some() {}
    }

    fn dispatch(&self, envelope: ClientEnvelope) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(response) = self.handle(envelope).await {
                self.send(response);
            }
        })
    }

    /// Handle one request. Returns the response frame, if one is due.
    pub async fn handle(&self, envelope: ClientEnvelope) -> Option<ServerMessage> {
        let ClientEnvelope {
            request_id,
            request,
        } = envelope;
        let name = request.name();
        // connectTransport without a request id is fire-and-forget
        let reply = request_id.is_some() || !matches!(request, ClientRequest::ConnectTransport { .. });

        let result = match request {
            ClientRequest::Join { room_id, user_id } => self.join(room_id, user_id).await,
            ClientRequest::CreateTransport { room_id, direction } => {
                self.create_transport(room_id, direction).await
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
                room_id,
            } => {
                self.connect_transport(room_id, transport_id, dtls_parameters)
                    .await
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                room_id,
            } => self.produce(room_id, transport_id, kind, rtp_parameters).await,
            ClientRequest::Consume {
                room_id,
                producer_id,
                rtp_capabilities,
            } => self.consume(room_id, producer_id, rtp_capabilities).await,
            ClientRequest::Leave { room_id } => self.leave(room_id.as_ref()),
        };

        if let Err(e) = &result {
            warn!(
                peer_id = %self.peer_id,
                request = name,
                code = e.code(),
                error = %e,
                "Request failed"
            );
        }

        reply.then(|| ServerMessage::from_result(request_id, &result))
    }

    /// Admit, create or get the room, attach an empty session and subscribe to broadcasts
    pub async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<ResponseData> {
        {
            let mut state = self.state.lock();
            match &*state {
                ConnectionState::Unjoined => {}
                ConnectionState::Joining(current) | ConnectionState::Joined(current) => {
                    return Err(Error::AlreadyJoined(current.clone()));
                }
                ConnectionState::Closed => return Err(Error::PeerNotFound(self.peer_id.clone())),
            }
            // Admission runs before the registry is touched
            if let Admission::Deny(reason) = self.service.admission.admit(&room_id, &user_id) {
                return Err(Error::AdmissionDenied(reason));
            }
            *state = ConnectionState::Joining(room_id.clone());
        }

        let session = PeerSession::new(self.peer_id.clone(), user_id.clone(), room_id.clone());
        let room = match self.service.registry.join(session).await {
            Ok(room) => room,
            Err(e) => {
                let mut state = self.state.lock();
                if *state == ConnectionState::Joining(room_id) {
                    *state = ConnectionState::Unjoined;
                }
                return Err(e);
            }
        };

        let attached = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Joining(room_id.clone()) {
                *state = ConnectionState::Joined(room_id.clone());
                self.service
                    .hub
                    .subscribe(room_id.clone(), self.peer_id.clone(), self.sender.clone());
                true
            } else {
                false
            }
        };
        if !attached {
            // The connection closed while the join was pending
            self.release_room(&room);
            return Err(Error::PeerNotFound(self.peer_id.clone()));
        }

        let producers = room
            .producers_except(&self.peer_id)
            .into_iter()
            .map(|(producer_id, peer_id)| ProducerInfo {
                producer_id,
                peer_id,
            })
            .collect::<Vec<_>>();

        info!(
            room_id = %room_id,
            peer_id = %self.peer_id,
            user_id = %user_id,
            existing_producers = producers.len(),
            "Peer joined room"
        );

        Ok(ResponseData::Joined {
            rtp_capabilities: room.router().rtp_capabilities(),
            producers,
        })
    }

    pub async fn create_transport(&self, room_id: RoomId, direction: Direction) -> Result<ResponseData> {
        self.require_joined()?;
        let room = self.room(&room_id)?;

        let has_open = room
            .with_peer(&self.peer_id, |peer| peer.open_transport(direction).is_some())
            .ok_or_else(|| Error::PeerNotFound(self.peer_id.clone()))?;
        if has_open {
            return Err(Error::TransportExists(direction));
        }

        let options = self.service.registry.config().transport.clone();
        let transport = room.router().create_webrtc_transport(options).await?;
        let handle = Arc::new(TransportHandle::from_transport(transport, direction));

        // Re-check: the session may have gone, or a concurrent request won the slot
        let attached = room.with_peer_mut(&self.peer_id, |peer| {
            if peer.open_transport(direction).is_some() {
                return false;
            }
            peer.add_transport(Arc::clone(&handle));
            true
        });
        match attached {
            Some(true) => {}
            Some(false) => {
                self.discard(&handle, "transport");
                return Err(Error::TransportExists(direction));
            }
            None => {
                self.discard(&handle, "transport");
                return Err(Error::PeerNotFound(self.peer_id.clone()));
            }
        }

        self.watch_dtls(&handle);

        let transport = handle.resource();
        debug!(
            room_id = %room_id,
            peer_id = %self.peer_id,
            transport_id = %transport.id(),
            direction = %direction,
            "Transport created"
        );

        Ok(ResponseData::TransportCreated {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })
    }

    /// Complete the DTLS handshake of a transport this connection owns
    pub async fn connect_transport(
        &self,
        room_id: RoomId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<ResponseData> {
        self.require_joined()?;
        let room = self.room(&room_id)?;
        let handle = self.own_transport(&room, &transport_id)?;

        handle.resource().connect(dtls_parameters).await?;

        debug!(
            room_id = %room_id,
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(ResponseData::Ack {})
    }

    /// Create a producer and announce it to every other peer of the room
    pub async fn produce(
        &self,
        room_id: RoomId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ResponseData> {
        self.require_joined()?;
        let room = self.room(&room_id)?;
        let transport = self.own_transport(&room, &transport_id)?;

        let producer = transport.resource().produce(kind, rtp_parameters).await?;
        let handle = Arc::new(ProducerHandle::from_producer(producer, transport_id));

        if room
            .with_peer_mut(&self.peer_id, |peer| peer.add_producer(Arc::clone(&handle)))
            .is_none()
        {
            self.discard(&handle, "producer");
            return Err(Error::PeerNotFound(self.peer_id.clone()));
        }

        let producer_id = handle.producer_id();
        let notified = self.service.hub.broadcast_except(
            &room.id,
            &self.peer_id,
            ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                peer_id: self.peer_id.clone(),
            },
        );

        info!(
            room_id = %room_id,
            peer_id = %self.peer_id,
            producer_id = %producer_id,
            kind = %kind,
            notified,
            "Producer created"
        );
        Ok(ResponseData::Produced { id: producer_id })
    }

    /// Consume another peer's producer on this connection's recv transport
    pub async fn consume(
        &self,
        room_id: RoomId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ResponseData> {
        self.require_joined()?;
        let room = self.room(&room_id)?;
        if !room.contains_peer(&self.peer_id) {
            return Err(Error::PeerNotFound(self.peer_id.clone()));
        }

        match room.producer_owner(&producer_id) {
            None => return Err(Error::CannotConsume),
            Some(owner) if owner == self.peer_id => return Err(Error::SelfConsumption),
            Some(_) => {}
        }
        if !room.router().can_consume(&producer_id, &rtp_capabilities) {
            return Err(Error::CannotConsume);
        }

        let transport = room
            .with_peer(&self.peer_id, |peer| peer.open_transport(Direction::Recv))
            .ok_or_else(|| Error::PeerNotFound(self.peer_id.clone()))?
            .ok_or(Error::NoRecvTransport)?;

        let consumer = transport
            .resource()
            .consume(producer_id.clone(), rtp_capabilities, false)
            .await?;
        let handle = Arc::new(ConsumerHandle::from_consumer(consumer));

        // Consumers are handed out flowing
        if handle.resource().is_paused() {
            if let Err(e) = handle.resource().resume().await {
                self.discard(&handle, "consumer");
                return Err(e.into());
            }
        }

        if room
            .with_peer_mut(&self.peer_id, |peer| peer.add_consumer(Arc::clone(&handle)))
            .is_none()
        {
            self.discard(&handle, "consumer");
            return Err(Error::PeerNotFound(self.peer_id.clone()));
        }

        let consumer = handle.resource();
        debug!(
            room_id = %room_id,
            peer_id = %self.peer_id,
            consumer_id = %consumer.id(),
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(ResponseData::Consumed {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Leave the joined room. Same teardown as a disconnect, but the connection stays usable.
    pub fn leave(&self, room_id: Option<&RoomId>) -> Result<ResponseData> {
        {
            let mut state = self.state.lock();
            match &*state {
                ConnectionState::Joined(current) if room_id.map_or(true, |id| id == current) => {
                    *state = ConnectionState::Unjoined;
                }
                _ => return Err(Error::NotJoined),
            }
        }

        self.service.hub.unsubscribe(&self.peer_id);
        self.release_sessions();
        Ok(ResponseData::Ack {})
    }

    /// Tear down everything this connection owns. Safe to call more than once.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        self.service.hub.unsubscribe(&self.peer_id);
        let rooms = self.release_sessions();

        info!(
            peer_id = %self.peer_id,
            rooms,
            "Connection closed"
        );
    }

    /// Detach this connection from every room that holds a session for it
    fn release_sessions(&self) -> usize {
        let rooms = self.service.registry.rooms_with_peer(&self.peer_id);
        for room in &rooms {
            self.release_room(room);
        }
        rooms.len()
    }

    fn release_room(&self, room: &SfuRoom) {
        let Some(session) = room.remove_peer(&self.peer_id) else {
            return;
        };

        let producers = session.open_producer_ids();
        let report = session.close_all();

        for producer_id in producers {
            self.service.hub.broadcast_except(
                &room.id,
                &self.peer_id,
                ServerMessage::ProducerClosed {
                    producer_id,
                    peer_id: self.peer_id.clone(),
                },
            );
        }
        self.service.hub.broadcast_except(
            &room.id,
            &self.peer_id,
            ServerMessage::PeerLeft {
                peer_id: self.peer_id.clone(),
            },
        );

        let room_deleted = self.service.registry.remove_if_empty(&room.id);

        info!(
            room_id = %room.id,
            peer_id = %self.peer_id,
            consumers = report.consumers,
            producers = report.producers,
            transports = report.transports,
            failures = report.failures,
            room_deleted,
            "Peer left room"
        );
    }

    /// Close the transport once its DTLS handshake reports closed
    fn watch_dtls(&self, handle: &Arc<TransportHandle>) {
        let handle = Arc::clone(handle);
        let peer_id = self.peer_id.clone();
        let mut dtls_state = handle.resource().dtls_state();

        tokio::spawn(async move {
            loop {
                if *dtls_state.borrow_and_update() == DtlsState::Closed {
                    match handle.close() {
                        Ok(outcome) => debug!(
                            peer_id = %peer_id,
                            transport_id = handle.id(),
                            ?outcome,
                            "Transport closed after DTLS close"
                        ),
                        Err(e) => warn!(
                            peer_id = %peer_id,
                            transport_id = handle.id(),
                            error = %e,
                            "Failed to close transport after DTLS close"
                        ),
                    }
                    break;
                }
                if dtls_state.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// A connection that never joined, or already closed, has no session to act on
    fn require_joined(&self) -> Result<RoomId> {
        match &*self.state.lock() {
            ConnectionState::Joined(room_id) => Ok(room_id.clone()),
            _ => Err(Error::PeerNotFound(self.peer_id.clone())),
        }
    }

    fn room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.service
            .registry
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))
    }

    /// Transport owned by this connection's own session. Never looks at other peers.
    fn own_transport(&self, room: &SfuRoom, transport_id: &TransportId) -> Result<Arc<TransportHandle>> {
        room.with_peer(&self.peer_id, |peer| peer.transport(transport_id))
            .ok_or_else(|| Error::PeerNotFound(self.peer_id.clone()))?
            .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))
    }

    /// Close a resource whose owning session can no longer take it
    fn discard<R, Tag>(&self, handle: &ResourceHandle<R, Tag>, what: &'static str)
    where
        R: EngineResource + ?Sized,
    {
        match handle.close() {
            Ok(_) => debug!(peer_id = %self.peer_id, resource = what, id = handle.id(), "Discarded orphaned resource"),
            Err(e) => warn!(
                peer_id = %self.peer_id,
                resource = what,
                id = handle.id(),
                error = %e,
                "Failed to discard orphaned resource"
            ),
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.sender.send(message).is_err() {
            debug!(peer_id = %self.peer_id, "Outbound queue closed, dropping message");
        }
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.disconnect();
    }
}
