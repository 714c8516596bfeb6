//! The mesh actor.
//!
//! One task owns every piece of mutable mesh state and processes radio
//! events, application commands and timer ticks strictly one at a time, so
//! none of the components below need their own locking.

use crate::config::CoordinatorConfig;
use crate::event::{
    AppCommand, MeshError, MeshEvent, MeshStats, PeerInfo, RadioEvent, Recipient, SendError,
};
use crate::handle::MeshHandle;
use crate::handler::{MeshEventHandler, ReceivedMessage};
use crate::radio::RadioTransport;
use bytes::Bytes;
use mesh_identity::{Fingerprint, IdentityRegistry, NodeIdentity, TrustPolicy, STATIC_KEY_SIZE};
use mesh_routing::{RelayRouter, RoutingDecision};
use mesh_session::{
    HandshakeStep, NoiseSessionManager, SessionError, SessionState, TransitionReason,
};
use mesh_storage::{PendingDelivery, PendingStore, PolicyError, StoreForwardQueue};
use mesh_wire::{
    now_millis, AnnouncePayload, MessageId, Packet, PacketType, PeerId, PrivateKind,
    PrivatePayload,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Largest application body accepted for sending
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

// private message IDs remembered for duplicate suppression
const RECENT_PRIVATE_CAPACITY: usize = 1024;

/// Follows tokio's clock so paused-time tests drive every timeout
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// A private message waiting for a handshake, or sent and waiting for its
/// acknowledgment
struct OutboxEntry {
    recipient: Fingerprint,
    message_id: MessageId,
    plaintext: Bytes,
    // when it entered its current stage
    queued_at: Instant,
    // set when the message came out of store-and-forward
    pending: Option<PendingDelivery>,
}

/// Single owner of sessions, routing, identities and pending deliveries
pub struct MeshCoordinator {
    config: CoordinatorConfig,
    local_peer: PeerId,
    fingerprint: Fingerprint,
    static_key: [u8; STATIC_KEY_SIZE],
    radio: Arc<dyn RadioTransport>,
    handler: Arc<dyn MeshEventHandler>,
    trust: Arc<dyn TrustPolicy>,
    sessions: NoiseSessionManager,
    router: RelayRouter,
    registry: IdentityRegistry,
    queue: StoreForwardQueue,
    neighbors: HashSet<PeerId>,
    announced: HashMap<PeerId, Instant>,
    outbox: HashMap<PeerId, VecDeque<OutboxEntry>>,
    unacked: HashMap<PeerId, VecDeque<OutboxEntry>>,
    recent_private: HashSet<(PeerId, MessageId)>,
    recent_order: VecDeque<(PeerId, MessageId)>,
    last_announce: Option<Instant>,
    event_rx: mpsc::Receiver<MeshEvent>,
}

impl MeshCoordinator {
    /// Build a coordinator and the handle used to drive it.
    ///
    /// Store-and-forward entries persisted by `store` are reloaded here.
    pub async fn new(
        config: CoordinatorConfig,
        identity: NodeIdentity,
        radio: Arc<dyn RadioTransport>,
        handler: Arc<dyn MeshEventHandler>,
        trust: Arc<dyn TrustPolicy>,
        store: Arc<dyn PendingStore>,
    ) -> Result<(Self, MeshHandle), MeshError> {
        let local_peer = config.peer_id.unwrap_or_else(PeerId::random);
        let fingerprint = identity.fingerprint();
        let static_key = identity.public_key();

        let queue = StoreForwardQueue::open(config.queue.clone(), store, Arc::clone(&trust)).await?;
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_size.max(1));
        let handle = MeshHandle::new(event_tx, local_peer, fingerprint);

        let coordinator = Self {
            sessions: NoiseSessionManager::new(local_peer, identity, config.session.clone()),
            router: RelayRouter::new(local_peer, config.router.clone()),
            registry: IdentityRegistry::new(),
            queue,
            config,
            local_peer,
            fingerprint,
            static_key,
            radio,
            handler,
            trust,
            neighbors: HashSet::new(),
            announced: HashMap::new(),
            outbox: HashMap::new(),
            unacked: HashMap::new(),
            recent_private: HashSet::new(),
            recent_order: VecDeque::new(),
            last_announce: None,
            event_rx,
        };
        Ok((coordinator, handle))
    }

    /// Our routing identifier
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Process events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            peer = %self.local_peer,
            fingerprint = %self.fingerprint.short(),
            "Mesh coordinator started"
        );
        self.broadcast_announce(now());

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(MeshEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        info!(peer = %self.local_peer, "Mesh coordinator shutting down");
    }

    /// Process a single event
    pub async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Radio(event) => self.on_radio_event(event).await,
            MeshEvent::App(command) => self.on_app_command(command).await,
            MeshEvent::Tick => self.on_tick().await,
            MeshEvent::Shutdown => {}
        }
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::FrameReceived { from, frame } => {
                if !self.neighbors.contains(&from) {
                    self.on_neighbor_connected(from).await;
                }
                self.on_frame(from, &frame).await;
            }
            RadioEvent::PeerConnected(peer) => self.on_neighbor_connected(peer).await,
            RadioEvent::PeerDisconnected(peer) => {
                if self.neighbors.remove(&peer) {
                    info!(%peer, "Radio neighbor disconnected");
                }
            }
            RadioEvent::SendFailed { peer, reason } => {
                warn!(%peer, %reason, "Radio send failed");
            }
        }
    }

    async fn on_neighbor_connected(&mut self, peer: PeerId) {
        if peer == self.local_peer || !self.neighbors.insert(peer) {
            return;
        }
        info!(%peer, "Radio neighbor connected");

        // a new link never carries an old session over
        self.sessions.on_peer_reconnected(peer);
        self.drain_transitions();

        self.announce_to_neighbor(peer, now());
        self.peer_reachable(peer).await;
    }

    async fn on_frame(&mut self, from: PeerId, frame: &[u8]) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%from, len = frame.len(), error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let now = now();
        match self.router.route_inbound(packet, now) {
            RoutingDecision::Drop(reason) => {
                debug!(%from, %reason, "Packet dropped");
            }
            RoutingDecision::Accept { deliver, relay } => {
                if let Some(relay) = relay {
                    self.relay(relay, from);
                }
                if let Some(packet) = deliver {
                    self.process(packet, now).await;
                }
            }
        }
    }

    fn relay(&self, packet: Packet, from: PeerId) {
        match self.router.encode_frames(&packet) {
            Ok(frames) => self.transmit(&packet, &frames, &[from, packet.sender]),
            Err(e) => debug!(sender = %packet.sender, error = %e, "Cannot relay packet"),
        }
    }

    /// Hand frames to the radio.
    ///
    /// Unicast goes straight to the recipient when it is a neighbor; everything
    /// else floods to all neighbors except those in `exclude`.
    fn transmit(&self, packet: &Packet, frames: &[Bytes], exclude: &[PeerId]) {
        let targets: Vec<PeerId> = match packet.recipient {
            Some(recipient) if self.neighbors.contains(&recipient) => vec![recipient],
            _ => self
                .neighbors
                .iter()
                .copied()
                .filter(|n| !exclude.contains(n))
                .collect(),
        };

        if targets.is_empty() {
            debug!(typ = ?packet.typ, message_id = %packet.message_id, "No neighbor to send to");
        }
        for target in targets {
            for frame in frames {
                self.radio.send_frame(target, frame.clone());
            }
        }
    }

    fn send_packet(&mut self, packet: Packet, now: Instant) -> Result<(), SendError> {
        let frames = self
            .router
            .originate(&packet, now)
            .map_err(|e| SendError::Transport(e.to_string()))?;
        self.transmit(&packet, &frames, &[]);
        Ok(())
    }

    fn send_control(&mut self, typ: PacketType, peer: PeerId, payload: Bytes, now: Instant) {
        let packet = Packet::new(typ, self.local_peer, Some(peer), payload);
        if let Err(e) = self.send_packet(packet, now) {
            warn!(%peer, ?typ, error = %e, "Failed to send handshake message");
        }
    }

    fn announce_packet(&self, recipient: Option<PeerId>) -> Option<Packet> {
        let payload = AnnouncePayload {
            nickname: self.config.nickname.clone(),
            static_key: self.static_key.to_vec(),
        };
        match payload.encode() {
            Ok(payload) => Some(Packet::new(
                PacketType::Announce,
                self.local_peer,
                recipient,
                payload,
            )),
            Err(e) => {
                warn!(error = %e, "Failed to encode announcement");
                None
            }
        }
    }

    fn broadcast_announce(&mut self, now: Instant) {
        self.last_announce = Some(now);
        if let Some(packet) = self.announce_packet(None) {
            debug!(peer = %self.local_peer, "Broadcasting announcement");
            if let Err(e) = self.send_packet(packet, now) {
                warn!(error = %e, "Failed to send announcement");
            }
        }
    }

    fn directed_announce(&mut self, peer: PeerId, now: Instant) {
        if let Some(packet) = self.announce_packet(Some(peer)) {
            debug!(%peer, "Sending directed announcement");
            if let Err(e) = self.send_packet(packet, now) {
                warn!(%peer, error = %e, "Failed to send announcement");
            }
        }
    }

    /// Introduce ourselves to a new neighbor; it relays the announcement on
    fn announce_to_neighbor(&mut self, neighbor: PeerId, now: Instant) {
        let Some(packet) = self.announce_packet(None) else {
            return;
        };
        match self.router.originate(&packet, now) {
            Ok(frames) => {
                for frame in frames {
                    self.radio.send_frame(neighbor, frame);
                }
            }
            Err(e) => warn!(%neighbor, error = %e, "Failed to send announcement"),
        }
    }

    async fn process(&mut self, packet: Packet, now: Instant) {
        let for_us = packet.is_addressed_to(self.local_peer);
        match packet.typ {
            PacketType::Announce => self.on_announce(packet, now).await,
            PacketType::DataBroadcast => self.on_broadcast(packet),
            typ if typ.is_handshake() && for_us => self.on_handshake(packet, now),
            PacketType::DataEncrypted | PacketType::Ack if for_us => {
                self.on_private(packet, now).await
            }
            typ => debug!(sender = %packet.sender, ?typ, "Ignoring packet"),
        }
    }

    async fn on_announce(&mut self, packet: Packet, now: Instant) {
        let sender = packet.sender;
        let announce = match AnnouncePayload::decode(&packet.payload) {
            Ok(announce) if announce.static_key.len() == STATIC_KEY_SIZE => announce,
            Ok(announce) => {
                debug!(%sender, len = announce.static_key.len(), "Announcement with bad key length");
                return;
            }
            Err(e) => {
                debug!(%sender, error = %e, "Undecodable announcement");
                return;
            }
        };

        let fingerprint = Fingerprint::from_static_key(&announce.static_key);
        if fingerprint == self.fingerprint {
            debug!(%sender, "Announcement carries our own key, ignoring");
            return;
        }

        self.registry.observe(sender, fingerprint, now_millis());
        self.registry.set_nickname(fingerprint, &announce.nickname);
        let timeout = self.config.peer_timeout;
        let newly_reachable = self
            .announced
            .insert(sender, now)
            .map_or(true, |last| now.saturating_duration_since(last) >= timeout);

        if self.trust.is_blocked(&fingerprint) {
            debug!(%sender, fingerprint = %fingerprint.short(), "Ignoring blocked peer");
            return;
        }

        let directed = packet.is_addressed_to(self.local_peer);
        match self.sessions.on_announce(sender, directed, now) {
            Ok(Some(init)) => self.send_control(PacketType::HandshakeInit, sender, init, now),
            Ok(None) => {}
            Err(e) => warn!(%sender, error = %e, "Could not start handshake"),
        }
        self.drain_transitions();

        if newly_reachable {
            info!(
                peer = %sender,
                nickname = %announce.nickname,
                fingerprint = %fingerprint.short(),
                "Peer announced"
            );
            self.peer_reachable(sender).await;
        }
    }

    fn on_handshake(&mut self, packet: Packet, now: Instant) {
        let sender = packet.sender;
        if self
            .registry
            .fingerprint_for(sender)
            .is_some_and(|fp| self.trust.is_blocked(&fp))
        {
            debug!(%sender, "Ignoring handshake from blocked peer");
            return;
        }

        match packet.typ {
            PacketType::HandshakeInit => {
                if let Ok(Some(response)) =
                    self.sessions.on_handshake_init(sender, &packet.payload, now)
                {
                    self.send_control(PacketType::HandshakeResp, sender, response, now);
                }
            }
            PacketType::HandshakeResp => {
                if let Ok(Some(finish)) =
                    self.sessions
                        .on_handshake_response(sender, &packet.payload, now)
                {
                    self.send_control(PacketType::HandshakeFinish, sender, finish, now);
                }
            }
            PacketType::HandshakeFinish => {
                // failures are already logged and recorded by the manager
                let _ = self
                    .sessions
                    .on_handshake_finish(sender, &packet.payload, now);
            }
            _ => {}
        }
        self.drain_transitions();
    }

    async fn on_private(&mut self, packet: Packet, now: Instant) {
        let sender = packet.sender;
        let plaintext = match self.sessions.decrypt(sender, &packet.payload) {
            Ok(plaintext) => plaintext,
            Err(SessionError::Replay(nonce)) => {
                debug!(%sender, nonce, "Dropping replayed packet");
                return;
            }
            Err(e) => {
                debug!(%sender, error = %e, "Dropping undecryptable packet");
                self.drain_transitions();
                // the sender still encrypts under keys we no longer hold
                self.renegotiate(sender, now);
                return;
            }
        };
        let payload = match PrivatePayload::decode(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%sender, error = %e, "Undecodable private payload");
                return;
            }
        };

        let fingerprint = self.sessions.remote_fingerprint(sender);
        if fingerprint.is_some_and(|fp| self.trust.is_blocked(&fp)) {
            debug!(%sender, "Dropping private packet from blocked peer");
            return;
        }

        match (packet.typ, payload.kind) {
            (PacketType::DataEncrypted, PrivateKind::Message) => {
                let message_id = payload.message_id;
                if self.remember_private(sender, message_id) {
                    let nickname = fingerprint
                        .and_then(|fp| self.registry.nickname_for(&fp).map(str::to_string));
                    self.handler.on_message_received(ReceivedMessage {
                        sender,
                        fingerprint,
                        nickname,
                        message_id,
                        body: payload.body,
                        private: true,
                        timestamp_ms: packet.timestamp_ms,
                    });
                } else {
                    debug!(%sender, %message_id, "Duplicate private message, acknowledging again");
                }
                if let Err(e) =
                    self.transmit_private(sender, PrivatePayload::delivery_ack(message_id), now)
                {
                    debug!(%sender, error = %e, "Could not acknowledge message");
                }
            }
            (PacketType::Ack, PrivateKind::DeliveryAck) => {
                if let Some(fp) = fingerprint {
                    self.acknowledged(sender, fp, payload.message_id).await;
                }
            }
            (typ, kind) => {
                debug!(%sender, ?typ, ?kind, "Payload kind does not match packet type");
            }
        }
    }

    async fn acknowledged(&mut self, peer: PeerId, fingerprint: Fingerprint, message_id: MessageId) {
        debug!(%peer, %message_id, "Delivery acknowledged");
        if let Some(unacked) = self.unacked.get_mut(&peer) {
            unacked.retain(|entry| entry.message_id != message_id);
            if unacked.is_empty() {
                self.unacked.remove(&peer);
            }
        }
        // a late ack may arrive after the message went back to store-and-forward
        self.queue.complete(&fingerprint, message_id).await;
        self.handler.on_delivery_acknowledged(fingerprint, message_id);
    }

    /// Start over with a peer whose ciphertext we cannot read
    fn renegotiate(&mut self, peer: PeerId, now: Instant) {
        let Some(fingerprint) = self.registry.fingerprint_for(peer) else {
            return;
        };
        if self.trust.is_blocked(&fingerprint) {
            return;
        }
        self.ensure_session(peer, now);
    }

    /// Returns false when the message was delivered before
    fn remember_private(&mut self, sender: PeerId, message_id: MessageId) -> bool {
        if !self.recent_private.insert((sender, message_id)) {
            return false;
        }
        self.recent_order.push_back((sender, message_id));
        while self.recent_order.len() > RECENT_PRIVATE_CAPACITY {
            if let Some(oldest) = self.recent_order.pop_front() {
                self.recent_private.remove(&oldest);
            }
        }
        true
    }

    fn on_broadcast(&mut self, packet: Packet) {
        let fingerprint = self.registry.fingerprint_for(packet.sender);
        if fingerprint.is_some_and(|fp| self.trust.is_blocked(&fp)) {
            debug!(sender = %packet.sender, "Dropping broadcast from blocked peer");
            return;
        }
        let nickname =
            fingerprint.and_then(|fp| self.registry.nickname_for(&fp).map(str::to_string));
        self.handler.on_message_received(ReceivedMessage {
            sender: packet.sender,
            fingerprint,
            nickname,
            message_id: packet.message_id,
            body: packet.payload,
            private: false,
            timestamp_ms: packet.timestamp_ms,
        });
    }

    /// Forward session transitions to the application and react to new
    /// sessions.
    fn drain_transitions(&mut self) {
        loop {
            let transitions = self.sessions.take_transitions();
            if transitions.is_empty() {
                return;
            }

            for transition in transitions {
                debug!(
                    peer = %transition.peer,
                    state = %transition.state,
                    reason = %transition.reason,
                    "Session transition"
                );
                self.handler.on_session_state_changed(
                    transition.peer,
                    transition.state,
                    transition.reason,
                );
                if transition.state != SessionState::Established {
                    // anything sent under the old keys may be lost
                    self.resend_unacked(transition.peer);
                    continue;
                }

                if let Some(fp) = self.sessions.remote_fingerprint(transition.peer) {
                    self.registry.observe(transition.peer, fp, now_millis());
                    if self.trust.is_blocked(&fp) {
                        warn!(peer = %transition.peer, "Session authenticated a blocked peer, closing");
                        self.sessions.reset(transition.peer, TransitionReason::Closed);
                        continue;
                    }
                }
                self.flush_outbox(transition.peer);
            }
        }
    }

    /// Queue unacknowledged messages for `peer` again, ahead of anything newer
    fn resend_unacked(&mut self, peer: PeerId) {
        let Some(mut unacked) = self.unacked.remove(&peer) else {
            return;
        };
        debug!(%peer, count = unacked.len(), "Session lost, resending unacknowledged messages");
        let now = now();
        for entry in &mut unacked {
            entry.queued_at = now;
        }
        let outbox = self.outbox.entry(peer).or_default();
        while let Some(entry) = unacked.pop_back() {
            outbox.push_front(entry);
        }
    }

    fn flush_outbox(&mut self, peer: PeerId) {
        let Some(entries) = self.outbox.remove(&peer) else {
            return;
        };
        let authenticated = self.sessions.remote_fingerprint(peer);
        let now = now();
        let mut stranded = VecDeque::new();
        for entry in entries {
            if authenticated != Some(entry.recipient) {
                warn!(
                    %peer,
                    recipient = %entry.recipient.short(),
                    "Session identity does not match recipient, rerouting message"
                );
                if let Some(entry) = self.reroute(entry, now) {
                    stranded.push_back(entry);
                }
                continue;
            }
            let message_id = entry.message_id;
            if let Err(e) = self.deliver(peer, entry, now) {
                warn!(%peer, %message_id, error = %e, "Failed to send queued message");
            }
        }

        // no better route yet; the outbox timeout hands these to store-and-forward
        if !stranded.is_empty() {
            self.outbox.entry(peer).or_default().extend(stranded);
        }
    }

    /// Send `entry` through another PeerID of its recipient.
    ///
    /// Returns the entry when no other route exists.
    fn reroute(&mut self, entry: OutboxEntry, now: Instant) -> Option<OutboxEntry> {
        let Some(peer) = self.reachable_peer_for(&entry.recipient, now) else {
            return Some(entry);
        };
        if self.sessions.has_established_session(peer) {
            let message_id = entry.message_id;
            if let Err(e) = self.deliver(peer, entry, now) {
                warn!(%peer, %message_id, error = %e, "Failed to send rerouted message");
            }
        } else {
            self.outbox.entry(peer).or_default().push_back(entry);
            self.start_handshake(peer, now);
        }
        None
    }

    /// Encrypt and send a message, keeping it until the recipient acknowledges it
    fn deliver(&mut self, peer: PeerId, mut entry: OutboxEntry, now: Instant) -> Result<(), SendError> {
        let payload = PrivatePayload::message(entry.message_id, entry.plaintext.clone());
        if let Err(e) = self.transmit_private(peer, payload, now) {
            if let Some(delivery) = &entry.pending {
                self.queue.release(delivery.id);
            }
            return Err(e);
        }

        entry.queued_at = now;
        let unacked = self.unacked.entry(peer).or_default();
        unacked.push_back(entry);
        while unacked.len() > self.config.max_outbox_per_peer {
            if let Some(oldest) = unacked.pop_front() {
                debug!(%peer, message_id = %oldest.message_id, "Too many unacknowledged messages, forgetting oldest");
                if let Some(delivery) = &oldest.pending {
                    self.queue.release(delivery.id);
                }
            }
        }
        Ok(())
    }

    fn transmit_private(
        &mut self,
        peer: PeerId,
        payload: PrivatePayload,
        now: Instant,
    ) -> Result<(), SendError> {
        let typ = match payload.kind {
            PrivateKind::Message => PacketType::DataEncrypted,
            PrivateKind::DeliveryAck => PacketType::Ack,
        };
        let plaintext = payload
            .encode()
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let ciphertext = self.sessions.encrypt(peer, &plaintext)?;
        // fresh packet ID per transmission so resends are not eaten by seen caches
        let packet = Packet::new(typ, self.local_peer, Some(peer), ciphertext);
        self.send_packet(packet, now)
    }

    async fn on_app_command(&mut self, command: AppCommand) {
        match command {
            AppCommand::SendMessage {
                recipient,
                plaintext,
                reply,
            } => {
                let result = self.send_message(recipient, plaintext).await;
                let _ = reply.send(result);
            }
            AppCommand::QuerySession { peer, reply } => {
                let _ = reply.send(self.sessions.state(peer));
            }
            AppCommand::InitiateHandshake { peer } => self.ensure_session(peer, now()),
            AppCommand::Announce => self.broadcast_announce(now()),
            AppCommand::ListPeers { reply } => {
                let _ = reply.send(self.peer_list(now()));
            }
            AppCommand::Stats { reply } => {
                let _ = reply.send(self.stats(now()));
            }
        }
    }

    async fn send_message(
        &mut self,
        recipient: Recipient,
        plaintext: Bytes,
    ) -> Result<MessageId, SendError> {
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(SendError::TooLarge(plaintext.len()));
        }
        let now = now();

        match recipient {
            Recipient::Broadcast => {
                let packet = Packet::new(PacketType::DataBroadcast, self.local_peer, None, plaintext);
                let message_id = packet.message_id;
                self.send_packet(packet, now)?;
                Ok(message_id)
            }
            Recipient::Peer(fingerprint) => {
                if fingerprint == self.fingerprint {
                    return Err(SendError::SelfAddressed);
                }
                if self.trust.is_blocked(&fingerprint) {
                    return Err(PolicyError::Blocked(fingerprint).into());
                }
                let message_id = MessageId::random();
                self.send_private(fingerprint, message_id, plaintext, None, now)
                    .await?;
                Ok(message_id)
            }
        }
    }

    /// Deliver now, wait for a handshake, or hold for later, depending on
    /// where the recipient is.
    async fn send_private(
        &mut self,
        recipient: Fingerprint,
        message_id: MessageId,
        plaintext: Bytes,
        pending: Option<PendingDelivery>,
        now: Instant,
    ) -> Result<(), SendError> {
        let Some(peer) = self.reachable_peer_for(&recipient, now) else {
            return self
                .hold_for_later(recipient, message_id, plaintext, pending)
                .await;
        };

        let entry = OutboxEntry {
            recipient,
            message_id,
            plaintext,
            queued_at: now,
            pending,
        };
        // reachable_peer_for only returns sessions that authenticated `recipient`
        if self.sessions.has_established_session(peer) {
            return self.deliver(peer, entry, now);
        }

        let outbox = self.outbox.entry(peer).or_default();
        if outbox.len() >= self.config.max_outbox_per_peer {
            return Err(SendError::OutboxFull(recipient));
        }
        outbox.push_back(entry);
        debug!(%peer, %message_id, "Message waiting for handshake");
        self.ensure_session(peer, now);
        Ok(())
    }

    async fn hold_for_later(
        &mut self,
        recipient: Fingerprint,
        message_id: MessageId,
        plaintext: Bytes,
        pending: Option<PendingDelivery>,
    ) -> Result<(), SendError> {
        let result = match pending {
            Some(delivery) => self.queue.requeue(delivery).await,
            None => self
                .queue
                .enqueue(recipient, message_id, plaintext, now_millis())
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                info!(recipient = %recipient.short(), %message_id, "Recipient out of range, holding message");
                Ok(())
            }
            Err(PolicyError::Untrusted(_)) => Err(SendError::Unreachable(recipient)),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_session(&mut self, peer: PeerId, now: Instant) {
        self.start_handshake(peer, now);
        self.drain_transitions();
    }

    /// Tie-break step towards a session; transitions are left for the caller
    fn start_handshake(&mut self, peer: PeerId, now: Instant) {
        match self.sessions.initiate(peer, now) {
            Ok(HandshakeStep::SendInit(init)) => {
                self.send_control(PacketType::HandshakeInit, peer, init, now)
            }
            Ok(HandshakeStep::SendAnnounce) => self.directed_announce(peer, now),
            Ok(HandshakeStep::InProgress | HandshakeStep::Established) => {}
            Err(e) => warn!(%peer, error = %e, "Could not start handshake"),
        }
    }

    fn is_reachable(&self, peer: PeerId, now: Instant) -> bool {
        self.neighbors.contains(&peer)
            || self
                .announced
                .get(&peer)
                .is_some_and(|seen| now.saturating_duration_since(*seen) < self.config.peer_timeout)
    }

    /// Reachable PeerID for `fingerprint`.
    ///
    /// Announcements are not authenticated, so PeerIDs whose handshake proved
    /// a different identity are skipped. A PeerID with an established session
    /// wins over the newest announced one.
    fn reachable_peer_for(&self, fingerprint: &Fingerprint, now: Instant) -> Option<PeerId> {
        let candidates: Vec<PeerId> = self
            .registry
            .peers_for(fingerprint)
            .into_iter()
            .filter(|peer| self.is_reachable(*peer, now))
            .filter(|peer| {
                self.sessions
                    .remote_fingerprint(*peer)
                    .map_or(true, |authenticated| authenticated == *fingerprint)
            })
            .collect();

        candidates
            .iter()
            .copied()
            .find(|peer| self.sessions.has_established_session(*peer))
            .or_else(|| candidates.first().copied())
    }

    /// Tell the application and flush whatever was held for this identity
    async fn peer_reachable(&mut self, peer: PeerId) {
        let fingerprint = self.registry.fingerprint_for(peer);
        self.handler.on_peer_reachable(peer, fingerprint);

        let Some(fingerprint) = fingerprint else {
            return;
        };
        if self.queue.pending_for(&fingerprint) == 0 {
            return;
        }

        let now = now();
        for delivery in self.queue.take_for(&fingerprint).await {
            let id = delivery.id;
            let message_id = delivery.message_id;
            let plaintext = delivery.plaintext.clone();
            if let Err(e) = self
                .send_private(fingerprint, message_id, plaintext, Some(delivery), now)
                .await
            {
                warn!(%peer, %message_id, error = %e, "Could not forward held message");
                self.queue.release(id);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = now();

        self.router.evict(now);
        self.sessions.expire(now);
        self.drain_transitions();

        let timeout = self.config.peer_timeout;
        self.announced
            .retain(|_, seen| now.saturating_duration_since(*seen) < timeout);

        self.expire_outbox(now).await;
        self.expire_unacked(now).await;

        // keep pushing handshakes for peers that still have messages waiting
        let waiting: Vec<PeerId> = self.outbox.keys().copied().collect();
        for peer in waiting {
            if self.sessions.state(peer) == SessionState::NoSession {
                self.ensure_session(peer, now);
            }
        }

        let evicted = self.queue.evict(now_millis()).await;
        if evicted > 0 {
            info!(evicted, "Dropped expired held messages");
        }

        let due = self.last_announce.map_or(true, |at| {
            now.saturating_duration_since(at) >= self.config.announce_interval
        });
        if due {
            self.broadcast_announce(now);
        }
    }

    /// Move messages whose handshake never finished into store-and-forward
    async fn expire_outbox(&mut self, now: Instant) {
        let timeout = self.config.outbox_timeout;
        let mut expired = Vec::new();
        for entries in self.outbox.values_mut() {
            while entries
                .front()
                .is_some_and(|e| now.saturating_duration_since(e.queued_at) >= timeout)
            {
                if let Some(entry) = entries.pop_front() {
                    expired.push(entry);
                }
            }
        }
        self.outbox.retain(|_, entries| !entries.is_empty());

        for entry in expired {
            let recipient = entry.recipient;
            let message_id = entry.message_id;
            match self
                .hold_for_later(recipient, message_id, entry.plaintext, entry.pending)
                .await
            {
                Ok(()) => debug!(recipient = %recipient.short(), %message_id, "Handshake timed out, message held"),
                Err(e) => warn!(
                    recipient = %recipient.short(),
                    %message_id,
                    error = %e,
                    "Handshake timed out, message dropped"
                ),
            }
        }
    }

    /// Hold messages that were never acknowledged for another attempt
    async fn expire_unacked(&mut self, now: Instant) {
        let timeout = self.config.ack_timeout;
        let mut expired = Vec::new();
        for entries in self.unacked.values_mut() {
            while entries
                .front()
                .is_some_and(|e| now.saturating_duration_since(e.queued_at) >= timeout)
            {
                if let Some(entry) = entries.pop_front() {
                    expired.push(entry);
                }
            }
        }
        self.unacked.retain(|_, entries| !entries.is_empty());

        for entry in expired {
            let recipient = entry.recipient;
            let message_id = entry.message_id;
            match self
                .hold_for_later(recipient, message_id, entry.plaintext, entry.pending)
                .await
            {
                Ok(()) => debug!(recipient = %recipient.short(), %message_id, "No acknowledgment, message held"),
                Err(e) => debug!(
                    recipient = %recipient.short(),
                    %message_id,
                    error = %e,
                    "No acknowledgment, giving up"
                ),
            }
        }
    }

    fn peer_list(&self, now: Instant) -> Vec<PeerInfo> {
        let peers: BTreeSet<PeerId> = self
            .neighbors
            .iter()
            .copied()
            .chain(
                self.announced
                    .keys()
                    .copied()
                    .filter(|peer| self.is_reachable(*peer, now)),
            )
            .collect();

        peers
            .into_iter()
            .map(|peer| {
                let fingerprint = self.registry.fingerprint_for(peer);
                PeerInfo {
                    peer,
                    fingerprint,
                    nickname: fingerprint
                        .and_then(|fp| self.registry.nickname_for(&fp).map(str::to_string)),
                    direct: self.neighbors.contains(&peer),
                    session: self.sessions.state(peer),
                }
            })
            .collect()
    }

    fn stats(&self, now: Instant) -> MeshStats {
        MeshStats {
            router: self.router.stats(),
            neighbors: self.neighbors.len(),
            reachable_peers: self
                .announced
                .keys()
                .filter(|peer| self.is_reachable(**peer, now))
                .count(),
            sessions: self.sessions.session_count(),
            established_sessions: self.sessions.established_peers().len(),
            pending_deliveries: self.queue.len(),
            outbox: self.outbox.values().map(VecDeque::len).sum(),
            awaiting_ack: self.unacked.values().map(VecDeque::len).sum(),
        }
    }
}
