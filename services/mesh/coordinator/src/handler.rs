//! Notifications from the coordinator to the application.

use bytes::Bytes;
use mesh_identity::Fingerprint;
use mesh_session::{SessionState, TransitionReason};
use mesh_wire::{MessageId, PeerId};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A message delivered to the local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Originating peer
    pub sender: PeerId,
    /// Sender identity, when known
    pub fingerprint: Option<Fingerprint>,
    /// Sender nickname, when announced
    pub nickname: Option<String>,
    /// Application message ID
    pub message_id: MessageId,
    /// Message body
    pub body: Bytes,
    /// Whether it arrived over an encrypted session
    pub private: bool,
    /// Origination timestamp (unix ms)
    pub timestamp_ms: u64,
}

/// Receives coordinator notifications.
///
/// Called from inside the coordinator loop, so implementations must not block.
pub trait MeshEventHandler: Send + Sync + std::fmt::Debug {
    /// A broadcast or private message arrived for us
    fn on_message_received(&self, message: ReceivedMessage);
    /// A session changed state
    fn on_session_state_changed(&self, peer: PeerId, state: SessionState, reason: TransitionReason);
    /// The recipient confirmed a private message
    fn on_delivery_acknowledged(&self, recipient: Fingerprint, message_id: MessageId);
    /// A peer became reachable (radio link or announcement)
    fn on_peer_reachable(&self, peer: PeerId, fingerprint: Option<Fingerprint>);
}

/// Notification forwarded by [`ChannelEventHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// See [`MeshEventHandler::on_message_received`]
    MessageReceived(ReceivedMessage),
    /// See [`MeshEventHandler::on_session_state_changed`]
    SessionStateChanged {
        /// Remote peer
        peer: PeerId,
        /// New state
        state: SessionState,
        /// What caused it
        reason: TransitionReason,
    },
    /// See [`MeshEventHandler::on_delivery_acknowledged`]
    DeliveryAcknowledged {
        /// Who confirmed
        recipient: Fingerprint,
        /// Confirmed message
        message_id: MessageId,
    },
    /// See [`MeshEventHandler::on_peer_reachable`]
    PeerReachable {
        /// Reachable peer
        peer: PeerId,
        /// Its identity, when known
        fingerprint: Option<Fingerprint>,
    },
}

/// Forwards every notification into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    event_tx: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelEventHandler {
    /// Create a handler wrapping `event_tx`
    pub fn new(event_tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_tx }
    }

    /// Create a handler together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::new(event_tx), event_rx)
    }

    fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_tx.send(event) {
            error!("Failed to forward mesh event: {:?}", e.0);
        }
    }
}

impl MeshEventHandler for ChannelEventHandler {
    fn on_message_received(&self, message: ReceivedMessage) {
        debug!(sender = %message.sender, message_id = %message.message_id, "Message received");
        self.send_event(AppEvent::MessageReceived(message));
    }

    fn on_session_state_changed(&self, peer: PeerId, state: SessionState, reason: TransitionReason) {
        self.send_event(AppEvent::SessionStateChanged {
            peer,
            state,
            reason,
        });
    }

    fn on_delivery_acknowledged(&self, recipient: Fingerprint, message_id: MessageId) {
        self.send_event(AppEvent::DeliveryAcknowledged {
            recipient,
            message_id,
        });
    }

    fn on_peer_reachable(&self, peer: PeerId, fingerprint: Option<Fingerprint>) {
        self.send_event(AppEvent::PeerReachable { peer, fingerprint });
    }
}
