//! Events consumed by the coordinator and the errors it reports back.

use bytes::Bytes;
use mesh_identity::Fingerprint;
use mesh_routing::RouterStats;
use mesh_session::{SessionError, SessionState};
use mesh_storage::{PolicyError, StorageError};
use mesh_wire::{MessageId, PeerId};
use thiserror::Error;
use tokio::sync::oneshot;

/// Everything the coordinator reacts to, in arrival order
#[derive(Debug)]
pub enum MeshEvent {
    /// Something happened on the radio link layer
    Radio(RadioEvent),
    /// Request from the application
    App(AppCommand),
    /// Run housekeeping now
    Tick,
    /// Stop the coordinator
    Shutdown,
}

/// Link-layer notifications from the radio adapter
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A frame arrived from the directly connected neighbor `from`
    FrameReceived {
        /// Neighbor the frame was received from
        from: PeerId,
        /// Raw frame bytes
        frame: Bytes,
    },
    /// A neighbor link came up
    PeerConnected(PeerId),
    /// A neighbor link went away
    PeerDisconnected(PeerId),
    /// An earlier `send_frame` could not be delivered
    SendFailed {
        /// Neighbor the frame was meant for
        peer: PeerId,
        /// Adapter-specific reason
        reason: String,
    },
}

/// Destination of an application message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Everyone in range of the flood
    Broadcast,
    /// A single peer, by long-term identity
    Peer(Fingerprint),
}

/// Application requests; replies travel back on oneshot channels
#[derive(Debug)]
pub enum AppCommand {
    /// Send a message
    SendMessage {
        /// Destination
        recipient: Recipient,
        /// Message body
        plaintext: Bytes,
        /// Completion
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    /// Report the session state for a peer
    QuerySession {
        /// Peer to look up
        peer: PeerId,
        /// Completion
        reply: oneshot::Sender<SessionState>,
    },
    /// Start (or nudge) a handshake with a peer
    InitiateHandshake {
        /// Peer to handshake with
        peer: PeerId,
    },
    /// Broadcast an announcement right away
    Announce,
    /// List reachable peers
    ListPeers {
        /// Completion
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    /// Report counters
    Stats {
        /// Completion
        reply: oneshot::Sender<MeshStats>,
    },
}

/// A reachable peer as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Routing identifier
    pub peer: PeerId,
    /// Identity, once announced or authenticated
    pub fingerprint: Option<Fingerprint>,
    /// Last announced nickname
    pub nickname: Option<String>,
    /// Whether the peer is a radio neighbor
    pub direct: bool,
    /// Noise session state
    pub session: SessionState,
}

/// Coordinator counters
#[derive(Debug, Clone, Default)]
pub struct MeshStats {
    /// Relay router counters
    pub router: RouterStats,
    /// Connected radio neighbors
    pub neighbors: usize,
    /// Peers heard from recently
    pub reachable_peers: usize,
    /// Sessions in any state
    pub sessions: usize,
    /// Established sessions
    pub established_sessions: usize,
    /// Messages held in store-and-forward
    pub pending_deliveries: usize,
    /// Messages waiting for a handshake
    pub outbox: usize,
    /// Messages sent but not acknowledged yet
    pub awaiting_ack: usize,
}

/// Why a message could not be sent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Recipient is out of range and not eligible for store-and-forward
    #[error("peer {0} is unreachable")]
    Unreachable(Fingerprint),
    /// Trust policy refused the message
    #[error("{0}")]
    Policy(#[from] PolicyError),
    /// Message addressed to ourselves
    #[error("cannot send a private message to ourselves")]
    SelfAddressed,
    /// Body exceeds the size limit
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    /// Too many messages already waiting on this peer's handshake
    #[error("outbox for {0} is full")]
    OutboxFull(Fingerprint),
    /// Session layer failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    /// Packet could not be encoded or framed
    #[error("transport error: {0}")]
    Transport(String),
    /// The coordinator is gone
    #[error("mesh coordinator is not running")]
    Closed,
}

/// Errors from the coordinator's control surface
#[derive(Error, Debug)]
pub enum MeshError {
    /// Store-and-forward persistence failed to open
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The coordinator is gone
    #[error("mesh coordinator is not running")]
    Closed,
    /// The event queue is full
    #[error("mesh event queue is full")]
    Overloaded,
}
