//! Session states and transition records.

use mesh_wire::PeerId;
use std::fmt;
use std::time::Duration;

/// Configuration for the session manager
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Handshakes not completed within this window are abandoned
    pub handshake_timeout: Duration,
    /// Established sessions are torn down after this long
    pub session_lifetime: Duration,
    /// Upper bound on tracked sessions (oldest evicted first)
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            session_lifetime: Duration::from_secs(60 * 60),
            max_sessions: 256,
        }
    }
}

/// Side of the handshake we play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We sent HandshakeInit
    Initiator,
    /// We answered HandshakeInit
    Responder,
}

/// Per-peer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing negotiated
    NoSession,
    /// Handshake in flight
    Handshaking(Role),
    /// Transport keys available
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NoSession => write!(f, "no-session"),
            SessionState::Handshaking(Role::Initiator) => write!(f, "handshaking(initiator)"),
            SessionState::Handshaking(Role::Responder) => write!(f, "handshaking(responder)"),
            SessionState::Established => write!(f, "established"),
        }
    }
}

/// Why a session changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionReason {
    /// We started or answered a handshake
    HandshakeStarted,
    /// Handshake finished; keys derived
    HandshakeCompleted,
    /// A newer handshake replaced the old session
    Superseded,
    /// A handshake message failed to process
    HandshakeFailed,
    /// Handshake did not finish in time
    HandshakeTimeout,
    /// Ciphertext failed authentication
    DecryptFailed,
    /// Session lifetime reached
    Expired,
    /// Peer's transport connection was re-established
    Reconnected,
    /// Peer announced itself to us while we held a session, so it lost its keys
    PeerLostSession,
    /// Evicted to respect the session table bound
    Evicted,
    /// Explicit teardown
    Closed,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransitionReason::HandshakeStarted => "handshake started",
            TransitionReason::HandshakeCompleted => "handshake completed",
            TransitionReason::Superseded => "superseded",
            TransitionReason::HandshakeFailed => "handshake failed",
            TransitionReason::HandshakeTimeout => "handshake timeout",
            TransitionReason::DecryptFailed => "decrypt failed",
            TransitionReason::Expired => "expired",
            TransitionReason::Reconnected => "reconnected",
            TransitionReason::PeerLostSession => "peer lost session",
            TransitionReason::Evicted => "evicted",
            TransitionReason::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// One recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTransition {
    /// Remote peer
    pub peer: PeerId,
    /// State after the change
    pub state: SessionState,
    /// Cause
    pub reason: TransitionReason,
}

/// What the caller must do to reach an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// We are the designated initiator: send this HandshakeInit payload
    SendInit(bytes::Bytes),
    /// The peer is the designated initiator: send it a directed announcement
    SendAnnounce,
    /// A handshake is already running
    InProgress,
    /// Session already established
    Established,
}
