//! Per-peer Noise session table.
//!
//! The manager owns every handshake and transport state and applies the
//! deterministic tie-break: the side with the lexicographically smaller PeerID
//! initiates. The other side answers a need to talk with a directed
//! announcement and waits for the HandshakeInit.

use crate::noise::{Handshake, Transport};
use crate::session::{
    HandshakeStep, Role, SessionConfig, SessionState, SessionTransition, TransitionReason,
};
use crate::SessionError;
use bytes::Bytes;
use mesh_identity::{Fingerprint, NodeIdentity};
use mesh_wire::PeerId;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

enum Phase {
    Handshake(Handshake),
    Transport(Transport),
}

struct PeerSession {
    role: Role,
    phase: Phase,
    started_at: Instant,
    established_at: Option<Instant>,
    remote_fingerprint: Option<Fingerprint>,
}

impl PeerSession {
    fn handshaking(role: Role, handshake: Handshake, now: Instant) -> Self {
        Self {
            role,
            phase: Phase::Handshake(handshake),
            started_at: now,
            established_at: None,
            remote_fingerprint: None,
        }
    }

    fn state(&self) -> SessionState {
        match self.phase {
            Phase::Handshake(_) => SessionState::Handshaking(self.role),
            Phase::Transport(_) => SessionState::Established,
        }
    }
}

/// Owns all Noise sessions of the local node
pub struct NoiseSessionManager {
    local_peer: PeerId,
    identity: NodeIdentity,
    config: SessionConfig,
    sessions: HashMap<PeerId, PeerSession>,
    transitions: Vec<SessionTransition>,
}

impl NoiseSessionManager {
    /// Create a manager for `local_peer` using the node's static keys
    pub fn new(local_peer: PeerId, identity: NodeIdentity, config: SessionConfig) -> Self {
        Self {
            local_peer,
            identity,
            config,
            sessions: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    /// Our routing identifier
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Our static identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Current state for `peer`
    pub fn state(&self, peer: PeerId) -> SessionState {
        self.sessions
            .get(&peer)
            .map(PeerSession::state)
            .unwrap_or(SessionState::NoSession)
    }

    /// Whether transport keys exist for `peer`
    pub fn has_established_session(&self, peer: PeerId) -> bool {
        self.state(peer) == SessionState::Established
    }

    /// Fingerprint authenticated during the handshake
    pub fn remote_fingerprint(&self, peer: PeerId) -> Option<Fingerprint> {
        self.sessions.get(&peer).and_then(|s| s.remote_fingerprint)
    }

    /// Peers with established sessions
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Established)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Number of tracked sessions in any state
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drain recorded state changes
    pub fn take_transitions(&mut self) -> Vec<SessionTransition> {
        std::mem::take(&mut self.transitions)
    }

    fn is_designated_initiator(&self, peer: PeerId) -> bool {
        self.local_peer < peer
    }

    /// Work towards a session with `peer`
    pub fn initiate(&mut self, peer: PeerId, now: Instant) -> Result<HandshakeStep, SessionError> {
        match self.state(peer) {
            SessionState::Established => Ok(HandshakeStep::Established),
            SessionState::Handshaking(_) => Ok(HandshakeStep::InProgress),
            SessionState::NoSession if self.is_designated_initiator(peer) => {
                self.start_initiator(peer, now).map(HandshakeStep::SendInit)
            }
            SessionState::NoSession => {
                debug!(%peer, "Peer is the designated initiator, announcing instead");
                Ok(HandshakeStep::SendAnnounce)
            }
        }
    }

    /// Apply the announcement rule.
    ///
    /// Returns a HandshakeInit payload when we should start the handshake.
    pub fn on_announce(
        &mut self,
        peer: PeerId,
        directed: bool,
        now: Instant,
    ) -> Result<Option<Bytes>, SessionError> {
        if directed && self.state(peer) == SessionState::Established {
            self.reset(peer, TransitionReason::PeerLostSession);
        }

        if self.state(peer) == SessionState::NoSession && self.is_designated_initiator(peer) {
            return self.start_initiator(peer, now).map(Some);
        }
        Ok(None)
    }

    /// Handle HandshakeInit; returns the HandshakeResp payload to send
    pub fn on_handshake_init(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<Option<Bytes>, SessionError> {
        match self.state(peer) {
            SessionState::NoSession => {}
            SessionState::Handshaking(Role::Initiator) if self.is_designated_initiator(peer) => {
                warn!(%peer, "Ignoring crossed HandshakeInit, we are the initiator");
                return Ok(None);
            }
            _ => {
                self.reset(peer, TransitionReason::Superseded);
            }
        }

        match self.respond(message) {
            Ok((handshake, response)) => {
                self.install(
                    peer,
                    PeerSession::handshaking(Role::Responder, handshake, now),
                    TransitionReason::HandshakeStarted,
                );
                Ok(Some(response))
            }
            Err(e) => {
                warn!(%peer, error = %e, "Rejected HandshakeInit");
                Err(e)
            }
        }
    }

    /// Handle HandshakeResp; returns the HandshakeFinish payload to send
    pub fn on_handshake_response(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<Option<Bytes>, SessionError> {
        if self.state(peer) != SessionState::Handshaking(Role::Initiator) {
            warn!(%peer, state = %self.state(peer), "Unexpected HandshakeResp");
            return Ok(None);
        }
        let Some(PeerSession {
            phase: Phase::Handshake(mut handshake),
            started_at,
            ..
        }) = self.sessions.remove(&peer)
        else {
            return Ok(None);
        };

        let result = handshake
            .read(message)
            .and_then(|_| handshake.write())
            .and_then(|finish| {
                self.complete(peer, Role::Initiator, handshake, started_at, now)?;
                Ok(finish)
            });

        match result {
            Ok(finish) => Ok(Some(finish)),
            Err(e) => {
                self.handshake_failed(peer, &e);
                Err(e)
            }
        }
    }

    /// Handle HandshakeFinish; returns true once the session is established
    pub fn on_handshake_finish(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<bool, SessionError> {
        if self.state(peer) != SessionState::Handshaking(Role::Responder) {
            warn!(%peer, state = %self.state(peer), "Unexpected HandshakeFinish");
            return Ok(false);
        }
        let Some(PeerSession {
            phase: Phase::Handshake(mut handshake),
            started_at,
            ..
        }) = self.sessions.remove(&peer)
        else {
            return Ok(false);
        };

        let result = handshake
            .read(message)
            .and_then(|_| self.complete(peer, Role::Responder, handshake, started_at, now));

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.handshake_failed(peer, &e);
                Err(e)
            }
        }
    }

    /// Encrypt for an established peer
    pub fn encrypt(&mut self, peer: PeerId, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        match self.sessions.get_mut(&peer) {
            Some(PeerSession {
                phase: Phase::Transport(transport),
                ..
            }) => transport.encrypt(plaintext),
            _ => Err(SessionError::NotReady(peer)),
        }
    }

    /// Decrypt from an established peer.
    ///
    /// Authentication failure tears the session down; a replayed nonce does not.
    pub fn decrypt(&mut self, peer: PeerId, ciphertext: &[u8]) -> Result<Bytes, SessionError> {
        let result = match self.sessions.get_mut(&peer) {
            Some(PeerSession {
                phase: Phase::Transport(transport),
                ..
            }) => transport.decrypt(ciphertext),
            _ => return Err(SessionError::NotReady(peer)),
        };

        match result {
            Err(SessionError::Replay(nonce)) => {
                debug!(%peer, nonce, "Dropped replayed ciphertext");
                Err(SessionError::Replay(nonce))
            }
            Err(e) => {
                warn!(%peer, error = %e, "Decryption failed, resetting session");
                self.reset(peer, TransitionReason::DecryptFailed);
                Err(e)
            }
            ok => ok,
        }
    }

    /// Drop any session with `peer`; returns whether one existed
    pub fn reset(&mut self, peer: PeerId, reason: TransitionReason) -> bool {
        if self.sessions.remove(&peer).is_some() {
            self.record(peer, SessionState::NoSession, reason);
            true
        } else {
            false
        }
    }

    /// A new transport connection to `peer` never inherits a session
    pub fn on_peer_reconnected(&mut self, peer: PeerId) {
        self.reset(peer, TransitionReason::Reconnected);
    }

    /// Expire stale handshakes and sessions past their lifetime
    pub fn expire(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (peer, session) in &self.sessions {
            match session.established_at {
                None if now.saturating_duration_since(session.started_at)
                    >= self.config.handshake_timeout =>
                {
                    expired.push((*peer, TransitionReason::HandshakeTimeout));
                }
                Some(at) if now.saturating_duration_since(at) >= self.config.session_lifetime => {
                    expired.push((*peer, TransitionReason::Expired));
                }
                _ => {}
            }
        }

        for (peer, reason) in expired {
            self.reset(peer, reason);
        }
    }

    fn start_initiator(&mut self, peer: PeerId, now: Instant) -> Result<Bytes, SessionError> {
        let mut handshake = Handshake::initiator(&self.identity.private_key())?;
        let init = handshake.write()?;
        self.install(
            peer,
            PeerSession::handshaking(Role::Initiator, handshake, now),
            TransitionReason::HandshakeStarted,
        );
        Ok(init)
    }

    fn respond(&self, message: &[u8]) -> Result<(Handshake, Bytes), SessionError> {
        let mut handshake = Handshake::responder(&self.identity.private_key())?;
        handshake.read(message)?;
        let response = handshake.write()?;
        Ok((handshake, response))
    }

    fn complete(
        &mut self,
        peer: PeerId,
        role: Role,
        handshake: Handshake,
        started_at: Instant,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !handshake.is_finished() {
            return Err(SessionError::Handshake("handshake incomplete".to_string()));
        }
        let remote_static = handshake
            .remote_static()
            .ok_or_else(|| SessionError::Handshake("missing remote static key".to_string()))?;
        let fingerprint = Fingerprint::from_static_key(&remote_static);
        let transport = handshake.into_transport()?;

        info!(
            %peer,
            fingerprint = %fingerprint.short(),
            role = ?role,
            "Noise session established"
        );
        self.install(
            peer,
            PeerSession {
                role,
                phase: Phase::Transport(transport),
                started_at,
                established_at: Some(now),
                remote_fingerprint: Some(fingerprint),
            },
            TransitionReason::HandshakeCompleted,
        );
        Ok(())
    }

    fn handshake_failed(&mut self, peer: PeerId, error: &SessionError) {
        warn!(%peer, error = %error, "Handshake failed, peer reset");
        // the session was already removed from the table
        self.record(peer, SessionState::NoSession, TransitionReason::HandshakeFailed);
    }

    fn install(&mut self, peer: PeerId, session: PeerSession, reason: TransitionReason) {
        if !self.sessions.contains_key(&peer) && self.sessions.len() >= self.config.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.started_at)
                .map(|(p, _)| *p);
            if let Some(oldest) = oldest {
                self.reset(oldest, TransitionReason::Evicted);
            }
        }

        let state = session.state();
        self.sessions.insert(peer, session);
        self.record(peer, state, reason);
    }

    fn record(&mut self, peer: PeerId, state: SessionState, reason: TransitionReason) {
        debug!(%peer, %state, %reason, "Session transition");
        self.transitions.push(SessionTransition {
            peer,
            state,
            reason,
        });
    }
}
