//! Cloneable front end to a running coordinator.

use crate::event::{AppCommand, MeshError, MeshEvent, MeshStats, PeerInfo, RadioEvent, Recipient, SendError};
use async_trait::async_trait;
use bytes::Bytes;
use mesh_identity::Fingerprint;
use mesh_session::SessionState;
use mesh_wire::{MessageId, PeerId};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Narrow view of the mesh handed to collaborators that only need to reason
/// about sessions.
#[async_trait]
pub trait MeshCapability: Send + Sync {
    /// Whether transport keys exist for `peer`
    async fn has_established_session(&self, peer: PeerId) -> bool;
    /// Start a handshake with `peer` if none is running
    async fn initiate_handshake(&self, peer: PeerId);
    /// Our routing identifier
    fn my_peer_id(&self) -> PeerId;
}

/// Handle for talking to a [`MeshCoordinator`](crate::MeshCoordinator).
///
/// All requests are serialized through the coordinator's event queue.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    event_tx: mpsc::Sender<MeshEvent>,
    local_peer: PeerId,
    fingerprint: Fingerprint,
}

impl MeshHandle {
    pub(crate) fn new(
        event_tx: mpsc::Sender<MeshEvent>,
        local_peer: PeerId,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            event_tx,
            local_peer,
            fingerprint,
        }
    }

    /// Our routing identifier
    pub fn my_peer_id(&self) -> PeerId {
        self.local_peer
    }

    /// Our long-term identity
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    async fn submit(&self, event: MeshEvent) -> Result<(), MeshError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| MeshError::Closed)
    }

    /// Send a message; resolves once the coordinator has accepted it
    pub async fn send_message(
        &self,
        recipient: Recipient,
        plaintext: Bytes,
    ) -> Result<MessageId, SendError> {
        let (reply, rx) = oneshot::channel();
        self.submit(MeshEvent::App(AppCommand::SendMessage {
            recipient,
            plaintext,
            reply,
        }))
        .await
        .map_err(|_| SendError::Closed)?;
        rx.await.map_err(|_| SendError::Closed)?
    }

    /// Session state for `peer`
    pub async fn session_state(&self, peer: PeerId) -> Result<SessionState, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.submit(MeshEvent::App(AppCommand::QuerySession { peer, reply }))
            .await?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Ask the coordinator to handshake with `peer`
    pub async fn request_handshake(&self, peer: PeerId) -> Result<(), MeshError> {
        self.submit(MeshEvent::App(AppCommand::InitiateHandshake { peer }))
            .await
    }

    /// Broadcast an announcement now
    pub async fn announce(&self) -> Result<(), MeshError> {
        self.submit(MeshEvent::App(AppCommand::Announce)).await
    }

    /// Reachable peers
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.submit(MeshEvent::App(AppCommand::ListPeers { reply }))
            .await?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Coordinator counters
    pub async fn stats(&self) -> Result<MeshStats, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.submit(MeshEvent::App(AppCommand::Stats { reply })).await?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Feed a radio event, waiting for queue space
    pub async fn radio_event(&self, event: RadioEvent) -> Result<(), MeshError> {
        self.submit(MeshEvent::Radio(event)).await
    }

    /// Feed a radio event from a context that cannot wait
    pub fn try_radio_event(&self, event: RadioEvent) -> Result<(), MeshError> {
        self.event_tx
            .try_send(MeshEvent::Radio(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => MeshError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => MeshError::Closed,
            })
    }

    /// Run housekeeping now
    pub async fn tick(&self) -> Result<(), MeshError> {
        self.submit(MeshEvent::Tick).await
    }

    /// Stop the coordinator after the events already queued
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.submit(MeshEvent::Shutdown).await
    }
}

#[async_trait]
impl MeshCapability for MeshHandle {
    async fn has_established_session(&self, peer: PeerId) -> bool {
        matches!(self.session_state(peer).await, Ok(SessionState::Established))
    }

    async fn initiate_handshake(&self, peer: PeerId) {
        if let Err(e) = self.request_handshake(peer).await {
            warn!(%peer, error = %e, "Could not request handshake");
        }
    }

    fn my_peer_id(&self) -> PeerId {
        self.local_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (MeshHandle, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            MeshHandle::new(tx, PeerId::from_bytes(*b"AAAAAAAA"), Fingerprint([9u8; 32])),
            rx,
        )
    }

    #[tokio::test]
    async fn test_closed_coordinator_reports_closed() {
        let (handle, rx) = handle(4);
        drop(rx);

        assert_eq!(
            handle
                .send_message(Recipient::Broadcast, Bytes::from_static(b"hi"))
                .await,
            Err(SendError::Closed)
        );
        assert!(matches!(handle.announce().await, Err(MeshError::Closed)));
        assert!(!handle.has_established_session(PeerId::from_bytes(*b"BBBBBBBB")).await);
    }

    #[tokio::test]
    async fn test_try_radio_event_reports_full_queue() {
        let (handle, _rx) = handle(1);
        let peer = PeerId::from_bytes(*b"BBBBBBBB");

        handle.try_radio_event(RadioEvent::PeerConnected(peer)).unwrap();
        assert!(matches!(
            handle.try_radio_event(RadioEvent::PeerDisconnected(peer)),
            Err(MeshError::Overloaded)
        ));
    }

    #[tokio::test]
    async fn test_capability_is_object_safe() {
        let (handle, mut rx) = handle(4);
        let capability: Box<dyn MeshCapability> = Box::new(handle);
        let peer = PeerId::from_bytes(*b"BBBBBBBB");

        assert_eq!(capability.my_peer_id(), PeerId::from_bytes(*b"AAAAAAAA"));
        capability.initiate_handshake(peer).await;
        assert!(matches!(
            rx.recv().await,
            Some(MeshEvent::App(AppCommand::InitiateHandshake { peer: p })) if p == peer
        ));
    }
}
