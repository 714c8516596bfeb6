//! Boundary to the radio link layer.

use bytes::Bytes;
use mesh_wire::PeerId;

/// Sends frames to directly connected neighbors.
///
/// Implementations queue the frame and return immediately; delivery failures
/// come back as [`RadioEvent::SendFailed`](crate::RadioEvent::SendFailed).
pub trait RadioTransport: Send + Sync {
    /// Queue `frame` for the neighbor `peer`
    fn send_frame(&self, peer: PeerId, frame: Bytes);
}
