//! Coordinator configuration.

use mesh_routing::RouterConfig;
use mesh_session::SessionConfig;
use mesh_storage::QueueConfig;
use mesh_wire::PeerId;
use std::time::Duration;

/// Configuration for a mesh coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Routing identifier; a random one is generated when unset
    pub peer_id: Option<PeerId>,
    /// Nickname carried in announcements
    pub nickname: String,
    /// Interval between broadcast announcements
    pub announce_interval: Duration,
    /// Housekeeping interval
    pub tick_interval: Duration,
    /// Announced peers not heard from within this window are unreachable
    pub peer_timeout: Duration,
    /// Messages waiting on a handshake longer than this go to store-and-forward
    pub outbox_timeout: Duration,
    /// Sent messages not acknowledged within this window go to store-and-forward
    pub ack_timeout: Duration,
    /// Per-peer bound on messages waiting for a handshake or an acknowledgment
    pub max_outbox_per_peer: usize,
    /// Capacity of the coordinator's event queue
    pub event_queue_size: usize,
    /// Noise session settings
    pub session: SessionConfig,
    /// Relay router settings
    pub router: RouterConfig,
    /// Store-and-forward limits
    pub queue: QueueConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            nickname: "anon".to_string(),
            announce_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(120),
            outbox_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(30),
            max_outbox_per_peer: 32,
            event_queue_size: 1024,
            session: SessionConfig::default(),
            router: RouterConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}
