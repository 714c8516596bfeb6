//! UDP stand-in for a short-range radio.
//!
//! Every datagram is `[sender PeerID][packet bytes]`. A datagram carrying only
//! the PeerID is a hello. The first datagram from a peer brings its link up;
//! links that stay silent for several hello intervals go down again.

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mesh_coordinator::{MeshHandle, RadioEvent, RadioTransport};
use mesh_wire::{PeerId, PEER_ID_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

const MAX_DATAGRAM: usize = 64 * 1024;

// hello intervals without traffic before a link is considered gone
const LINK_TIMEOUT_HELLOS: u32 = 3;

/// Prefix `packet` with the sending PeerID
pub fn encode_link_frame(sender: PeerId, packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PEER_ID_SIZE + packet.len());
    buf.put_slice(sender.as_bytes());
    buf.put_slice(packet);
    buf.freeze()
}

/// Split a datagram into sender and packet bytes (empty for hellos)
pub fn decode_link_frame(datagram: &[u8]) -> Option<(PeerId, Bytes)> {
    if datagram.len() < PEER_ID_SIZE {
        return None;
    }
    let (id, packet) = datagram.split_at(PEER_ID_SIZE);
    let mut raw = [0u8; PEER_ID_SIZE];
    raw.copy_from_slice(id);
    Some((PeerId::from_bytes(raw), Bytes::copy_from_slice(packet)))
}

#[derive(Debug, Clone, Copy)]
struct Link {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Sending half, handed to the coordinator
pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    local_peer: PeerId,
    links: Arc<DashMap<PeerId, Link>>,
    failures: mpsc::UnboundedSender<RadioEvent>,
}

/// Receiving half; feeds link events into the coordinator
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    local_peer: PeerId,
    links: Arc<DashMap<PeerId, Link>>,
    failures_rx: mpsc::UnboundedReceiver<RadioEvent>,
    neighbors: Vec<SocketAddr>,
    hello_interval: Duration,
}

/// Bind the radio socket
pub async fn bind(
    addr: SocketAddr,
    local_peer: PeerId,
    neighbors: Vec<SocketAddr>,
    hello_interval: Duration,
) -> std::io::Result<(Arc<UdpRadio>, UdpLink)> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let links = Arc::new(DashMap::new());
    let (failures, failures_rx) = mpsc::unbounded_channel();

    let radio = Arc::new(UdpRadio {
        socket: Arc::clone(&socket),
        local_peer,
        links: Arc::clone(&links),
        failures,
    });
    let link = UdpLink {
        socket,
        local_peer,
        links,
        failures_rx,
        neighbors,
        hello_interval,
    };
    Ok((radio, link))
}

impl UdpRadio {
    fn report_failure(&self, peer: PeerId, reason: String) {
        let _ = self.failures.send(RadioEvent::SendFailed { peer, reason });
    }
}

impl RadioTransport for UdpRadio {
    fn send_frame(&self, peer: PeerId, frame: Bytes) {
        let Some(addr) = self.links.get(&peer).map(|link| link.addr) else {
            self.report_failure(peer, "no link".to_string());
            return;
        };
        let datagram = encode_link_frame(self.local_peer, &frame);
        if let Err(e) = self.socket.try_send_to(&datagram, addr) {
            self.report_failure(peer, e.to_string());
        }
    }
}

impl UdpLink {
    /// Local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Pump datagrams, hellos and send failures until the coordinator stops
    pub async fn run(mut self, handle: MeshHandle) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut hello = tokio::time::interval(self.hello_interval);

        component_info!(
            "radio",
            "UDP radio listening on {:?} with {} configured neighbors",
            self.socket.local_addr().ok(),
            self.neighbors.len()
        );

        loop {
            let delivered = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.on_datagram(&buf[..len], addr, &handle).await,
                    Err(e) => {
                        component_debug!("radio", "UDP receive error: {}", e);
                        true
                    }
                },
                Some(failure) = self.failures_rx.recv() => handle.radio_event(failure).await.is_ok(),
                _ = hello.tick() => {
                    self.send_hellos().await;
                    self.expire_links(&handle).await
                }
            };

            if !delivered {
                component_info!("radio", "Mesh coordinator gone, stopping UDP radio");
                break;
            }
        }
    }

    /// Returns false once the coordinator stopped accepting events
    async fn on_datagram(&self, datagram: &[u8], addr: SocketAddr, handle: &MeshHandle) -> bool {
        let Some((peer, packet)) = decode_link_frame(datagram) else {
            component_debug!("radio", "Runt datagram from {}", addr);
            return true;
        };
        if peer == self.local_peer {
            return true;
        }

        let now = Instant::now();
        let previous = self.links.insert(peer, Link { addr, last_seen: now });
        if previous.map_or(true, |link| link.addr != addr) {
            component_info!("radio", "Radio link up: {} at {}", peer, addr);
            if handle.radio_event(RadioEvent::PeerConnected(peer)).await.is_err() {
                return false;
            }
        }

        if packet.is_empty() {
            return true;
        }
        handle
            .radio_event(RadioEvent::FrameReceived {
                from: peer,
                frame: packet,
            })
            .await
            .is_ok()
    }

    async fn send_hellos(&self) {
        let hello = encode_link_frame(self.local_peer, &[]);
        let mut targets: Vec<SocketAddr> = self.neighbors.clone();
        targets.extend(self.links.iter().map(|link| link.addr));
        targets.sort();
        targets.dedup();

        for addr in targets {
            if let Err(e) = self.socket.send_to(&hello, addr).await {
                component_debug!("radio", "Hello to {} failed: {}", addr, e);
            }
        }
    }

    async fn expire_links(&self, handle: &MeshHandle) -> bool {
        let timeout = self.hello_interval * LINK_TIMEOUT_HELLOS;
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .links
            .iter()
            .filter(|link| now.saturating_duration_since(link.last_seen) > timeout)
            .map(|link| *link.key())
            .collect();

        for peer in stale {
            self.links.remove(&peer);
            component_info!("radio", "Radio link down: {}", peer);
            if handle
                .radio_event(RadioEvent::PeerDisconnected(peer))
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }
}
