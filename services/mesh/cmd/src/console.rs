//! Line-oriented chat console on stdin/stdout.

use anyhow::Result;
use bytes::Bytes;
use mesh_coordinator::{AppEvent, MeshCapability, MeshHandle, PeerInfo, Recipient};
use mesh_identity::{Fingerprint, MemoryTrustStore};
use mesh_wire::PeerId;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Plain text: broadcast it
    Broadcast(String),
    /// `/msg <fingerprint> <text>`
    Private { target: String, text: String },
    /// `/fav <fingerprint>`
    Favorite(String),
    /// `/unfav <fingerprint>`
    Unfavorite(String),
    /// `/block <fingerprint>`
    Block(String),
    /// `/unblock <fingerprint>`
    Unblock(String),
    /// `/handshake <peer-id>`
    Handshake(String),
    /// `/peers`
    Peers,
    /// `/whoami`
    WhoAmI,
    /// `/quit`
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command {0}, try /msg /fav /unfav /block /unblock /handshake /peers /whoami /quit")]
    UnknownCommand(String),
    #[error("no known peer matches {0}")]
    NoMatch(String),
    #[error("{0} matches more than one peer")]
    Ambiguous(String),
}

/// Parse one input line; `None` for blank lines
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(ConsoleCommand::Broadcast(line.to_string())));
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let first = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let arg = |usage: &'static str| first.map(str::to_string).ok_or(ConsoleError::Usage(usage));
    let command = match command {
        "/msg" => match (first, rest) {
            (Some(target), Some(text)) => ConsoleCommand::Private {
                target: target.to_string(),
                text: text.to_string(),
            },
            _ => return Err(ConsoleError::Usage("/msg <fingerprint> <text>")),
        },
        "/fav" => ConsoleCommand::Favorite(arg("/fav <fingerprint>")?),
        "/unfav" => ConsoleCommand::Unfavorite(arg("/unfav <fingerprint>")?),
        "/block" => ConsoleCommand::Block(arg("/block <fingerprint>")?),
        "/unblock" => ConsoleCommand::Unblock(arg("/unblock <fingerprint>")?),
        "/handshake" => ConsoleCommand::Handshake(arg("/handshake <peer-id>")?),
        "/peers" => ConsoleCommand::Peers,
        "/whoami" => ConsoleCommand::WhoAmI,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => return Err(ConsoleError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

/// Resolve a full fingerprint or a unique hex prefix of a known one
pub fn resolve_fingerprint(token: &str, known: &[Fingerprint]) -> Result<Fingerprint, ConsoleError> {
    if let Ok(fingerprint) = Fingerprint::from_str(token) {
        return Ok(fingerprint);
    }
    let prefix = token.to_ascii_lowercase();
    let mut matches = known.iter().filter(|fp| fp.to_hex().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(fingerprint), None) => Ok(*fingerprint),
        (Some(_), Some(_)) => Err(ConsoleError::Ambiguous(token.to_string())),
        (None, _) => Err(ConsoleError::NoMatch(token.to_string())),
    }
}

/// One-line rendering of a coordinator notification
pub fn render_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::MessageReceived(message) => {
            let who = message
                .nickname
                .clone()
                .or_else(|| message.fingerprint.map(|fp| fp.short()))
                .unwrap_or_else(|| message.sender.to_string());
            let body = String::from_utf8_lossy(&message.body);
            if message.private {
                Some(format!("[private] <{}> {}", who, body))
            } else {
                Some(format!("<{}> {}", who, body))
            }
        }
        AppEvent::DeliveryAcknowledged {
            recipient,
            message_id,
        } => Some(format!("* {} delivered to {}", message_id, recipient.short())),
        AppEvent::PeerReachable {
            peer,
            fingerprint: Some(fingerprint),
        } => Some(format!("* {} ({}) is in range", peer, fingerprint.short())),
        AppEvent::PeerReachable { .. } | AppEvent::SessionStateChanged { .. } => None,
    }
}

fn render_peer(info: &PeerInfo) -> String {
    format!(
        "  {} {:<12} {} {}{}",
        info.peer,
        info.nickname.as_deref().unwrap_or("?"),
        info.fingerprint
            .map(|fp| fp.to_hex())
            .unwrap_or_else(|| "-".to_string()),
        info.session,
        if info.direct { " (direct)" } else { "" }
    )
}

/// Console bound to a running mesh
pub struct Console {
    mesh: MeshHandle,
    sessions: Arc<dyn MeshCapability>,
    trust: MemoryTrustStore,
}

impl Console {
    pub fn new(mesh: MeshHandle, sessions: Arc<dyn MeshCapability>, trust: MemoryTrustStore) -> Self {
        Self {
            mesh,
            sessions,
            trust,
        }
    }

    /// Read stdin until EOF or `/quit`, printing coordinator events as they come
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<AppEvent>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type a message to broadcast, or /msg /fav /unfav /block /peers /whoami /quit");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_line(&line) {
                        Ok(Some(ConsoleCommand::Quit)) => break,
                        Ok(Some(command)) => {
                            if let Err(e) = self.execute(command).await {
                                println!("! {}", e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => println!("! {}", e),
                    }
                }
                Some(event) = events.recv() => {
                    if let Some(text) = render_event(&event) {
                        println!("{}", text);
                    }
                }
            }
        }
        Ok(())
    }

    async fn known_fingerprints(&self) -> Vec<Fingerprint> {
        let mut known: Vec<Fingerprint> = self
            .mesh
            .peers()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|info| info.fingerprint)
            .chain(self.trust.favorites())
            .collect();
        known.sort();
        known.dedup();
        known
    }

    async fn execute(&self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Broadcast(text) => {
                self.mesh
                    .send_message(Recipient::Broadcast, Bytes::from(text))
                    .await?;
            }
            ConsoleCommand::Private { target, text } => {
                let fingerprint = resolve_fingerprint(&target, &self.known_fingerprints().await)?;
                let message_id = self
                    .mesh
                    .send_message(Recipient::Peer(fingerprint), Bytes::from(text))
                    .await?;
                println!("* {} queued for {}", message_id, fingerprint.short());
            }
            ConsoleCommand::Favorite(target) => {
                let fingerprint = resolve_fingerprint(&target, &self.known_fingerprints().await)?;
                self.trust.favorite(fingerprint);
                println!("* {} is now a favorite", fingerprint.short());
            }
            ConsoleCommand::Unfavorite(target) => {
                let fingerprint = resolve_fingerprint(&target, &self.known_fingerprints().await)?;
                self.trust.unfavorite(&fingerprint);
                println!("* {} is no longer a favorite", fingerprint.short());
            }
            ConsoleCommand::Block(target) => {
                let fingerprint = resolve_fingerprint(&target, &self.known_fingerprints().await)?;
                self.trust.block(fingerprint);
                println!("* {} blocked", fingerprint.short());
            }
            ConsoleCommand::Unblock(target) => {
                let fingerprint = resolve_fingerprint(&target, &self.known_fingerprints().await)?;
                self.trust.unblock(&fingerprint);
                println!("* {} unblocked", fingerprint.short());
            }
            ConsoleCommand::Handshake(target) => {
                let peer = PeerId::from_str(&target)?;
                if self.sessions.has_established_session(peer).await {
                    println!("* session with {} already established", peer);
                } else {
                    self.sessions.initiate_handshake(peer).await;
                    println!("* handshake with {} requested", peer);
                }
            }
            ConsoleCommand::Peers => {
                let peers = self.mesh.peers().await?;
                if peers.is_empty() {
                    println!("* nobody in range");
                }
                for info in &peers {
                    println!("{}", render_peer(info));
                }
            }
            ConsoleCommand::WhoAmI => {
                println!(
                    "* peer {} fingerprint {}",
                    self.sessions.my_peer_id(),
                    self.mesh.fingerprint()
                );
            }
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }
}
