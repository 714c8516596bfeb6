//! Mesh coordinator.
//!
//! Ties the wire codec, Noise sessions, relay routing, identity registry and
//! store-and-forward queue together behind a single actor. Radio adapters and
//! the application talk to it through a [`MeshHandle`]; it talks back through
//! a [`RadioTransport`] and a [`MeshEventHandler`].
//!
//! ## Example
//!
//! ```no_run
//! use mesh_coordinator::{ChannelEventHandler, CoordinatorConfig, MeshCoordinator, RadioTransport};
//! use mesh_identity::{MemoryTrustStore, NodeIdentity};
//! use mesh_storage::MemoryPendingStore;
//! use std::sync::Arc;
//!
//! struct NullRadio;
//! impl RadioTransport for NullRadio {
//!     fn send_frame(&self, _peer: mesh_wire::PeerId, _frame: bytes::Bytes) {}
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (handler, _events) = ChannelEventHandler::channel();
//! let (coordinator, handle) = MeshCoordinator::new(
//!     CoordinatorConfig::default(),
//!     NodeIdentity::generate(),
//!     Arc::new(NullRadio),
//!     Arc::new(handler),
//!     Arc::new(MemoryTrustStore::new()),
//!     Arc::new(MemoryPendingStore::new()),
//! )
//! .await?;
//! tokio::spawn(coordinator.run());
//! handle.announce().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod event;
pub mod handle;
pub mod handler;
pub mod radio;

pub use config::CoordinatorConfig;
pub use coordinator::{MeshCoordinator, MAX_MESSAGE_SIZE};
pub use event::{
    AppCommand, MeshError, MeshEvent, MeshStats, PeerInfo, RadioEvent, Recipient, SendError,
};
pub use handle::{MeshCapability, MeshHandle};
pub use handler::{AppEvent, ChannelEventHandler, MeshEventHandler, ReceivedMessage};
pub use radio::RadioTransport;
