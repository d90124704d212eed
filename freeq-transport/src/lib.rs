//! Peer-to-peer messaging transport layered over a room-based chat
//! substrate: per-peer retry queues, asymmetric room creation,
//! presence-derived reachability and signed-identity validation.
//!
//! The room-service wire protocol itself is an external collaborator,
//! described by the [`room_client`] trait — this crate only implements
//! the transport logic built on top of it.

pub mod address;
pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod display_name_cache;
pub mod error;
pub mod inbound;
pub mod message;
pub mod queue;
pub mod retry_queue;
pub mod room_client;
pub mod room_manager;
pub mod transport;
pub mod user_address_manager;

pub use address::{Address, PeerUserId};
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use message::OutboundMessage;
pub use queue::{CanonicalIdentifier, QueueIdentifier};
pub use retry_queue::AppQueueView;
pub use room_client::{Presence, RoomClient, RoomId};
pub use transport::{MessageHandler, Transport};
pub use user_address_manager::AddressReachability;
