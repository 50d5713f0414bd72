//! Packing per-entity channels into flat buffers, and moving those buffers
//! through transfer queues and between processes.

pub mod error;
pub mod exchange;
pub mod layout;
pub mod packer;
pub mod queue;

pub use error::{ExchangeError, PackError, TransferError};
pub use exchange::{Exchanger, MeshLink, MigrationStats, PeerLink};
pub use layout::{LayoutEntry, PackLayout};
pub use packer::{retain_entities, Packer, UnpackTarget, Unpacker};
pub use queue::{SharedBuffer, SharedContainer, TransferQueue};
