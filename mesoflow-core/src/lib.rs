//! Per-entity data storage for particle simulations.
//!
//! A collection (particles, rigid objects, rod bisegments) stores one typed
//! array per named channel. Channels are declared once in a [`ChannelRegistry`]
//! and materialized in a [`DataContainer`]; predicates select which channels a
//! pack operation moves.

pub mod channel;
pub mod container;
pub mod element;
pub mod error;
pub mod fsutil;
pub mod group;
pub mod predicate;
pub mod registry;
pub mod reserved;
pub mod state;

pub use channel::{ChannelData, ChannelDescriptor, ChannelOptions};
pub use container::DataContainer;
pub use element::{ComExtent, Element, ElementType, RigidMotion, Stress};
pub use error::{ChannelError, StateError};
pub use group::{ProcessGroup, SingleProcess, ThreadGroup};
pub use predicate::{AllChannels, ExchangeChannels, NamedChannels, PackPredicate, PersistentChannels};
pub use registry::{ChannelRegistry, EntityKind};
pub use state::{DomainInfo, SimState, STATE_FILE_NAME};

pub use glam;
