//! Checkpoint/restart and analysis dumps of simulation state and entity collections.

pub mod dump;
pub mod error;
pub mod manager;

pub use dump::{
    dump_collection, export_collections, load_collection, read_descriptor, write_descriptor, ChannelRecord,
    Descriptor, Shard, Topology,
};
pub use error::{CheckpointError, Result};
pub use manager::{CheckpointIdAdvanceMode, CheckpointManager, CheckpointPolicy, LATEST_FILE_NAME};
