use mesoflow_core::ChannelError;
use thiserror::Error;

/// Pack and unpack failures.
///
/// All of these mean the two sides of a transfer disagree about the data they
/// move. Continuing would silently corrupt entities, so callers treat them as
/// fatal for the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("packed data holds {available} bytes, {needed} needed")]
    SizeMismatch { needed: usize, available: usize },

    #[error("entity index {index} out of bounds for {len} entities")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("{count} entities to unpack into {targets} target slots")]
    TargetCountMismatch { count: usize, targets: usize },

    #[error("layout is stale for collection '{collection}': channel '{channel}' missing or retyped")]
    StaleLayout { collection: String, channel: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors reported by [`crate::TransferQueue::synchronize`].
#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("shared {0} lock poisoned by a panicking job")]
    Poisoned(&'static str),

    #[error("transfer queue worker is gone")]
    Disconnected,
}

/// Errors from exchanging entities with a peer process.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("invalid frame header: {0}")]
    Header(#[from] bincode::Error),

    #[error("link to rank {peer} failed: {reason}")]
    Link { peer: usize, reason: String },
}
