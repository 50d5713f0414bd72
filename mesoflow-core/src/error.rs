use std::path::PathBuf;
use thiserror::Error;

use crate::element::ElementType;
use crate::registry::EntityKind;

/// Channel registration and lookup errors. These indicate a setup bug and are
/// never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel '{name}' already exists in collection '{collection}' (reserved: {reserved})")]
    DuplicateChannel {
        name: String,
        collection: String,
        reserved: bool,
    },

    #[error("no channel '{name}' in collection '{collection}'")]
    UnknownChannel { name: String, collection: String },

    #[error("channel '{name}' holds {actual}, requested as {expected}")]
    TypeMismatch {
        name: String,
        expected: ElementType,
        actual: ElementType,
    },

    #[error("'{name}' is not a reserved channel name")]
    NotReserved { name: String },

    #[error("reserved channel '{name}' does not apply to {kind:?} collections")]
    ReservedForOtherKind { name: String, kind: EntityKind },
}

/// Errors from persisting or restoring the global simulation state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to write simulation state to {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot restore simulation state from {path:?}: {reason}")]
    RestoreFileMissingOrCorrupt { path: PathBuf, reason: String },
}
