use mesoflow_core::StateError;
use mesoflow_transport::{PackError, TransferError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed descriptor {path:?}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path:?} is not a supported dump (format '{format}', version {version})")]
    UnsupportedFormat {
        path: PathBuf,
        format: String,
        version: u32,
    },

    #[error("channel layout of '{collection}' differs from the dump: {detail}")]
    LayoutMismatch { collection: String, detail: String },

    #[error("dump of '{collection}' has {found} shards but {expected} ranks are running")]
    ShardMismatch {
        collection: String,
        expected: usize,
        found: usize,
    },

    #[error("dump '{stem}' is incomplete, ranks {ranks:?} failed")]
    IncompleteDump { stem: String, ranks: Vec<usize> },

    #[error("checkpoint {id} is incomplete, ranks {ranks:?} failed")]
    PartialCheckpoint { id: u64, ranks: Vec<usize> },

    #[error("cannot restart from {path:?}: {reason}")]
    RestoreFileMissingOrCorrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a run must stop rather than continue without this checkpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RestoreFileMissingOrCorrupt { .. }
                | Self::LayoutMismatch { .. }
                | Self::ShardMismatch { .. }
                | Self::Pack(_)
        )
    }
}
