use std::path::PathBuf;

use crate::namespace::BlockId;

/// Coarse classification used by callers to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad path syntax, out-of-range sizes. Never worth retrying.
    Malformed,
    /// The request conflicts with the current namespace state.
    Conflict,
    /// Image or edit log is unreadable, corrupted or mid-checkpoint.
    Durability,
    /// Not enough storage servers to satisfy the request right now.
    Resources,
}

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("file is not open for writing: {0}")]
    NotOpenForWriting(String),

    #[error("file {path} already has pending block {block_id}")]
    PendingBlockExists { path: String, block_id: BlockId },

    #[error("file {path} has no pending block {block_id}")]
    NoMatchingPendingBlock { path: String, block_id: BlockId },

    #[error("last block of {path} is incomplete ({size} bytes, block size {block_size})")]
    LastBlockIncomplete {
        path: String,
        size: u64,
        block_size: u64,
    },

    #[error("cannot move {from} to {to}: {reason}")]
    InvalidMove {
        from: String,
        to: String,
        reason: &'static str,
    },

    #[error("need {required} storage servers, only {available} available")]
    InsufficientServers { required: usize, available: usize },

    #[error("image format version {found} does not match expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(PathBuf),

    #[error("interrupted checkpoint detected ({0} exists); manual recovery required")]
    InterruptedCheckpoint(PathBuf),

    #[error("image directory {0} is not empty; refusing to format")]
    ImageDirNotEmpty(PathBuf),

    #[error("corrupted image {path}: {reason}")]
    CorruptImage { path: PathBuf, reason: String },

    #[error("corrupted edit log {path}: {reason}")]
    CorruptEditLog { path: PathBuf, reason: String },

    #[error("edit log {0} could not be repaired after a failed append; restart required")]
    EditLogUnusable(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl NamespaceError {
    pub fn kind(&self) -> ErrorKind {
        use NamespaceError::*;
        match self {
            InvalidPath { .. } | InvalidArgument(_) => ErrorKind::Malformed,
            AlreadyExists(_)
            | NotFound(_)
            | NotADirectory(_)
            | NotAFile(_)
            | DirectoryNotEmpty(_)
            | NotOpenForWriting(_)
            | PendingBlockExists { .. }
            | NoMatchingPendingBlock { .. }
            | LastBlockIncomplete { .. }
            | InvalidMove { .. } => ErrorKind::Conflict,
            InsufficientServers { .. } => ErrorKind::Resources,
            VersionMismatch { .. }
            | ChecksumMismatch(_)
            | InterruptedCheckpoint(_)
            | ImageDirNotEmpty(_)
            | CorruptImage { .. }
            | CorruptEditLog { .. }
            | EditLogUnusable(_)
            | Io(_)
            | Encode(_)
            | Decode(_) => ErrorKind::Durability,
        }
    }

    pub(crate) fn invalid_path(path: &str, reason: &'static str) -> Self {
        NamespaceError::InvalidPath {
            path: path.to_string(),
            reason,
        }
    }
}

pub type NsResult<T> = Result<T, NamespaceError>;
