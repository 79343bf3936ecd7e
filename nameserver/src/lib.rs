//! junkNAS name server: the namespace of a block-based distributed file
//! system, its edit log and checkpoint image, and replica placement.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod data_server;
pub mod error;
pub mod filesystem;
pub mod journal;
pub mod namespace;
pub mod path;
pub mod placement;

pub use config::NameServerConfig;
pub use data_server::{DataServerInfo, DiskMetrics, HeartbeatCommand};
pub use error::{ErrorKind, NamespaceError, NsResult};
pub use filesystem::{CreatedFile, FileOptions, FileSystem};
pub use namespace::{
    BlockId, BlockInfo, DirectoryInfo, EntryInfo, FileDeleted, FileInfo, RecordOptions,
};
pub use path::NamespacePath;
pub use placement::{BlockAssignment, ReplicaPlacement};

/// Every mutation under these locks is infallible once started, so a
/// poisoned lock still guards consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
