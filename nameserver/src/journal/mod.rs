//! Durability: the append-only edit log and the checkpoint image.

pub mod edits;
pub mod image;

pub use edits::{EditLog, EditRecord, FileSystemMutation};
pub use image::{ImageStore, NamespaceImage, PendingFileImage, IMAGE_VERSION};
