use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::error::{NamespaceError, NsResult};
use crate::journal::edits::sync_dir;
use crate::namespace::{BlockId, EntryImage, EntryTree, Namespace};

/// Bumped whenever the serialized layout changes. Loading requires an exact match.
pub const IMAGE_VERSION: u32 = 1;

const MAGIC: &[u8; 4] = b"JNFS";
const HEADER_LEN: usize = 8;

pub const IMAGE_FILE: &str = "fsimage";
pub const CHECKPOINT_FILE: &str = "fsimage.ckpt";
const CHECKSUM_SUFFIX: &str = ".sha256";

// -----------------------------------------------------------------------------
// Image contents
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFileImage {
    pub path: String,
    pub pending_block: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceImage {
    pub namespace_id: Uuid,
    /// Highest edit segment whose records are already reflected here.
    pub folded_segment: u64,
    /// The entry tree in pre-order, root first.
    pub entries: Vec<EntryImage>,
    pub pending_files: Vec<PendingFileImage>,
}

impl NamespaceImage {
    pub fn capture(namespace: &Namespace, folded_segment: u64) -> Self {
        NamespaceImage {
            namespace_id: namespace.namespace_id(),
            folded_segment,
            entries: namespace.tree().save(),
            pending_files: namespace
                .pending_files()
                .into_iter()
                .map(|(path, pending_block)| PendingFileImage {
                    path,
                    pending_block,
                })
                .collect(),
        }
    }

    pub fn restore(self, source: &Path) -> NsResult<Namespace> {
        let corrupt = |reason: String| NamespaceError::CorruptImage {
            path: source.to_path_buf(),
            reason,
        };
        let tree = EntryTree::load(self.entries).map_err(corrupt)?;
        Namespace::from_parts(
            self.namespace_id,
            tree,
            self.pending_files
                .into_iter()
                .map(|p| (p.path, p.pending_block))
                .collect(),
        )
        .map_err(corrupt)
    }

    pub fn encode(&self) -> NsResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        buf.extend_from_slice(&rmp_serde::to_vec_named(self)?);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], source: &Path) -> NsResult<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(NamespaceError::CorruptImage {
                path: source.to_path_buf(),
                reason: "missing image header".into(),
            });
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let found = u32::from_le_bytes(version);
        if found != IMAGE_VERSION {
            return Err(NamespaceError::VersionMismatch {
                expected: IMAGE_VERSION,
                found,
            });
        }
        Ok(rmp_serde::from_slice(&bytes[HEADER_LEN..])?)
    }
}

pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

// -----------------------------------------------------------------------------
// On-disk layout
// -----------------------------------------------------------------------------

/// The image directory: the current image, its checksum side-file, and the
/// temporary pair written during a checkpoint.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ImageStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn checksum_path(image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(CHECKSUM_SUFFIX);
        PathBuf::from(name)
    }

    pub fn has_image(&self) -> bool {
        self.image_path().exists()
    }

    /// A leftover temporary image means a checkpoint died half way. No
    /// automatic recovery is attempted, whether or not the file is intact.
    pub fn ensure_no_interrupted_checkpoint(&self) -> NsResult<()> {
        let ckpt = self.checkpoint_path();
        if ckpt.exists() {
            return Err(NamespaceError::InterruptedCheckpoint(ckpt));
        }
        Ok(())
    }

    /// Creates the directory if needed and insists it is empty.
    pub fn prepare_format(&self) -> NsResult<()> {
        fs::create_dir_all(&self.dir)?;
        if fs::read_dir(&self.dir)?.next().is_some() {
            return Err(NamespaceError::ImageDirNotEmpty(self.dir.clone()));
        }
        Ok(())
    }

    /// Verifies the checksum side-file, then decodes the image.
    pub fn read(&self) -> NsResult<NamespaceImage> {
        let path = self.image_path();
        let bytes = fs::read(&path)?;
        let expected = fs::read_to_string(Self::checksum_path(&path)).map_err(|e| {
            NamespaceError::CorruptImage {
                path: path.clone(),
                reason: format!("cannot read checksum file: {e}"),
            }
        })?;
        if expected.trim() != checksum_hex(&bytes) {
            return Err(NamespaceError::ChecksumMismatch(path));
        }
        NamespaceImage::decode(&bytes, &path)
    }

    /// Writes the temporary image and its checksum, both fsynced.
    pub fn write_checkpoint(&self, image: &NamespaceImage) -> NsResult<()> {
        let bytes = image.encode()?;
        let ckpt = self.checkpoint_path();
        write_synced(&ckpt, &bytes)?;
        write_synced(&Self::checksum_path(&ckpt), checksum_hex(&bytes).as_bytes())?;
        sync_dir(&self.dir)
    }

    /// Replaces the current image with the temporary one.
    ///
    /// The checksum is renamed before the image so that a crash at any point
    /// leaves the temporary image behind and is caught on the next start.
    pub fn promote_checkpoint(&self) -> NsResult<()> {
        let image = self.image_path();
        let ckpt = self.checkpoint_path();

        remove_if_exists(&Self::checksum_path(&image))?;
        remove_if_exists(&image)?;
        fs::rename(Self::checksum_path(&ckpt), Self::checksum_path(&image))?;
        fs::rename(&ckpt, &image)?;
        sync_dir(&self.dir)?;

        info!("promoted checkpoint to {}", image.display());
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> NsResult<()> {
    use std::io::Write;
    let mut f = fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> NsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
