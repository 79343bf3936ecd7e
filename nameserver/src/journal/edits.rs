use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NamespaceError, NsResult};
use crate::namespace::{BlockId, RecordOptions};

const SEGMENT_PREFIX: &str = "edits.";
const FRAME_HEADER_LEN: usize = 4;

/// Kinds of durable namespace mutation. Each carries just enough to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemMutation {
    CreateDirectory {
        path: String,
    },
    CreateFile {
        path: String,
        block_size: u64,
        replication_factor: u32,
        record_options: RecordOptions,
    },
    AppendBlock {
        path: String,
        block_id: BlockId,
    },
    CommitBlock {
        path: String,
        block_id: BlockId,
        size: u64,
    },
    /// Drops a pending block that was never written.
    AbandonBlock {
        path: String,
        block_id: BlockId,
    },
    /// Closes a file for writing.
    CommitFile {
        path: String,
    },
    Delete {
        path: String,
        recursive: bool,
    },
    Move {
        from: String,
        to: String,
    },
}

impl FileSystemMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            FileSystemMutation::CreateDirectory { .. } => "create-directory",
            FileSystemMutation::CreateFile { .. } => "create-file",
            FileSystemMutation::AppendBlock { .. } => "append-block",
            FileSystemMutation::CommitBlock { .. } => "commit-block",
            FileSystemMutation::AbandonBlock { .. } => "abandon-block",
            FileSystemMutation::CommitFile { .. } => "commit-file",
            FileSystemMutation::Delete { .. } => "delete",
            FileSystemMutation::Move { .. } => "move",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub timestamp: DateTime<Utc>,
    pub mutation: FileSystemMutation,
}

impl EditRecord {
    pub fn now(mutation: FileSystemMutation) -> Self {
        EditRecord {
            timestamp: Utc::now(),
            mutation,
        }
    }
}

// -----------------------------------------------------------------------------
// Segments
// -----------------------------------------------------------------------------

/// Append-only journal split into numbered segment files.
///
/// Each record is framed as a little-endian u32 length followed by the
/// MessagePack-encoded [`EditRecord`].
#[derive(Debug)]
pub struct EditLog {
    dir: PathBuf,
    segment: u64,
    file: File,
    offset: u64,
    sync: bool,
    /// Set when a failed append could not be cut back off the segment.
    unusable: bool,
}

impl EditLog {
    pub fn segment_path(dir: &Path, segment: u64) -> PathBuf {
        dir.join(format!("{SEGMENT_PREFIX}{segment:010}"))
    }

    /// Segment numbers present in `dir`, ascending.
    pub fn list_segments(dir: &Path) -> NsResult<Vec<u64>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(seq) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            {
                segments.push(seq);
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    /// Starts a brand new segment; fails if it already exists.
    pub fn create(dir: &Path, segment: u64, sync: bool) -> NsResult<Self> {
        let path = Self::segment_path(dir, segment);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        sync_dir(dir)?;
        debug!("started edit segment {}", path.display());
        Ok(EditLog {
            dir: dir.to_path_buf(),
            segment,
            file,
            offset: 0,
            sync,
            unusable: false,
        })
    }

    pub fn current_segment(&self) -> u64 {
        self.segment
    }

    /// Durably appends one record. On failure the segment is cut back to the
    /// last complete record; if even that fails, every later append fails too.
    pub fn append(&mut self, record: &EditRecord) -> NsResult<()> {
        self.ensure_usable()?;
        let payload = rmp_serde::to_vec_named(record)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let written = self.file.write_all(&frame).and_then(|_| {
            if self.sync {
                self.file.sync_data()
            } else {
                self.file.flush()
            }
        });
        if let Err(e) = written {
            if let Err(rewind) = self.rewind() {
                warn!(
                    segment = self.segment,
                    "cannot cut back failed edit ({}), refusing further appends", rewind
                );
                self.unusable = true;
            }
            return Err(e.into());
        }

        self.offset += frame.len() as u64;
        debug!(
            segment = self.segment,
            kind = record.mutation.kind(),
            "logged edit"
        );
        Ok(())
    }

    /// Truncates the segment to the last complete record and moves the write
    /// cursor back there.
    fn rewind(&mut self) -> io::Result<()> {
        self.file.set_len(self.offset)?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    fn ensure_usable(&self) -> NsResult<()> {
        if self.unusable {
            return Err(NamespaceError::EditLogUnusable(Self::segment_path(
                &self.dir,
                self.segment,
            )));
        }
        Ok(())
    }

    /// Switches all further appends to a new segment and returns the number
    /// of the one just finished.
    pub fn roll(&mut self) -> NsResult<u64> {
        self.ensure_usable()?;
        self.file.sync_all()?;
        let finished = self.segment;
        *self = EditLog::create(&self.dir, finished + 1, self.sync)?;
        info!("rolled edit log from segment {} to {}", finished, self.segment);
        Ok(finished)
    }

    pub fn discard(dir: &Path, segment: u64) -> NsResult<()> {
        let path = Self::segment_path(dir, segment);
        fs::remove_file(&path)?;
        debug!("discarded edit segment {}", path.display());
        Ok(())
    }

    /// Reads every complete record of a segment in append order.
    ///
    /// A partial trailing frame is what a crash in the middle of `append`
    /// leaves behind; that write was never acknowledged, so it is dropped and
    /// the file truncated. Anything else that fails to decode is corruption.
    pub fn read_segment(path: &Path) -> NsResult<Vec<EditRecord>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let remaining = bytes.len() - pos;
            if remaining < FRAME_HEADER_LEN {
                break;
            }
            let mut len_bytes = [0u8; FRAME_HEADER_LEN];
            len_bytes.copy_from_slice(&bytes[pos..pos + FRAME_HEADER_LEN]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            if remaining - FRAME_HEADER_LEN < len {
                break;
            }

            let start = pos + FRAME_HEADER_LEN;
            let record: EditRecord = rmp_serde::from_slice(&bytes[start..start + len])
                .map_err(|e| NamespaceError::CorruptEditLog {
                    path: path.to_path_buf(),
                    reason: format!("record {} at offset {}: {}", records.len(), pos, e),
                })?;
            records.push(record);
            pos = start + len;
        }

        if pos < bytes.len() {
            warn!(
                "dropping {} trailing bytes of incomplete edit in {}",
                bytes.len() - pos,
                path.display()
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(pos as u64)?;
        }

        Ok(records)
    }
}

pub(crate) fn sync_dir(dir: &Path) -> NsResult<()> {
    // Directory fsync makes creates and renames durable on unix.
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
