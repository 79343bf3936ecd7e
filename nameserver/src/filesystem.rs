//! The namespace service. Every public operation takes the namespace lock
//! for its whole duration and follows validate → log → mutate.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NameServerConfig;
use crate::error::{NamespaceError, NsResult};
use crate::journal::{EditLog, EditRecord, FileSystemMutation, ImageStore, NamespaceImage};
use crate::lock;
use crate::namespace::{
    BlockId, BlockInfo, DirectoryInfo, EntryInfo, EntryTree, File, FileDeleted, FileInfo,
    Namespace, RecordOptions,
};
use crate::path::NamespacePath;

/// Parameters of a new file.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    pub block_size: u64,
    pub replication_factor: u32,
    #[serde(default)]
    pub record_options: RecordOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CreatedFile {
    pub file: FileInfo,
    pub first_block: Option<BlockInfo>,
}

struct State {
    namespace: Namespace,
    edits: EditLog,
}

impl State {
    /// Durably records `mutation`. Nothing in memory changes until this
    /// returns successfully.
    fn log(&mut self, mutation: FileSystemMutation) -> NsResult<EditRecord> {
        let record = EditRecord::now(mutation);
        self.edits.append(&record)?;
        Ok(record)
    }
}

pub struct FileSystem {
    config: NameServerConfig,
    images: ImageStore,
    state: Mutex<State>,
    deletion_listeners: Mutex<Vec<mpsc::UnboundedSender<FileDeleted>>>,
}

impl FileSystem {
    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Loads the namespace in `config.image_dir`, formatting a new one if the
    /// directory holds no image yet.
    pub fn open(config: NameServerConfig) -> NsResult<Self> {
        let images = ImageStore::new(&config.image_dir);
        images.ensure_no_interrupted_checkpoint()?;
        if images.has_image() {
            Self::load(config)
        } else {
            Self::format(config)
        }
    }

    /// Creates a fresh namespace. The image directory must be empty.
    pub fn format(config: NameServerConfig) -> NsResult<Self> {
        config.validate()?;
        let images = ImageStore::new(&config.image_dir);
        images.prepare_format()?;

        let namespace = Namespace::format(Utc::now());
        images.write_checkpoint(&NamespaceImage::capture(&namespace, 0))?;
        images.promote_checkpoint()?;
        let edits = EditLog::create(images.dir(), 1, config.sync_edits)?;

        info!(
            "formatted namespace {} in {}",
            namespace.namespace_id(),
            images.dir().display()
        );
        Ok(Self::assemble(config, images, namespace, edits))
    }

    /// Verifies and loads the image, then replays the edit log written after it.
    pub fn load(config: NameServerConfig) -> NsResult<Self> {
        config.validate()?;
        let images = ImageStore::new(&config.image_dir);
        images.ensure_no_interrupted_checkpoint()?;

        let rebuilt = rebuild(&images, None)?;
        for segment in &rebuilt.stale_segments {
            warn!(
                "discarding edit segment {} already folded into the image",
                segment
            );
            EditLog::discard(images.dir(), *segment)?;
        }

        let next_segment = rebuilt
            .replayed_segments
            .last()
            .copied()
            .unwrap_or(0)
            .max(rebuilt.folded_segment)
            + 1;
        let edits = EditLog::create(images.dir(), next_segment, config.sync_edits)?;

        info!(
            namespace = %rebuilt.namespace.namespace_id(),
            edits = rebuilt.replayed_records,
            segments = rebuilt.replayed_segments.len(),
            "loaded namespace from {}",
            images.dir().display()
        );
        Ok(Self::assemble(config, images, rebuilt.namespace, edits))
    }

    fn assemble(
        config: NameServerConfig,
        images: ImageStore,
        namespace: Namespace,
        edits: EditLog,
    ) -> Self {
        FileSystem {
            config,
            images,
            state: Mutex::new(State { namespace, edits }),
            deletion_listeners: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub fn config(&self) -> &NameServerConfig {
        &self.config
    }

    pub fn namespace_id(&self) -> Uuid {
        self.state().namespace.namespace_id()
    }

    /// Sum of committed bytes across every file.
    pub fn total_size(&self) -> u64 {
        self.state().namespace.total_size()
    }

    /// Every file removed by a later `delete` is sent to the returned channel.
    pub fn subscribe_deletions(&self) -> mpsc::UnboundedReceiver<FileDeleted> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.deletion_listeners).push(tx);
        rx
    }

    fn notify_deleted(&self, deleted: Vec<FileDeleted>) {
        if deleted.is_empty() {
            return;
        }
        let mut listeners = lock(&self.deletion_listeners);
        listeners.retain(|tx| !tx.is_closed());
        for event in deleted {
            debug!(path = %event.file.path, "file deleted");
            for tx in listeners.iter() {
                let _ = tx.send(event.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn get_entry_info(&self, path: &str) -> NsResult<Option<EntryInfo>> {
        let path = NamespacePath::parse(path)?;
        let state = self.state();
        Ok(state
            .namespace
            .lookup(&path)?
            .and_then(|id| state.namespace.entry_info(id)))
    }

    pub fn get_directory_info(&self, path: &str) -> NsResult<Option<DirectoryInfo>> {
        Ok(match self.get_entry_info(path)? {
            Some(EntryInfo::Directory(d)) => Some(d),
            _ => None,
        })
    }

    pub fn get_file_info(&self, path: &str) -> NsResult<Option<FileInfo>> {
        Ok(match self.get_entry_info(path)? {
            Some(EntryInfo::File(f)) => Some(f),
            _ => None,
        })
    }

    pub fn list_directory(&self, path: &str) -> NsResult<Vec<String>> {
        match self.get_entry_info(path)? {
            Some(EntryInfo::Directory(d)) => Ok(d.children),
            Some(EntryInfo::File(_)) => Err(NamespaceError::NotADirectory(path.to_string())),
            None => Err(NamespaceError::NotFound(path.to_string())),
        }
    }

    /// Every committed block and every pending block, with owning file.
    pub fn get_blocks(&self, blocks: &mut Vec<BlockInfo>, pending_blocks: &mut Vec<BlockInfo>) {
        self.state()
            .namespace
            .collect_blocks(blocks, pending_blocks);
    }

    // -------------------------------------------------------------------------
    // Directories
    // -------------------------------------------------------------------------

    /// Returns the directory at `path`, creating it and any missing parents.
    pub fn create_directory(&self, path: &str) -> NsResult<DirectoryInfo> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();

        let mut current = NamespacePath::root();
        let mut id = EntryTree::ROOT;
        for name in path.components() {
            current = current.join(name);
            id = match state.namespace.lookup(&current)? {
                Some(existing) => existing,
                None => {
                    let plan = state.namespace.plan_create(&current)?;
                    let record = state.log(FileSystemMutation::CreateDirectory {
                        path: current.to_string(),
                    })?;
                    debug!(path = %current, "created directory");
                    state
                        .namespace
                        .commit_create_directory(plan, record.timestamp)
                }
            };
        }

        state
            .namespace
            .directory_info(id)
            .ok_or_else(|| NamespaceError::AlreadyExists(path.to_string()))
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    /// Creates a file open for writing, optionally allocating its first block.
    ///
    /// If the first block cannot be allocated the file is closed and deleted
    /// again before the error is returned.
    pub fn create_file(
        &self,
        path: &str,
        options: FileOptions,
        append_block: bool,
        available_servers: usize,
    ) -> NsResult<CreatedFile> {
        let path = NamespacePath::parse(path)?;
        self.validate_file_options(&options)?;

        let mut state = self.state();
        let plan = state.namespace.plan_create(&path)?;
        let record = state.log(FileSystemMutation::CreateFile {
            path: path.to_string(),
            block_size: options.block_size,
            replication_factor: options.replication_factor,
            record_options: options.record_options,
        })?;
        let id = state.namespace.commit_create_file(
            plan,
            record.timestamp,
            File::new(
                options.block_size,
                options.replication_factor,
                options.record_options,
            ),
        );
        debug!(path = %path, "created file");

        let first_block = if append_block {
            match Self::append_block_locked(&mut state, &path, None, available_servers) {
                Ok(block) => Some(block),
                Err(e) => {
                    let deleted = Self::abandon_file(&mut state, &path);
                    drop(state);
                    self.notify_deleted(deleted);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let file = state
            .namespace
            .file_info(id)
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        Ok(CreatedFile { file, first_block })
    }

    fn validate_file_options(&self, options: &FileOptions) -> NsResult<()> {
        let unit = self.config.storage_unit_size;
        if options.block_size == 0 || options.block_size % unit != 0 {
            return Err(NamespaceError::InvalidArgument(format!(
                "block size {} must be a positive multiple of {}",
                options.block_size, unit
            )));
        }
        if options.replication_factor == 0 {
            return Err(NamespaceError::InvalidArgument(
                "replication factor must be at least 1".into(),
            ));
        }
        Ok(())
    }

    // Best effort: the create already succeeded and was logged, so undo it
    // through the log as well.
    fn abandon_file(state: &mut State, path: &NamespacePath) -> Vec<FileDeleted> {
        if let Ok(id) = state.namespace.plan_close(path) {
            if state
                .log(FileSystemMutation::CommitFile {
                    path: path.to_string(),
                })
                .is_ok()
            {
                state.namespace.commit_close(id);
            }
        }
        match state.namespace.plan_delete(path, false) {
            Ok(Some(id)) => match state.log(FileSystemMutation::Delete {
                path: path.to_string(),
                recursive: false,
            }) {
                Ok(_) => state.namespace.commit_delete(id),
                Err(e) => {
                    warn!(path = %path, "could not remove abandoned file: {}", e);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        }
    }

    /// Allocates a new pending block for an open file. `block_id` is chosen
    /// here unless the caller supplies one.
    pub fn append_block(
        &self,
        path: &str,
        block_id: Option<BlockId>,
        available_servers: usize,
    ) -> NsResult<BlockInfo> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();
        Self::append_block_locked(&mut state, &path, block_id, available_servers)
    }

    fn append_block_locked(
        state: &mut State,
        path: &NamespacePath,
        block_id: Option<BlockId>,
        available_servers: usize,
    ) -> NsResult<BlockInfo> {
        let plan = state.namespace.plan_append_block(path)?;
        let replication_factor = state
            .namespace
            .lookup(path)?
            .and_then(|id| state.namespace.tree().file(id))
            .map(|f| f.replication_factor)
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        if available_servers < replication_factor as usize {
            return Err(NamespaceError::InsufficientServers {
                required: replication_factor as usize,
                available: available_servers,
            });
        }

        let block_id = block_id.unwrap_or_else(BlockId::generate);
        state.log(FileSystemMutation::AppendBlock {
            path: path.to_string(),
            block_id,
        })?;
        state.namespace.commit_append_block(plan, block_id);
        debug!(path = %path, block = %block_id, "appended block");

        Ok(BlockInfo {
            block_id,
            file: path.to_string(),
            replication_factor,
        })
    }

    /// Moves the pending block into the file's block list and grows the file.
    pub fn commit_block(&self, path: &str, block_id: BlockId, size: u64) -> NsResult<()> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();
        let id = state.namespace.plan_commit_block(&path, block_id, size)?;
        state.log(FileSystemMutation::CommitBlock {
            path: path.to_string(),
            block_id,
            size,
        })?;
        state.namespace.commit_commit_block(id, block_id, size);
        debug!(path = %path, block = %block_id, size, "committed block");
        Ok(())
    }

    /// Drops a pending block that no data server will receive.
    pub fn abandon_block(&self, path: &str, block_id: BlockId) -> NsResult<()> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();
        let id = state.namespace.plan_abandon_block(&path, block_id)?;
        state.log(FileSystemMutation::AbandonBlock {
            path: path.to_string(),
            block_id,
        })?;
        state.namespace.commit_abandon_block(id);
        debug!(path = %path, block = %block_id, "abandoned block");
        Ok(())
    }

    /// Closes the file for writing and hands back a block still in flight.
    pub fn close_file(&self, path: &str) -> NsResult<Option<BlockId>> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();
        let id = state.namespace.plan_close(&path)?;
        state.log(FileSystemMutation::CommitFile {
            path: path.to_string(),
        })?;
        let pending = state.namespace.commit_close(id);
        debug!(path = %path, pending = ?pending, "closed file");
        Ok(pending)
    }

    // -------------------------------------------------------------------------
    // Delete / move
    // -------------------------------------------------------------------------

    /// Returns false if nothing exists at `path`.
    pub fn delete(&self, path: &str, recursive: bool) -> NsResult<bool> {
        let path = NamespacePath::parse(path)?;
        let mut state = self.state();
        let Some(id) = state.namespace.plan_delete(&path, recursive)? else {
            return Ok(false);
        };
        state.log(FileSystemMutation::Delete {
            path: path.to_string(),
            recursive,
        })?;
        let deleted = state.namespace.commit_delete(id);
        drop(state);

        debug!(path = %path, files = deleted.len(), "deleted");
        self.notify_deleted(deleted);
        Ok(true)
    }

    /// Moves `from` into `to` if `to` is a directory, otherwise to `to` itself.
    pub fn move_entry(&self, from: &str, to: &str) -> NsResult<()> {
        let from = NamespacePath::parse(from)?;
        let to = NamespacePath::parse(to)?;
        let mut state = self.state();
        let plan = state.namespace.plan_move(&from, &to)?;
        state.log(FileSystemMutation::Move {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        state.namespace.commit_move(plan);
        debug!(from = %from, to = %to, "moved");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Checkpoint
    // -------------------------------------------------------------------------

    /// Folds the current image and every finished edit segment into a new
    /// image, then drops those segments.
    pub fn save_to_image(&self) -> NsResult<()> {
        let mut state = self.state();
        self.images.ensure_no_interrupted_checkpoint()?;

        let finished = state.edits.roll()?;
        let snapshot = rebuild(&self.images, Some(finished))?;
        let image = NamespaceImage::capture(&snapshot.namespace, finished);
        self.images.write_checkpoint(&image)?;
        self.images.promote_checkpoint()?;

        for segment in snapshot
            .replayed_segments
            .iter()
            .chain(snapshot.stale_segments.iter())
        {
            EditLog::discard(self.images.dir(), *segment)?;
        }

        info!(
            folded_segment = finished,
            edits = snapshot.replayed_records,
            "checkpoint complete"
        );
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Replay
// -----------------------------------------------------------------------------

struct Rebuilt {
    namespace: Namespace,
    folded_segment: u64,
    replayed_segments: Vec<u64>,
    replayed_records: usize,
    /// Segments at or below the image's folded segment.
    stale_segments: Vec<u64>,
}

/// Image plus edit segments newer than it (up to `up_to`, inclusive), as a
/// standalone namespace.
fn rebuild(images: &ImageStore, up_to: Option<u64>) -> NsResult<Rebuilt> {
    let image = images.read()?;
    let folded_segment = image.folded_segment;
    let mut namespace = image.restore(&images.image_path())?;

    let mut rebuilt_segments = Vec::new();
    let mut stale_segments = Vec::new();
    let mut replayed_records = 0;
    for segment in EditLog::list_segments(images.dir())? {
        if segment <= folded_segment {
            stale_segments.push(segment);
            continue;
        }
        if up_to.is_some_and(|limit| segment > limit) {
            continue;
        }

        let path = EditLog::segment_path(images.dir(), segment);
        for record in EditLog::read_segment(&path)? {
            namespace
                .apply(&record)
                .map_err(|e| NamespaceError::CorruptEditLog {
                    path: path.clone(),
                    reason: format!("cannot replay {}: {}", record.mutation.kind(), e),
                })?;
            replayed_records += 1;
        }
        rebuilt_segments.push(segment);
    }

    Ok(Rebuilt {
        namespace,
        folded_segment,
        replayed_segments: rebuilt_segments,
        replayed_records,
        stale_segments,
    })
}
