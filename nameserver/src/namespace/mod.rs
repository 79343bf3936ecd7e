//! In-memory namespace: the entry tree, the table of files open for writing,
//! and the aggregate size counter.
//!
//! Every mutation is split into a read-only `plan_*` step that performs all
//! validation and an infallible `commit_*` step. The orchestrator logs the
//! edit between the two; replay runs both back to back through [`Namespace::apply`].

pub mod entry;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NamespaceError, NsResult};
use crate::journal::{EditRecord, FileSystemMutation};
use crate::path::NamespacePath;

pub use entry::{
    BlockId, Directory, Entry, EntryId, EntryImage, EntryKind, EntryKindImage, EntryTree, File,
    RecordOptions,
};

// -----------------------------------------------------------------------------
// Public snapshots
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub date_created: DateTime<Utc>,
    pub size: u64,
    pub block_size: u64,
    pub replication_factor: u32,
    pub record_options: RecordOptions,
    pub open_for_writing: bool,
    pub blocks: Vec<BlockId>,
    pub pending_block: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub path: String,
    pub date_created: DateTime<Utc>,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryInfo {
    Directory(DirectoryInfo),
    File(FileInfo),
}

/// A file currently open for writing, plus its allocated-but-uncommitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFile {
    pub file: EntryId,
    pub pending_block: Option<BlockId>,
}

/// A block together with the file that owns it. Holders are tracked by the
/// storage servers, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub file: String,
    pub replication_factor: u32,
}

/// Raised once per file removed by a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeleted {
    pub file: FileInfo,
    pub pending_block: Option<BlockId>,
}

// -----------------------------------------------------------------------------
// Plans
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreatePlan {
    parent: EntryId,
    name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AppendPlan {
    file: EntryId,
    padding: u64,
}

#[derive(Debug, Clone)]
pub struct MovePlan {
    entry: EntryId,
    new_parent: EntryId,
    new_name: Option<String>,
}

// -----------------------------------------------------------------------------
// Namespace
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Namespace {
    namespace_id: Uuid,
    tree: EntryTree,
    pending: HashMap<EntryId, PendingFile>,
    total_size: u64,
}

impl Namespace {
    /// A freshly formatted namespace: one empty root directory.
    pub fn format(created: DateTime<Utc>) -> Self {
        Namespace {
            namespace_id: Uuid::new_v4(),
            tree: EntryTree::new(created),
            pending: HashMap::new(),
            total_size: 0,
        }
    }

    /// Reassembles a namespace from its persisted parts. Pending files are
    /// given by path; the aggregate size is recomputed from the tree.
    pub fn from_parts(
        namespace_id: Uuid,
        tree: EntryTree,
        pending_files: Vec<(String, Option<BlockId>)>,
    ) -> Result<Self, String> {
        let mut total_size = 0;
        tree.walk(|_, _, entry| {
            if let Some(f) = entry.as_file() {
                total_size += f.size;
            }
        });

        let mut pending = HashMap::new();
        for (path, pending_block) in pending_files {
            let parsed = NamespacePath::parse(&path).map_err(|e| e.to_string())?;
            let id = tree
                .resolve(&parsed)
                .map_err(|e| e.to_string())?
                .filter(|id| tree.file(*id).is_some())
                .ok_or_else(|| format!("pending file {path} is not a file in the tree"))?;
            pending.insert(
                id,
                PendingFile {
                    file: id,
                    pending_block,
                },
            );
        }

        Ok(Namespace {
            namespace_id,
            tree,
            pending,
            total_size,
        })
    }

    pub fn namespace_id(&self) -> Uuid {
        self.namespace_id
    }

    pub fn tree(&self) -> &EntryTree {
        &self.tree
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Pending files as `(path, pending block)`, sorted by path.
    pub fn pending_files(&self) -> Vec<(String, Option<BlockId>)> {
        let mut out: Vec<_> = self
            .pending
            .values()
            .map(|p| (self.tree.full_path(p.file).to_string(), p.pending_block))
            .collect();
        out.sort();
        out
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn lookup(&self, path: &NamespacePath) -> NsResult<Option<EntryId>> {
        self.tree.resolve(path)
    }

    pub fn entry_info(&self, id: EntryId) -> Option<EntryInfo> {
        let entry = self.tree.get(id)?;
        let path = self.tree.full_path(id).to_string();
        Some(match &entry.kind {
            EntryKind::Directory(dir) => EntryInfo::Directory(DirectoryInfo {
                path,
                date_created: entry.date_created,
                children: dir.children.keys().cloned().collect(),
            }),
            EntryKind::File(f) => EntryInfo::File(FileInfo {
                path,
                date_created: entry.date_created,
                size: f.size,
                block_size: f.block_size,
                replication_factor: f.replication_factor,
                record_options: f.record_options,
                open_for_writing: f.open_for_writing,
                blocks: f.blocks.clone(),
                pending_block: self.pending.get(&id).and_then(|p| p.pending_block),
            }),
        })
    }

    pub fn file_info(&self, id: EntryId) -> Option<FileInfo> {
        match self.entry_info(id)? {
            EntryInfo::File(f) => Some(f),
            EntryInfo::Directory(_) => None,
        }
    }

    pub fn directory_info(&self, id: EntryId) -> Option<DirectoryInfo> {
        match self.entry_info(id)? {
            EntryInfo::Directory(d) => Some(d),
            EntryInfo::File(_) => None,
        }
    }

    /// Every committed block and every pending block, each with its file.
    pub fn collect_blocks(&self, blocks: &mut Vec<BlockInfo>, pending_blocks: &mut Vec<BlockInfo>) {
        self.tree.walk(|id, path, entry| {
            let Some(f) = entry.as_file() else { return };
            let file = path.to_string();
            blocks.extend(f.blocks.iter().map(|b| BlockInfo {
                block_id: *b,
                file: file.clone(),
                replication_factor: f.replication_factor,
            }));
            if let Some(block_id) = self.pending.get(&id).and_then(|p| p.pending_block) {
                pending_blocks.push(BlockInfo {
                    block_id,
                    file,
                    replication_factor: f.replication_factor,
                });
            }
        });
    }

    fn resolve_file(&self, path: &NamespacePath) -> NsResult<EntryId> {
        let id = self
            .tree
            .resolve(path)?
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        if self.tree.file(id).is_none() {
            return Err(NamespaceError::NotAFile(path.to_string()));
        }
        Ok(id)
    }

    fn resolve_directory(&self, path: &NamespacePath) -> NsResult<EntryId> {
        let id = self
            .tree
            .resolve(path)?
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        if !self.tree.get(id).is_some_and(Entry::is_directory) {
            return Err(NamespaceError::NotADirectory(path.to_string()));
        }
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    pub fn plan_create(&self, path: &NamespacePath) -> NsResult<CreatePlan> {
        let (Some(parent_path), Some(name)) = (path.parent(), path.name()) else {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        };
        let parent = self.resolve_directory(&parent_path)?;
        if self.tree.child(parent, name).is_some() {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        }
        Ok(CreatePlan {
            parent,
            name: name.to_string(),
        })
    }

    pub fn commit_create_directory(&mut self, plan: CreatePlan, created: DateTime<Utc>) -> EntryId {
        self.tree.insert(
            plan.parent,
            &plan.name,
            created,
            EntryKind::Directory(Directory::default()),
        )
    }

    pub fn commit_create_file(
        &mut self,
        plan: CreatePlan,
        created: DateTime<Utc>,
        file: File,
    ) -> EntryId {
        let id = self
            .tree
            .insert(plan.parent, &plan.name, created, EntryKind::File(file));
        self.pending.insert(
            id,
            PendingFile {
                file: id,
                pending_block: None,
            },
        );
        id
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    pub fn plan_append_block(&self, path: &NamespacePath) -> NsResult<AppendPlan> {
        let id = self.resolve_file(path)?;
        let pending = self
            .pending
            .get(&id)
            .filter(|_| self.tree.file(id).is_some_and(|f| f.open_for_writing))
            .ok_or_else(|| NamespaceError::NotOpenForWriting(path.to_string()))?;
        if let Some(block_id) = pending.pending_block {
            return Err(NamespaceError::PendingBlockExists {
                path: path.to_string(),
                block_id,
            });
        }

        let file = self.tree.file(id).ok_or_else(|| NamespaceError::NotAFile(path.to_string()))?;
        let shortfall = file.last_block_shortfall();
        if shortfall > 0
            && !file
                .record_options
                .contains(RecordOptions::RECORDS_ALIGNED_TO_BLOCKS)
        {
            return Err(NamespaceError::LastBlockIncomplete {
                path: path.to_string(),
                size: file.size,
                block_size: file.block_size,
            });
        }

        Ok(AppendPlan {
            file: id,
            padding: shortfall,
        })
    }

    pub fn commit_append_block(&mut self, plan: AppendPlan, block_id: BlockId) {
        if let Some(f) = self.tree.file_mut(plan.file) {
            f.size += plan.padding;
        }
        self.total_size += plan.padding;
        if let Some(p) = self.pending.get_mut(&plan.file) {
            p.pending_block = Some(block_id);
        }
    }

    pub fn plan_commit_block(
        &self,
        path: &NamespacePath,
        block_id: BlockId,
        size: u64,
    ) -> NsResult<EntryId> {
        let id = self.resolve_file(path)?;
        if self.pending.get(&id).and_then(|p| p.pending_block) != Some(block_id) {
            return Err(NamespaceError::NoMatchingPendingBlock {
                path: path.to_string(),
                block_id,
            });
        }
        let block_size = self.tree.file(id).map(|f| f.block_size).unwrap_or(0);
        if size > block_size {
            return Err(NamespaceError::InvalidArgument(format!(
                "committed size {size} exceeds block size {block_size}"
            )));
        }
        Ok(id)
    }

    pub fn commit_commit_block(&mut self, id: EntryId, block_id: BlockId, size: u64) {
        let still_open = match self.tree.file_mut(id) {
            Some(f) => {
                f.blocks.push(block_id);
                f.size += size;
                f.open_for_writing
            }
            None => return,
        };
        self.total_size += size;
        if still_open {
            if let Some(p) = self.pending.get_mut(&id) {
                p.pending_block = None;
            }
        } else {
            self.pending.remove(&id);
        }
    }

    /// Checks that `block_id` is the file's pending block so it can be dropped.
    pub fn plan_abandon_block(&self, path: &NamespacePath, block_id: BlockId) -> NsResult<EntryId> {
        let id = self.resolve_file(path)?;
        if self.pending.get(&id).and_then(|p| p.pending_block) != Some(block_id) {
            return Err(NamespaceError::NoMatchingPendingBlock {
                path: path.to_string(),
                block_id,
            });
        }
        Ok(id)
    }

    /// Forgets the pending block. Padding added when it was allocated stays,
    /// since it completed the block before it.
    pub fn commit_abandon_block(&mut self, id: EntryId) {
        if self.tree.file(id).is_some_and(|f| f.open_for_writing) {
            if let Some(p) = self.pending.get_mut(&id) {
                p.pending_block = None;
            }
        } else {
            self.pending.remove(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    pub fn plan_close(&self, path: &NamespacePath) -> NsResult<EntryId> {
        let id = self.resolve_file(path)?;
        if !self.tree.file(id).is_some_and(|f| f.open_for_writing) {
            return Err(NamespaceError::NotOpenForWriting(path.to_string()));
        }
        Ok(id)
    }

    /// Marks the file closed and returns its still-pending block, if any.
    ///
    /// A file closed with a block in flight stays in the pending table until
    /// that block is committed.
    pub fn commit_close(&mut self, id: EntryId) -> Option<BlockId> {
        if let Some(f) = self.tree.file_mut(id) {
            f.open_for_writing = false;
        }
        let pending_block = self.pending.get(&id).and_then(|p| p.pending_block);
        if pending_block.is_none() {
            self.pending.remove(&id);
        }
        pending_block
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// `Ok(None)` when nothing exists at `path`.
    pub fn plan_delete(&self, path: &NamespacePath, recursive: bool) -> NsResult<Option<EntryId>> {
        let Some(id) = self.tree.resolve(path)? else {
            return Ok(None);
        };
        if id == EntryTree::ROOT {
            return Err(NamespaceError::InvalidArgument(
                "the root directory cannot be deleted".into(),
            ));
        }
        if let Some(dir) = self.tree.get(id).and_then(Entry::as_directory) {
            if !dir.children.is_empty() && !recursive {
                return Err(NamespaceError::DirectoryNotEmpty(path.to_string()));
            }
        }
        Ok(Some(id))
    }

    pub fn commit_delete(&mut self, id: EntryId) -> Vec<FileDeleted> {
        let removed = self.tree.remove_subtree(id);
        let mut deleted = Vec::with_capacity(removed.len());
        for (file_id, path, entry) in removed {
            let EntryKind::File(f) = entry.kind else { continue };
            let pending_block = self.pending.remove(&file_id).and_then(|p| p.pending_block);
            self.total_size -= f.size;
            deleted.push(FileDeleted {
                file: FileInfo {
                    path: path.to_string(),
                    date_created: entry.date_created,
                    size: f.size,
                    block_size: f.block_size,
                    replication_factor: f.replication_factor,
                    record_options: f.record_options,
                    open_for_writing: f.open_for_writing,
                    blocks: f.blocks,
                    pending_block,
                },
                pending_block,
            });
        }
        deleted
    }

    // -------------------------------------------------------------------------
    // Move
    // -------------------------------------------------------------------------

    pub fn plan_move(&self, from: &NamespacePath, to: &NamespacePath) -> NsResult<MovePlan> {
        let entry = self
            .tree
            .resolve(from)?
            .ok_or_else(|| NamespaceError::NotFound(from.to_string()))?;

        let plan = match self.tree.resolve(to)? {
            Some(target) if self.tree.get(target).is_some_and(Entry::is_directory) => MovePlan {
                entry,
                new_parent: target,
                new_name: None,
            },
            Some(_) => return Err(NamespaceError::AlreadyExists(to.to_string())),
            None => {
                let (Some(parent_path), Some(name)) = (to.parent(), to.name()) else {
                    return Err(NamespaceError::AlreadyExists(to.to_string()));
                };
                MovePlan {
                    entry,
                    new_parent: self.resolve_directory(&parent_path)?,
                    new_name: Some(name.to_string()),
                }
            }
        };

        self.tree
            .check_move(plan.entry, plan.new_parent, plan.new_name.as_deref())?;
        Ok(plan)
    }

    pub fn commit_move(&mut self, plan: MovePlan) {
        self.tree
            .relink(plan.entry, plan.new_parent, plan.new_name.as_deref());
    }

    // -------------------------------------------------------------------------
    // Replay
    // -------------------------------------------------------------------------

    /// Applies one logged edit. Used on load; a failure means the log does
    /// not match the image it follows.
    pub fn apply(&mut self, record: &EditRecord) -> NsResult<()> {
        let ts = record.timestamp;
        match &record.mutation {
            FileSystemMutation::CreateDirectory { path } => {
                let plan = self.plan_create(&NamespacePath::parse(path)?)?;
                self.commit_create_directory(plan, ts);
            }
            FileSystemMutation::CreateFile {
                path,
                block_size,
                replication_factor,
                record_options,
            } => {
                if *block_size == 0 || *replication_factor == 0 {
                    return Err(NamespaceError::InvalidArgument(format!(
                        "create of {path} with block size {block_size}, replication {replication_factor}"
                    )));
                }
                let plan = self.plan_create(&NamespacePath::parse(path)?)?;
                self.commit_create_file(
                    plan,
                    ts,
                    File::new(*block_size, *replication_factor, *record_options),
                );
            }
            FileSystemMutation::AppendBlock { path, block_id } => {
                let plan = self.plan_append_block(&NamespacePath::parse(path)?)?;
                self.commit_append_block(plan, *block_id);
            }
            FileSystemMutation::CommitBlock {
                path,
                block_id,
                size,
            } => {
                let id = self.plan_commit_block(&NamespacePath::parse(path)?, *block_id, *size)?;
                self.commit_commit_block(id, *block_id, *size);
            }
            FileSystemMutation::AbandonBlock { path, block_id } => {
                let id = self.plan_abandon_block(&NamespacePath::parse(path)?, *block_id)?;
                self.commit_abandon_block(id);
            }
            FileSystemMutation::CommitFile { path } => {
                let id = self.plan_close(&NamespacePath::parse(path)?)?;
                self.commit_close(id);
            }
            FileSystemMutation::Delete { path, recursive } => {
                if let Some(id) = self.plan_delete(&NamespacePath::parse(path)?, *recursive)? {
                    self.commit_delete(id);
                }
            }
            FileSystemMutation::Move { from, to } => {
                let plan =
                    self.plan_move(&NamespacePath::parse(from)?, &NamespacePath::parse(to)?)?;
                self.commit_move(plan);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> NamespacePath {
        NamespacePath::parse(s).unwrap()
    }

    fn apply(ns: &mut Namespace, mutation: FileSystemMutation) -> NsResult<()> {
        ns.apply(&EditRecord::now(mutation))
    }

    fn create_file(ns: &mut Namespace, path: &str, block_size: u64, options: RecordOptions) {
        apply(
            ns,
            FileSystemMutation::CreateFile {
                path: path.into(),
                block_size,
                replication_factor: 1,
                record_options: options,
            },
        )
        .unwrap();
    }

    fn write_block(ns: &mut Namespace, path: &str, id: u128, size: u64) {
        apply(
            ns,
            FileSystemMutation::AppendBlock {
                path: path.into(),
                block_id: BlockId::from_u128(id),
            },
        )
        .unwrap();
        apply(
            ns,
            FileSystemMutation::CommitBlock {
                path: path.into(),
                block_id: BlockId::from_u128(id),
                size,
            },
        )
        .unwrap();
    }

    #[test]
    fn create_requires_existing_parent_directory() {
        let mut ns = Namespace::format(Utc::now());
        assert!(matches!(
            ns.plan_create(&p("/a/b")),
            Err(NamespaceError::NotFound(_))
        ));
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        assert!(matches!(
            ns.plan_create(&p("/f/g")),
            Err(NamespaceError::NotADirectory(_))
        ));
        assert!(matches!(
            ns.plan_create(&p("/f")),
            Err(NamespaceError::AlreadyExists(_))
        ));
        assert!(matches!(
            ns.plan_create(&NamespacePath::root()),
            Err(NamespaceError::AlreadyExists(_))
        ));
    }

    #[test]
    fn second_pending_block_is_rejected() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        let plan = ns.plan_append_block(&p("/f")).unwrap();
        ns.commit_append_block(plan, BlockId::from_u128(1));
        assert!(matches!(
            ns.plan_append_block(&p("/f")),
            Err(NamespaceError::PendingBlockExists { .. })
        ));
    }

    #[test]
    fn short_last_block_blocks_append_unless_aligned() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/plain", 512, RecordOptions::empty());
        write_block(&mut ns, "/plain", 1, 100);
        assert!(matches!(
            ns.plan_append_block(&p("/plain")),
            Err(NamespaceError::LastBlockIncomplete { size: 100, .. })
        ));

        create_file(
            &mut ns,
            "/aligned",
            512,
            RecordOptions::RECORDS_ALIGNED_TO_BLOCKS,
        );
        write_block(&mut ns, "/aligned", 2, 100);
        write_block(&mut ns, "/aligned", 3, 10);
        let id = ns.lookup(&p("/aligned")).unwrap().unwrap();
        assert_eq!(ns.file_info(id).unwrap().size, 522);
        assert_eq!(ns.total_size(), 100 + 522);
    }

    #[test]
    fn commit_requires_matching_pending_block() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        let plan = ns.plan_append_block(&p("/f")).unwrap();
        ns.commit_append_block(plan, BlockId::from_u128(1));
        assert!(matches!(
            ns.plan_commit_block(&p("/f"), BlockId::from_u128(2), 10),
            Err(NamespaceError::NoMatchingPendingBlock { .. })
        ));
        assert!(matches!(
            ns.plan_commit_block(&p("/f"), BlockId::from_u128(1), 513),
            Err(NamespaceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn abandoned_block_frees_the_file_for_another_append() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        let plan = ns.plan_append_block(&p("/f")).unwrap();
        ns.commit_append_block(plan, BlockId::from_u128(1));

        assert!(matches!(
            ns.plan_abandon_block(&p("/f"), BlockId::from_u128(2)),
            Err(NamespaceError::NoMatchingPendingBlock { .. })
        ));
        apply(
            &mut ns,
            FileSystemMutation::AbandonBlock {
                path: "/f".into(),
                block_id: BlockId::from_u128(1),
            },
        )
        .unwrap();

        let id = ns.lookup(&p("/f")).unwrap().unwrap();
        let info = ns.file_info(id).unwrap();
        assert_eq!(info.pending_block, None);
        assert!(info.blocks.is_empty());
        assert_eq!(ns.pending_files().len(), 1);
        ns.plan_append_block(&p("/f")).unwrap();
    }

    #[test]
    fn close_keeps_pending_entry_until_late_commit() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        let plan = ns.plan_append_block(&p("/f")).unwrap();
        ns.commit_append_block(plan, BlockId::from_u128(9));

        let id = ns.plan_close(&p("/f")).unwrap();
        assert_eq!(ns.commit_close(id), Some(BlockId::from_u128(9)));
        assert_eq!(ns.pending_files().len(), 1);
        assert!(matches!(
            ns.plan_close(&p("/f")),
            Err(NamespaceError::NotOpenForWriting(_))
        ));

        let id = ns
            .plan_commit_block(&p("/f"), BlockId::from_u128(9), 40)
            .unwrap();
        ns.commit_commit_block(id, BlockId::from_u128(9), 40);
        assert!(ns.pending_files().is_empty());
        assert_eq!(ns.total_size(), 40);
    }

    #[test]
    fn delete_reports_files_and_adjusts_size() {
        let mut ns = Namespace::format(Utc::now());
        apply(&mut ns, FileSystemMutation::CreateDirectory { path: "/d".into() }).unwrap();
        create_file(&mut ns, "/d/f", 512, RecordOptions::empty());
        write_block(&mut ns, "/d/f", 1, 300);

        assert!(matches!(
            ns.plan_delete(&p("/d"), false),
            Err(NamespaceError::DirectoryNotEmpty(_))
        ));
        let id = ns.plan_delete(&p("/d"), true).unwrap().unwrap();
        let deleted = ns.commit_delete(id);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].file.path, "/d/f");
        assert_eq!(deleted[0].file.blocks, vec![BlockId::from_u128(1)]);
        assert_eq!(ns.total_size(), 0);
        assert!(ns.pending_files().is_empty());
        assert_eq!(ns.plan_delete(&p("/d"), true).unwrap(), None);
    }

    #[test]
    fn move_into_directory_or_rename() {
        let mut ns = Namespace::format(Utc::now());
        for d in ["/a", "/b"] {
            apply(&mut ns, FileSystemMutation::CreateDirectory { path: d.into() }).unwrap();
        }
        create_file(&mut ns, "/a/f", 512, RecordOptions::empty());

        apply(
            &mut ns,
            FileSystemMutation::Move {
                from: "/a/f".into(),
                to: "/b".into(),
            },
        )
        .unwrap();
        assert!(ns.lookup(&p("/b/f")).unwrap().is_some());

        apply(
            &mut ns,
            FileSystemMutation::Move {
                from: "/b/f".into(),
                to: "/a/g".into(),
            },
        )
        .unwrap();
        assert!(ns.lookup(&p("/a/g")).unwrap().is_some());
        assert!(ns.lookup(&p("/b/f")).unwrap().is_none());

        assert!(matches!(
            ns.plan_move(&p("/a"), &p("/a/g")),
            Err(NamespaceError::AlreadyExists(_))
        ));
        assert!(matches!(
            ns.plan_move(&p("/nope"), &p("/b")),
            Err(NamespaceError::NotFound(_))
        ));
    }

    #[test]
    fn collect_blocks_lists_committed_and_pending() {
        let mut ns = Namespace::format(Utc::now());
        create_file(&mut ns, "/f", 512, RecordOptions::empty());
        write_block(&mut ns, "/f", 1, 512);
        let plan = ns.plan_append_block(&p("/f")).unwrap();
        ns.commit_append_block(plan, BlockId::from_u128(2));

        let (mut blocks, mut pending) = (Vec::new(), Vec::new());
        ns.collect_blocks(&mut blocks, &mut pending);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_id, BlockId::from_u128(1));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].block_id, BlockId::from_u128(2));
        assert_eq!(pending[0].file, "/f");
    }
}
