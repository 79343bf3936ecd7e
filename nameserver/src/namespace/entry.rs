use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NamespaceError, NsResult};
use crate::path::{validate_name, NamespacePath};

// -----------------------------------------------------------------------------
// Identifiers and flags
// -----------------------------------------------------------------------------

/// Globally unique 128-bit block identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn generate() -> Self {
        BlockId(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        BlockId(Uuid::from_u128(v))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    /// Per-file record layout flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RecordOptions: u32 {
        /// Logical records never straddle a block boundary; the writer pads
        /// the tail of a short block instead.
        const RECORDS_ALIGNED_TO_BLOCKS = 0b0000_0001;
    }
}

/// Arena index of an entry. Only meaningful inside the tree that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

// -----------------------------------------------------------------------------
// Entries
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub date_created: DateTime<Utc>,
    /// Non-owning back reference; `None` only for the root.
    pub parent: Option<EntryId>,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub enum EntryKind {
    Directory(Directory),
    File(File),
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    /// Children keyed by name; the map makes sibling names unique.
    pub children: BTreeMap<String, EntryId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub size: u64,
    pub block_size: u64,
    pub replication_factor: u32,
    pub record_options: RecordOptions,
    pub open_for_writing: bool,
    pub blocks: Vec<BlockId>,
}

impl File {
    pub fn new(block_size: u64, replication_factor: u32, record_options: RecordOptions) -> Self {
        File {
            size: 0,
            block_size,
            replication_factor,
            record_options,
            open_for_writing: true,
            blocks: Vec::new(),
        }
    }

    /// Bytes missing from the last committed block, 0 when it is full or
    /// there are no blocks yet.
    pub fn last_block_shortfall(&self) -> u64 {
        let capacity = self.blocks.len() as u128 * u128::from(self.block_size);
        u64::try_from(capacity.saturating_sub(u128::from(self.size))).unwrap_or(u64::MAX)
    }
}

impl Entry {
    pub fn as_directory(&self) -> Option<&Directory> {
        match &self.kind {
            EntryKind::Directory(d) => Some(d),
            EntryKind::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match &self.kind {
            EntryKind::File(f) => Some(f),
            EntryKind::Directory(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut File> {
        match &mut self.kind {
            EntryKind::File(f) => Some(f),
            EntryKind::Directory(_) => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory(_))
    }
}

// -----------------------------------------------------------------------------
// Tree
// -----------------------------------------------------------------------------

/// Owns every entry. Directories own their children through the arena,
/// parents are plain ids used for path reconstruction and moves.
#[derive(Debug, Clone)]
pub struct EntryTree {
    entries: HashMap<EntryId, Entry>,
    next_id: u64,
}

impl EntryTree {
    pub const ROOT: EntryId = EntryId(0);

    pub fn new(root_created: DateTime<Utc>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            Self::ROOT,
            Entry {
                name: String::new(),
                date_created: root_created,
                parent: None,
                kind: EntryKind::Directory(Directory::default()),
            },
        );
        EntryTree {
            entries,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn file(&self, id: EntryId) -> Option<&File> {
        self.get(id).and_then(Entry::as_file)
    }

    pub fn file_mut(&mut self, id: EntryId) -> Option<&mut File> {
        self.get_mut(id).and_then(Entry::as_file_mut)
    }

    pub fn child(&self, dir: EntryId, name: &str) -> Option<EntryId> {
        self.get(dir)
            .and_then(Entry::as_directory)
            .and_then(|d| d.children.get(name).copied())
    }

    /// Walks `path` from the root.
    ///
    /// Missing entries resolve to `Ok(None)`; an intermediate component that
    /// names a file is an error.
    pub fn resolve(&self, path: &NamespacePath) -> NsResult<Option<EntryId>> {
        let mut current = Self::ROOT;
        for (depth, name) in path.components().iter().enumerate() {
            let entry = &self.entries[&current];
            let dir = match entry.as_directory() {
                Some(d) => d,
                None => {
                    let prefix = path.components()[..depth]
                        .iter()
                        .fold(NamespacePath::root(), |p, c| p.join(c));
                    return Err(NamespaceError::NotADirectory(prefix.to_string()));
                }
            };
            match dir.children.get(name) {
                Some(id) => current = *id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Inserts a new child. Callers have already checked that `parent` is a
    /// directory and `name` is free.
    pub fn insert(
        &mut self,
        parent: EntryId,
        name: &str,
        date_created: DateTime<Utc>,
        kind: EntryKind,
    ) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                date_created,
                parent: Some(parent),
                kind,
            },
        );
        if let Some(EntryKind::Directory(dir)) = self.entries.get_mut(&parent).map(|e| &mut e.kind)
        {
            dir.children.insert(name.to_string(), id);
        }
        id
    }

    pub fn full_path(&self, id: EntryId) -> NamespacePath {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let entry = &self.entries[&current];
            if entry.parent.is_some() {
                names.push(entry.name.as_str());
            }
            cursor = entry.parent;
        }
        names
            .iter()
            .rev()
            .fold(NamespacePath::root(), |p, name| p.join(name))
    }

    /// True when `ancestor` is `id` itself or one of its parents.
    pub fn is_ancestor(&self, ancestor: EntryId, id: EntryId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.entries.get(&current).and_then(|e| e.parent);
        }
        false
    }

    /// Checks everything `move_to` would check, without changing anything.
    pub fn check_move(
        &self,
        id: EntryId,
        new_parent: EntryId,
        new_name: Option<&str>,
    ) -> NsResult<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| NamespaceError::InvalidArgument(format!("unknown entry {:?}", id)))?;
        let from = self.full_path(id).to_string();
        let to_dir = self.full_path(new_parent).to_string();

        if entry.parent.is_none() {
            return Err(NamespaceError::InvalidMove {
                from,
                to: to_dir,
                reason: "the root directory cannot be moved",
            });
        }
        let target = self
            .get(new_parent)
            .and_then(Entry::as_directory)
            .ok_or_else(|| NamespaceError::NotADirectory(to_dir.clone()))?;

        let name = new_name.unwrap_or(&entry.name);
        validate_name(name).map_err(|reason| NamespaceError::InvalidMove {
            from: from.clone(),
            to: to_dir.clone(),
            reason,
        })?;
        if target.children.contains_key(name) {
            return Err(NamespaceError::AlreadyExists(
                self.full_path(new_parent).join(name).to_string(),
            ));
        }
        if self.is_ancestor(id, new_parent) {
            return Err(NamespaceError::InvalidMove {
                from,
                to: to_dir,
                reason: "destination is inside the source",
            });
        }
        Ok(())
    }

    /// Detaches `id` from its parent and reattaches it under `new_parent`,
    /// optionally renaming it.
    pub fn move_to(
        &mut self,
        id: EntryId,
        new_parent: EntryId,
        new_name: Option<&str>,
    ) -> NsResult<()> {
        self.check_move(id, new_parent, new_name)?;
        self.relink(id, new_parent, new_name);
        Ok(())
    }

    /// The mutating half of [`EntryTree::move_to`]; `check_move` must have
    /// accepted the same arguments against the current tree.
    pub fn relink(&mut self, id: EntryId, new_parent: EntryId, new_name: Option<&str>) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let old_parent = entry.parent;
        let old_name = entry.name.clone();
        let name = new_name.map(str::to_string).unwrap_or_else(|| old_name.clone());

        if let Some(EntryKind::Directory(dir)) = old_parent
            .and_then(|p| self.entries.get_mut(&p))
            .map(|e| &mut e.kind)
        {
            dir.children.remove(&old_name);
        }
        if let Some(EntryKind::Directory(dir)) =
            self.entries.get_mut(&new_parent).map(|e| &mut e.kind)
        {
            dir.children.insert(name.clone(), id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.parent = Some(new_parent);
            entry.name = name;
        }
    }

    /// Removes `id` and everything below it, returning the removed files in
    /// depth-first order together with their paths at removal time.
    pub fn remove_subtree(&mut self, id: EntryId) -> Vec<(EntryId, NamespacePath, Entry)> {
        if let Some(parent) = self.entries.get(&id).and_then(|e| e.parent) {
            let name = self.entries[&id].name.clone();
            if let Some(EntryKind::Directory(dir)) =
                self.entries.get_mut(&parent).map(|e| &mut e.kind)
            {
                dir.children.remove(&name);
            }
        }

        let base = self.full_path_detached(id);
        let mut removed_files = Vec::new();
        let mut stack = vec![(id, base)];
        while let Some((current, path)) = stack.pop() {
            let Some(entry) = self.entries.remove(&current) else {
                continue;
            };
            match &entry.kind {
                EntryKind::Directory(dir) => {
                    for (name, child) in dir.children.iter().rev() {
                        stack.push((*child, path.join(name)));
                    }
                }
                EntryKind::File(_) => removed_files.push((current, path, entry)),
            }
        }
        removed_files
    }

    // After detaching, the entry keeps its parent id, so the path is still
    // reconstructible.
    fn full_path_detached(&self, id: EntryId) -> NamespacePath {
        let entry = &self.entries[&id];
        match entry.parent {
            Some(parent) => self.full_path(parent).join(&entry.name),
            None => NamespacePath::root(),
        }
    }

    /// Visits every entry below the root depth-first, in name order.
    pub fn walk(&self, mut visit: impl FnMut(EntryId, &NamespacePath, &Entry)) {
        let mut stack = vec![(Self::ROOT, NamespacePath::root())];
        while let Some((id, path)) = stack.pop() {
            let entry = &self.entries[&id];
            visit(id, &path, entry);
            if let EntryKind::Directory(dir) = &entry.kind {
                for (name, child) in dir.children.iter().rev() {
                    stack.push((*child, path.join(name)));
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Serialized form
// -----------------------------------------------------------------------------

/// One serialized entry. A tree is stored as a flat list of these in
/// pre-order, root first; `parent` is the index of an earlier directory
/// record, `None` only for the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryImage {
    pub parent: Option<u64>,
    pub name: String,
    pub date_created: DateTime<Utc>,
    pub kind: EntryKindImage,
}

/// Variant-specific fields. The enum variant is the type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryKindImage {
    Directory,
    File {
        size: u64,
        block_size: u64,
        replication_factor: u32,
        record_options: RecordOptions,
        open_for_writing: bool,
        blocks: Vec<BlockId>,
    },
}

impl EntryTree {
    /// Serializes the whole tree, children in name order.
    pub fn save(&self) -> Vec<EntryImage> {
        let mut records = Vec::with_capacity(self.entries.len());
        let mut stack = vec![(Self::ROOT, None)];
        while let Some((id, parent)) = stack.pop() {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let index = records.len() as u64;
            let kind = match &entry.kind {
                EntryKind::Directory(dir) => {
                    for child in dir.children.values().rev() {
                        stack.push((*child, Some(index)));
                    }
                    EntryKindImage::Directory
                }
                EntryKind::File(f) => EntryKindImage::File {
                    size: f.size,
                    block_size: f.block_size,
                    replication_factor: f.replication_factor,
                    record_options: f.record_options,
                    open_for_writing: f.open_for_writing,
                    blocks: f.blocks.clone(),
                },
            };
            records.push(EntryImage {
                parent,
                name: entry.name.clone(),
                date_created: entry.date_created,
                kind,
            });
        }
        records
    }

    /// Rebuilds a tree from the records written by [`EntryTree::save`].
    pub fn load(records: Vec<EntryImage>) -> Result<Self, String> {
        let mut records = records.into_iter();
        let root = records.next().ok_or("image holds no entries")?;
        if root.parent.is_some() || root.kind != EntryKindImage::Directory {
            return Err("first entry is not the root directory".into());
        }
        if !root.name.is_empty() {
            return Err(format!("root directory has a name: {:?}", root.name));
        }

        let mut tree = EntryTree::new(root.date_created);
        let mut ids = vec![Self::ROOT];
        for (index, record) in records.enumerate() {
            let index = index + 1;
            let parent = record
                .parent
                .and_then(|p| usize::try_from(p).ok())
                .filter(|p| *p < index)
                .map(|p| ids[p])
                .ok_or_else(|| format!("entry {index} has no earlier parent"))?;
            if !tree.get(parent).is_some_and(Entry::is_directory) {
                return Err(format!(
                    "parent of entry {index} is not a directory: {}",
                    tree.full_path(parent)
                ));
            }

            let name = record.name;
            validate_name(&name).map_err(|reason| format!("bad entry name {name:?}: {reason}"))?;
            if tree.child(parent, &name).is_some() {
                return Err(format!(
                    "duplicate entry {}",
                    tree.full_path(parent).join(&name)
                ));
            }

            let kind = match record.kind {
                EntryKindImage::Directory => EntryKind::Directory(Directory::default()),
                EntryKindImage::File {
                    size,
                    block_size,
                    replication_factor,
                    record_options,
                    open_for_writing,
                    blocks,
                } => EntryKind::File(File {
                    size,
                    block_size,
                    replication_factor,
                    record_options,
                    open_for_writing,
                    blocks,
                }),
            };
            ids.push(tree.insert(parent, &name, record.date_created, kind));
        }
        Ok(tree)
    }
}
