use std::fs;
use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;

use junknas_nameserver::journal::{EditLog, IMAGE_VERSION};
use junknas_nameserver::{
    BlockId, BlockInfo, EntryInfo, ErrorKind, FileOptions, FileSystem, NameServerConfig,
    NamespaceError, RecordOptions,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> NameServerConfig {
    NameServerConfig {
        image_dir: dir.path().join("namespace"),
        sync_edits: false,
        ..NameServerConfig::default()
    }
}

fn options(block_size: u64, replication_factor: u32) -> FileOptions {
    FileOptions {
        block_size,
        replication_factor,
        record_options: RecordOptions::empty(),
    }
}

/// Every entry in the tree, depth first, plus the block map and total size.
fn dump(fs: &FileSystem) -> (Vec<EntryInfo>, Vec<BlockInfo>, Vec<BlockInfo>, u64) {
    fn walk(fs: &FileSystem, path: &str, out: &mut Vec<EntryInfo>) {
        let info = fs.get_entry_info(path).unwrap().unwrap();
        if let EntryInfo::Directory(d) = &info {
            for child in &d.children {
                let child_path = if path == "/" {
                    format!("/{child}")
                } else {
                    format!("{path}/{child}")
                };
                walk(fs, &child_path, out);
            }
        }
        out.push(info);
    }

    let mut entries = Vec::new();
    walk(fs, "/", &mut entries);
    let mut blocks = Vec::new();
    let mut pending = Vec::new();
    fs.get_blocks(&mut blocks, &mut pending);
    (entries, blocks, pending, fs.total_size())
}

fn committed_sizes(fs: &FileSystem) -> u64 {
    dump(fs)
        .0
        .iter()
        .map(|e| match e {
            EntryInfo::File(f) => f.size,
            EntryInfo::Directory(_) => 0,
        })
        .sum()
}

/// A namespace exercising every kind of edit.
fn populate(fs: &FileSystem) {
    fs.create_directory("/a/b").unwrap();
    fs.create_directory("/c").unwrap();

    fs.create_file("/a/one", options(1024, 3), false, 3).unwrap();
    let b1 = fs.append_block("/a/one", None, 3).unwrap();
    fs.commit_block("/a/one", b1.block_id, 1024).unwrap();
    let b2 = fs.append_block("/a/one", None, 3).unwrap();
    fs.commit_block("/a/one", b2.block_id, 10).unwrap();
    fs.close_file("/a/one").unwrap();

    // still open, with a block in flight
    let created = fs.create_file("/a/b/open", options(512, 2), true, 2).unwrap();
    assert!(created.first_block.is_some());

    fs.create_file("/c/gone", options(512, 1), false, 1).unwrap();
    fs.delete("/c/gone", false).unwrap();

    fs.move_entry("/a/one", "/c").unwrap();
    fs.move_entry("/c", "/d").unwrap();
}

// -----------------------------------------------------------------------------
// Scenarios
// -----------------------------------------------------------------------------

#[test]
fn create_directory_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let first = fs.create_directory("/a/b").unwrap();
    let second = fs.create_directory("/a/b").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.path, "/a/b");

    assert_eq!(fs.list_directory("/").unwrap(), vec!["a".to_string()]);
    assert_eq!(fs.list_directory("/a").unwrap(), vec!["b".to_string()]);
}

#[test]
fn short_last_block_blocks_the_next_append() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    fs.create_file("/f", options(1024, 1), false, 1).unwrap();
    let x = fs.append_block("/f", None, 1).unwrap();
    fs.commit_block("/f", x.block_id, 500).unwrap();

    let file = fs.get_file_info("/f").unwrap().unwrap();
    assert_eq!(file.size, 500);
    assert_eq!(file.blocks, vec![x.block_id]);

    let err = fs.append_block("/f", None, 1).unwrap_err();
    assert!(matches!(err, NamespaceError::LastBlockIncomplete { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn aligned_records_pad_the_short_block() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let aligned = FileOptions {
        record_options: RecordOptions::RECORDS_ALIGNED_TO_BLOCKS,
        ..options(1024, 1)
    };
    fs.create_file("/f", aligned, false, 1).unwrap();
    let x = fs.append_block("/f", None, 1).unwrap();
    fs.commit_block("/f", x.block_id, 500).unwrap();
    fs.append_block("/f", None, 1).unwrap();

    assert_eq!(fs.get_file_info("/f").unwrap().unwrap().size, 1024);
    assert_eq!(fs.total_size(), 1024);
}

#[test]
fn recursive_delete_notifies_once_per_file() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();
    let mut deletions = fs.subscribe_deletions();

    fs.create_directory("/dir").unwrap();
    fs.create_file("/dir/f", options(1024, 1), false, 1).unwrap();

    let err = fs.delete("/dir", false).unwrap_err();
    assert!(matches!(err, NamespaceError::DirectoryNotEmpty(_)));
    assert!(deletions.try_recv().is_err());

    assert!(fs.delete("/dir", true).unwrap());
    let event = deletions.try_recv().unwrap();
    assert_eq!(event.file.path, "/dir/f");
    assert!(deletions.try_recv().is_err());

    assert!(fs.get_entry_info("/dir").unwrap().is_none());
    assert!(!fs.delete("/dir", true).unwrap());
}

#[test]
fn move_into_existing_directory_keeps_blocks() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    fs.create_directory("/a").unwrap();
    fs.create_directory("/b").unwrap();
    fs.create_file("/a/f", options(1024, 1), false, 1).unwrap();
    let x = fs.append_block("/a/f", None, 1).unwrap();
    fs.commit_block("/a/f", x.block_id, 1024).unwrap();
    fs.close_file("/a/f").unwrap();

    fs.move_entry("/a/f", "/b").unwrap();

    assert!(fs.get_file_info("/a/f").unwrap().is_none());
    let moved = fs.get_file_info("/b/f").unwrap().unwrap();
    assert_eq!(moved.blocks, vec![x.block_id]);

    let mut blocks = Vec::new();
    fs.get_blocks(&mut blocks, &mut Vec::new());
    assert_eq!(blocks[0].file, "/b/f");
}

// -----------------------------------------------------------------------------
// Writes
// -----------------------------------------------------------------------------

#[test]
fn pending_block_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    fs.create_file("/f", options(1024, 1), true, 1).unwrap();
    let err = fs.append_block("/f", None, 1).unwrap_err();
    assert!(matches!(err, NamespaceError::PendingBlockExists { .. }));

    let mut blocks = Vec::new();
    let mut pending = Vec::new();
    fs.get_blocks(&mut blocks, &mut pending);
    assert!(blocks.is_empty());
    assert_eq!(pending.len(), 1);
}

#[test]
fn abandoned_block_is_gone_after_restart() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    fs.create_file("/f", options(1024, 1), false, 1).unwrap();
    let first = fs.append_block("/f", None, 1).unwrap();
    fs.commit_block("/f", first.block_id, 100).unwrap();
    let lost = fs.append_block("/f", None, 1).unwrap();
    fs.abandon_block("/f", lost.block_id).unwrap();
    assert!(matches!(
        fs.abandon_block("/f", lost.block_id).unwrap_err(),
        NamespaceError::NoMatchingPendingBlock { .. }
    ));
    let before = dump(&fs);
    drop(fs);

    let fs = FileSystem::open(config(&dir)).unwrap();
    assert_eq!(dump(&fs), before);
    let file = fs.get_file_info("/f").unwrap().unwrap();
    assert_eq!(file.pending_block, None);
    assert_eq!(file.blocks, vec![first.block_id]);

    let next = fs.append_block("/f", None, 1).unwrap();
    assert_ne!(next.block_id, lost.block_id);
}

#[test]
fn create_file_validates_arguments() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    for bad in [options(0, 1), options(1000, 1), options(1024, 0)] {
        let err = fs.create_file("/f", bad, false, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed, "{bad:?}");
    }
    assert!(fs.get_entry_info("/f").unwrap().is_none());

    fs.create_file("/f", options(1024, 1), false, 1).unwrap();
    let err = fs.create_file("/f", options(1024, 1), false, 1).unwrap_err();
    assert!(matches!(err, NamespaceError::AlreadyExists(_)));
}

#[test]
fn failed_first_block_removes_the_file() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let err = fs.create_file("/f", options(1024, 3), true, 2).unwrap_err();
    assert!(matches!(
        err,
        NamespaceError::InsufficientServers {
            required: 3,
            available: 2
        }
    ));
    assert!(fs.get_entry_info("/f").unwrap().is_none());

    // the cleanup is durable too
    drop(fs);
    let fs = FileSystem::load(config(&dir)).unwrap();
    assert!(fs.get_entry_info("/f").unwrap().is_none());
}

#[test]
fn closing_keeps_a_late_commit() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let created = fs.create_file("/f", options(1024, 1), true, 1).unwrap();
    let x = created.first_block.unwrap().block_id;
    assert_eq!(fs.close_file("/f").unwrap(), Some(x));

    let err = fs.append_block("/f", None, 1).unwrap_err();
    assert!(matches!(err, NamespaceError::NotOpenForWriting(_)));

    fs.commit_block("/f", x, 700).unwrap();
    let file = fs.get_file_info("/f").unwrap().unwrap();
    assert!(!file.open_for_writing);
    assert_eq!(file.size, 700);
    assert_eq!(file.pending_block, None);

    let err = fs.commit_block("/f", x, 700).unwrap_err();
    assert!(matches!(err, NamespaceError::NoMatchingPendingBlock { .. }));
}

#[test]
fn caller_chosen_block_ids_are_kept() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let id = BlockId::from_u128(0xfeed);
    fs.create_file("/f", options(512, 1), false, 1).unwrap();
    let block = fs.append_block("/f", Some(id), 1).unwrap();
    assert_eq!(block.block_id, id);
    assert_eq!(block.file, "/f");
    assert_eq!(block.replication_factor, 1);
}

#[test]
fn total_size_tracks_committed_bytes() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    populate(&fs);
    assert_eq!(fs.total_size(), 1034);
    assert_eq!(fs.total_size(), committed_sizes(&fs));

    fs.delete("/d", true).unwrap();
    assert_eq!(fs.total_size(), 0);
    assert_eq!(committed_sizes(&fs), 0);
}

#[test]
fn concurrent_creates_of_one_path() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(FileSystem::open(config(&dir)).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = fs.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                fs.create_file("/race", options(512, 1), false, 1).is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(fs.list_directory("/").unwrap(), vec!["race".to_string()]);
}

// -----------------------------------------------------------------------------
// Durability
// -----------------------------------------------------------------------------

#[test]
fn checkpoint_round_trip() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();
    populate(&fs);
    let id = fs.namespace_id();
    let before = dump(&fs);

    fs.save_to_image().unwrap();
    drop(fs);

    let fs = FileSystem::load(config(&dir)).unwrap();
    assert_eq!(fs.namespace_id(), id);
    assert_eq!(dump(&fs), before);
}

#[test]
fn deep_namespace_survives_checkpoint() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();

    let mut path = String::new();
    for depth in 0..1000 {
        path.push_str(&format!("/d{depth}"));
        fs.create_directory(&path).unwrap();
    }
    let leaf = format!("{path}/leaf");
    fs.create_file(&leaf, options(1024, 1), false, 1).unwrap();
    fs.save_to_image().unwrap();
    drop(fs);

    let fs = FileSystem::load(config(&dir)).unwrap();
    let file = fs.get_file_info(&leaf).unwrap().unwrap();
    assert_eq!(file.path, leaf);
    assert!(fs.get_entry_info("/d0/d1/d2").unwrap().is_some());
}

#[test]
fn edits_replay_after_crash() {
    let dir = TempDir::new().unwrap();
    let fs = FileSystem::open(config(&dir)).unwrap();
    populate(&fs);
    let before = dump(&fs);
    // no checkpoint: everything lives in the edit log
    drop(fs);

    let fs = FileSystem::open(config(&dir)).unwrap();
    assert_eq!(dump(&fs), before);

    // edits after a restart land in a new segment and replay too
    fs.create_directory("/later").unwrap();
    let before = dump(&fs);
    drop(fs);
    let fs = FileSystem::open(config(&dir)).unwrap();
    assert_eq!(dump(&fs), before);
}

#[test]
fn checkpoint_then_more_edits() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let fs = FileSystem::open(cfg.clone()).unwrap();

    fs.create_directory("/x").unwrap();
    fs.save_to_image().unwrap();
    let segments = EditLog::list_segments(&cfg.image_dir).unwrap();
    assert_eq!(segments.len(), 1, "folded segments are discarded");

    fs.create_directory("/x/y").unwrap();
    fs.save_to_image().unwrap();
    fs.create_directory("/x/y/z").unwrap();
    let before = dump(&fs);
    drop(fs);

    let fs = FileSystem::open(cfg).unwrap();
    assert_eq!(dump(&fs), before);
}

#[test]
fn torn_edit_tail_is_dropped() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let fs = FileSystem::open(cfg.clone()).unwrap();
    fs.create_directory("/kept").unwrap();
    drop(fs);

    let last = *EditLog::list_segments(&cfg.image_dir)
        .unwrap()
        .last()
        .unwrap();
    let mut segment = fs::OpenOptions::new()
        .append(true)
        .open(EditLog::segment_path(&cfg.image_dir, last))
        .unwrap();
    // length prefix promising more bytes than follow
    segment.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(segment);

    let fs = FileSystem::open(cfg).unwrap();
    assert!(fs.get_directory_info("/kept").unwrap().is_some());
}

#[test]
fn interrupted_checkpoint_refuses_to_load() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let fs = FileSystem::open(cfg.clone()).unwrap();
    fs.create_directory("/a").unwrap();
    drop(fs);

    fs::write(cfg.image_dir.join("fsimage.ckpt"), b"partial").unwrap();

    let err = FileSystem::open(cfg.clone()).err().unwrap();
    assert!(matches!(err, NamespaceError::InterruptedCheckpoint(_)));
    assert_eq!(err.kind(), ErrorKind::Durability);
    let err = FileSystem::load(cfg).err().unwrap();
    assert!(matches!(err, NamespaceError::InterruptedCheckpoint(_)));
}

#[test]
fn corrupt_image_fails_checksum() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    drop(FileSystem::open(cfg.clone()).unwrap());

    let image = cfg.image_dir.join("fsimage");
    let mut bytes = fs::read(&image).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&image, bytes).unwrap();

    let err = FileSystem::open(cfg).err().unwrap();
    assert!(matches!(err, NamespaceError::ChecksumMismatch(_)));
}

#[test]
fn format_requires_an_empty_directory() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    fs::create_dir_all(&cfg.image_dir).unwrap();
    fs::write(cfg.image_dir.join("stray"), b"x").unwrap();

    let err = FileSystem::format(cfg).err().unwrap();
    assert!(matches!(err, NamespaceError::ImageDirNotEmpty(_)));
}

#[test]
fn image_header_carries_the_version() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    drop(FileSystem::open(cfg.clone()).unwrap());

    let bytes = fs::read(cfg.image_dir.join("fsimage")).unwrap();
    assert_eq!(&bytes[..4], b"JNFS");
    assert_eq!(
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        IMAGE_VERSION
    );
}
