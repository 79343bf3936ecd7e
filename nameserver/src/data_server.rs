use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock;
use crate::namespace::BlockId;

pub const DEFAULT_RACK: &str = "/default-rack";

/// Topology distance between two storage servers.
pub const SAME_SERVER: u8 = 0;
pub const SAME_RACK: u8 = 1;
pub const OFF_RACK: u8 = 2;

/// Disk usage reported by a storage server on every heartbeat.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskMetrics {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Something the storage server should do, delivered with its next heartbeat
/// reply.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HeartbeatCommand {
    DeleteBlocks {
        blocks: Vec<BlockId>,
    },
    ReplicateBlock {
        block_id: BlockId,
        targets: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct Residency {
    blocks: HashSet<BlockId>,
    pending_blocks: HashSet<BlockId>,
    last_contact: Option<DateTime<Utc>>,
    disk: DiskMetrics,
}

/// Name-server-side view of one storage server.
#[derive(Debug)]
pub struct DataServerInfo {
    address: String,
    rack: String,
    residency: Mutex<Residency>,
    responses: Mutex<Vec<HeartbeatCommand>>,
}

impl DataServerInfo {
    /// `address` is `host:port`; `rack` is the server's network location,
    /// e.g. `/dc1/rack7`.
    pub fn new(address: impl Into<String>, rack: impl Into<String>) -> Self {
        let rack = rack.into();
        DataServerInfo {
            address: address.into(),
            rack: if rack.is_empty() {
                DEFAULT_RACK.to_string()
            } else {
                rack
            },
            residency: Mutex::new(Residency::default()),
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address without the port.
    pub fn host(&self) -> &str {
        host_of(&self.address)
    }

    pub fn rack(&self) -> &str {
        &self.rack
    }

    pub fn distance_to(&self, other: &DataServerInfo) -> u8 {
        if self.address == other.address {
            SAME_SERVER
        } else if self.rack == other.rack {
            SAME_RACK
        } else {
            OFF_RACK
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeat state
    // -------------------------------------------------------------------------

    pub fn record_heartbeat(&self, disk: DiskMetrics, at: DateTime<Utc>) {
        let mut r = lock(&self.residency);
        r.disk = disk;
        r.last_contact = Some(at);
    }

    pub fn last_contact(&self) -> Option<DateTime<Utc>> {
        lock(&self.residency).last_contact
    }

    pub fn disk(&self) -> DiskMetrics {
        lock(&self.residency).disk
    }

    /// True once at least one heartbeat has arrived.
    pub fn has_reported(&self) -> bool {
        lock(&self.residency).last_contact.is_some()
    }

    // -------------------------------------------------------------------------
    // Block residency
    // -------------------------------------------------------------------------

    pub fn holds(&self, block: BlockId) -> bool {
        lock(&self.residency).blocks.contains(&block)
    }

    pub fn is_pending(&self, block: BlockId) -> bool {
        lock(&self.residency).pending_blocks.contains(&block)
    }

    pub fn block_count(&self) -> usize {
        lock(&self.residency).blocks.len()
    }

    pub fn pending_block_count(&self) -> usize {
        lock(&self.residency).pending_blocks.len()
    }

    pub fn blocks(&self) -> Vec<BlockId> {
        let mut v: Vec<_> = lock(&self.residency).blocks.iter().copied().collect();
        v.sort();
        v
    }

    pub fn add_pending_block(&self, block: BlockId) {
        lock(&self.residency).pending_blocks.insert(block);
    }

    /// The server confirmed it now stores `block`.
    pub fn confirm_block(&self, block: BlockId) {
        let mut r = lock(&self.residency);
        r.pending_blocks.remove(&block);
        r.blocks.insert(block);
    }

    /// Replaces the held set with a full block report. Pending blocks that
    /// show up in the report are no longer pending.
    pub fn report_blocks(&self, blocks: impl IntoIterator<Item = BlockId>) {
        let mut r = lock(&self.residency);
        r.blocks = blocks.into_iter().collect();
        let Residency {
            blocks,
            pending_blocks,
            ..
        } = &mut *r;
        pending_blocks.retain(|b| !blocks.contains(b));
    }

    pub fn remove_blocks(&self, blocks: &[BlockId]) {
        let mut r = lock(&self.residency);
        for b in blocks {
            r.blocks.remove(b);
            r.pending_blocks.remove(b);
        }
    }

    // -------------------------------------------------------------------------
    // Outgoing commands
    // -------------------------------------------------------------------------

    /// Queues a command for the next heartbeat reply. Block deletions are
    /// merged into an already queued delete command.
    pub fn add_response_for_next_heartbeat(&self, cmd: HeartbeatCommand) {
        let mut queue = lock(&self.responses);
        if let HeartbeatCommand::DeleteBlocks { blocks: new } = &cmd {
            let existing = queue.iter_mut().find_map(|c| match c {
                HeartbeatCommand::DeleteBlocks { blocks } => Some(blocks),
                _ => None,
            });
            if let Some(blocks) = existing {
                for b in new {
                    if !blocks.contains(b) {
                        blocks.push(*b);
                    }
                }
                return;
            }
        }
        queue.push(cmd);
    }

    pub fn get_and_clear_pending_responses(&self) -> Vec<HeartbeatCommand> {
        std::mem::take(&mut *lock(&self.responses))
    }
}

pub fn host_of(address: &str) -> &str {
    // [v6]:port, host:port, or a bare host
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => address,
    }
}
