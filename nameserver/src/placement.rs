use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data_server::{host_of, DataServerInfo, OFF_RACK, SAME_RACK, SAME_SERVER};
use crate::error::{NamespaceError, NsResult};
use crate::lock;
use crate::namespace::{BlockId, BlockInfo};

// -----------------------------------------------------------
// Types
// -----------------------------------------------------------

/// Where the replicas of one block should go, in pipeline order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockAssignment {
    pub block_id: BlockId,
    pub servers: Vec<String>,
}

/// Input to a single placement decision.
#[derive(Debug, Clone)]
pub struct PlacementRequest<'a> {
    pub block_id: BlockId,
    pub replication_factor: u32,
    /// Every known server; used for rack count and to locate the writer.
    pub servers: &'a [Arc<DataServerInfo>],
    /// Servers already holding the block.
    pub holders: Vec<Arc<DataServerInfo>>,
    /// Eligible servers not holding the block.
    pub candidates: Vec<Arc<DataServerInfo>>,
    /// Host of the client writing the block, for first-write placement.
    pub writer: Option<&'a str>,
    pub use_local_replica: bool,
}

/// Host and rack that the next replica is measured against.
#[derive(Debug, Clone)]
struct Reference {
    host: String,
    rack: Option<String>,
}

impl Reference {
    fn of(server: &DataServerInfo) -> Self {
        Reference {
            host: server.host().to_string(),
            rack: Some(server.rack().to_string()),
        }
    }

    fn distance(&self, server: &DataServerInfo) -> u8 {
        if server.host() == self.host {
            SAME_SERVER
        } else if self.rack.as_deref() == Some(server.rack()) {
            SAME_RACK
        } else {
            OFF_RACK
        }
    }
}

// -----------------------------------------------------------
// REPLICA PLACEMENT
// -----------------------------------------------------------
//
// Placement order is positional:
//   0: closest to the writer (or to an existing holder)
//   1: off-rack from replica 0 when there is more than one rack
//   2: same rack as replica 0, or off-rack if all replicas so far share a rack
//   3+: random, unless an off-rack replica is still owed
//
// Every tie is broken by fewest pending blocks, then uniformly at random.
// -----------------------------------------------------------

pub struct ReplicaPlacement {
    min_free_bytes: u64,
    rng: Mutex<StdRng>,
}

impl ReplicaPlacement {
    pub fn new(min_free_bytes: u64) -> Self {
        Self::with_rng(min_free_bytes, StdRng::from_entropy())
    }

    /// Deterministic selection, for tests and simulations.
    pub fn with_seed(min_free_bytes: u64, seed: u64) -> Self {
        Self::with_rng(min_free_bytes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(min_free_bytes: u64, rng: StdRng) -> Self {
        ReplicaPlacement {
            min_free_bytes,
            rng: Mutex::new(rng),
        }
    }

    /// Servers that may receive a new replica of `block`: reported in, not
    /// already holding or receiving it, with enough free space.
    pub fn eligible_servers(
        &self,
        servers: &[Arc<DataServerInfo>],
        block: BlockId,
    ) -> Vec<Arc<DataServerInfo>> {
        servers
            .iter()
            .filter(|s| {
                s.has_reported()
                    && !s.holds(block)
                    && !s.is_pending(block)
                    && s.disk().free_bytes >= self.min_free_bytes
            })
            .cloned()
            .collect()
    }

    /// Derives holders and candidates for `block` from the live server set
    /// and places the missing replicas.
    pub fn assign(
        &self,
        block: &BlockInfo,
        servers: &[Arc<DataServerInfo>],
        writer: Option<&str>,
        use_local_replica: bool,
    ) -> NsResult<BlockAssignment> {
        let holders = servers
            .iter()
            .filter(|s| s.holds(block.block_id))
            .cloned()
            .collect();
        self.place(PlacementRequest {
            block_id: block.block_id,
            replication_factor: block.replication_factor,
            servers,
            holders,
            candidates: self.eligible_servers(servers, block.block_id),
            writer,
            use_local_replica,
        })
    }

    pub fn place(&self, request: PlacementRequest<'_>) -> NsResult<BlockAssignment> {
        let PlacementRequest {
            block_id,
            replication_factor,
            servers,
            holders,
            candidates: mut pool,
            writer,
            use_local_replica,
        } = request;

        let needed = (replication_factor as usize).saturating_sub(holders.len());
        if needed == 0 {
            return Ok(BlockAssignment {
                block_id,
                servers: Vec::new(),
            });
        }

        let mut reference = match (writer, holders.first()) {
            (Some(_), Some(_)) => {
                return Err(NamespaceError::InvalidArgument(format!(
                    "writer given for block {block_id} which already has replicas"
                )))
            }
            (Some(w), None) => {
                let host = host_of(w);
                Reference {
                    host: host.to_string(),
                    rack: servers
                        .iter()
                        .find(|s| s.host() == host)
                        .map(|s| s.rack().to_string()),
                }
            }
            (None, Some(h)) => Reference::of(h),
            (None, None) => {
                return Err(NamespaceError::InvalidArgument(format!(
                    "block {block_id} has neither a writer nor an existing replica"
                )))
            }
        };

        if pool.is_empty() {
            return Err(NamespaceError::InsufficientServers {
                required: needed,
                available: 0,
            });
        }

        let racks: HashSet<&str> = servers.iter().map(|s| s.rack()).collect();
        let multi_rack = racks.len() > 1;
        let mut force_off_rack = multi_rack && holders.len() >= 2 && all_one_rack(&holders, &[]);
        let first_min = if writer.is_some() && !use_local_replica {
            SAME_RACK
        } else {
            SAME_SERVER
        };

        let mut chosen: Vec<Arc<DataServerInfo>> = Vec::with_capacity(needed);
        {
            let mut rng = lock(&self.rng);
            for position in 0..needed {
                if pool.is_empty() {
                    break;
                }
                let min_distance = match position {
                    0 if force_off_rack => {
                        force_off_rack = false;
                        Some(OFF_RACK)
                    }
                    0 => Some(first_min),
                    1 if multi_rack => Some(OFF_RACK),
                    2 if multi_rack => {
                        let d = if force_off_rack { OFF_RACK } else { SAME_RACK };
                        force_off_rack = false;
                        Some(d)
                    }
                    p if p >= 3 && multi_rack && force_off_rack => {
                        force_off_rack = false;
                        Some(OFF_RACK)
                    }
                    _ => None,
                };

                let idx = pick(&mut rng, &pool, &reference, min_distance);
                let server = pool.swap_remove(idx);
                server.add_pending_block(block_id);
                if position == 0 {
                    reference = Reference::of(&server);
                }
                chosen.push(server);

                if position == 1 && multi_rack && all_one_rack(&holders, &chosen) {
                    force_off_rack = true;
                }
            }
        }

        chain_order(&mut chosen);

        if !use_local_replica {
            if let Some(w) = writer {
                let host = host_of(w);
                if let Some(idx) = chosen.iter().position(|s| s.host() == host) {
                    let local = chosen.remove(idx);
                    chosen.insert(0, local);
                }
            }
        }

        let assignment = BlockAssignment {
            block_id,
            servers: chosen.iter().map(|s| s.address().to_string()).collect(),
        };
        debug!(
            block = %block_id,
            needed,
            placed = assignment.servers.len(),
            servers = ?assignment.servers,
            "placed replicas"
        );
        Ok(assignment)
    }
}

/// Index into `pool` of the next replica.
///
/// With a minimum distance, the closest servers at or beyond it are
/// preferred; if none qualify any server may be picked.
fn pick(
    rng: &mut StdRng,
    pool: &[Arc<DataServerInfo>],
    reference: &Reference,
    min_distance: Option<u8>,
) -> usize {
    let all: Vec<usize> = (0..pool.len()).collect();
    let mut candidates = match min_distance {
        Some(min) => {
            let far: Vec<(usize, u8)> = all
                .iter()
                .map(|&i| (i, reference.distance(&pool[i])))
                .filter(|(_, d)| *d >= min)
                .collect();
            match far.iter().map(|(_, d)| *d).min() {
                Some(closest) => far
                    .into_iter()
                    .filter(|(_, d)| *d == closest)
                    .map(|(i, _)| i)
                    .collect(),
                None => all,
            }
        }
        None => all,
    };

    let loads: Vec<usize> = candidates
        .iter()
        .map(|&i| pool[i].pending_block_count())
        .collect();
    let least = loads.iter().copied().min().unwrap_or(0);
    candidates = candidates
        .into_iter()
        .zip(loads)
        .filter(|(_, load)| *load == least)
        .map(|(i, _)| i)
        .collect();

    candidates[rng.gen_range(0..candidates.len())]
}

/// Pulls same-rack servers next to each other so a write pipeline hops
/// between racks as rarely as possible.
fn chain_order(chosen: &mut [Arc<DataServerInfo>]) {
    for i in 0..chosen.len().saturating_sub(1) {
        let next = (i + 1..chosen.len())
            .map(|j| (j, chosen[i].distance_to(&chosen[j])))
            .filter(|(_, d)| *d < OFF_RACK)
            .min_by_key(|(_, d)| *d)
            .map(|(j, _)| j);
        if let Some(j) = next {
            chosen.swap(i + 1, j);
        }
    }
}

fn all_one_rack(a: &[Arc<DataServerInfo>], b: &[Arc<DataServerInfo>]) -> bool {
    let mut racks = a.iter().chain(b.iter()).map(|s| s.rack());
    match racks.next() {
        Some(first) => {
            let mut count = 1;
            for r in racks {
                if r != first {
                    return false;
                }
                count += 1;
            }
            count >= 2
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_server::DiskMetrics;
    use chrono::Utc;

    const GIB: u64 = 1 << 30;

    fn server(addr: &str, rack: &str) -> Arc<DataServerInfo> {
        let s = DataServerInfo::new(addr, rack);
        s.record_heartbeat(
            DiskMetrics {
                capacity_bytes: 10 * GIB,
                used_bytes: 0,
                free_bytes: 10 * GIB,
            },
            Utc::now(),
        );
        Arc::new(s)
    }

    fn block(n: u128, rf: u32) -> BlockInfo {
        BlockInfo {
            block_id: BlockId::from_u128(n),
            file: "/f".into(),
            replication_factor: rf,
        }
    }

    fn rack_of<'a>(servers: &'a [Arc<DataServerInfo>], addr: &str) -> &'a str {
        servers
            .iter()
            .find(|s| s.address() == addr)
            .map(|s| s.rack())
            .unwrap()
    }

    fn two_racks() -> Vec<Arc<DataServerInfo>> {
        vec![
            server("10.0.1.1:7000", "/r1"),
            server("10.0.1.2:7000", "/r1"),
            server("10.0.1.3:7000", "/r1"),
            server("10.0.2.1:7000", "/r2"),
            server("10.0.2.2:7000", "/r2"),
            server("10.0.2.3:7000", "/r2"),
        ]
    }

    #[test]
    fn three_replicas_span_two_racks_starting_local() {
        for seed in 0..32 {
            let servers = two_racks();
            let placement = ReplicaPlacement::with_seed(GIB, seed);
            let a = placement
                .assign(&block(1, 3), &servers, Some("10.0.1.2"), true)
                .unwrap();

            assert_eq!(a.servers.len(), 3);
            assert_eq!(a.servers[0], "10.0.1.2:7000");
            let on_r1 = a
                .servers
                .iter()
                .filter(|s| rack_of(&servers, s) == "/r1")
                .count();
            assert_eq!(on_r1, 2, "seed {seed}: {:?}", a.servers);
            // pipeline order keeps the two r1 replicas adjacent
            assert_eq!(rack_of(&servers, &a.servers[1]), "/r1");
        }
    }

    #[test]
    fn same_rack_holders_force_an_off_rack_replica() {
        let servers = vec![
            server("10.0.1.1:7000", "/r1"),
            server("10.0.1.2:7000", "/r1"),
            server("10.0.1.3:7000", "/r1"),
            server("10.0.2.1:7000", "/r2"),
        ];
        let b = block(2, 3);
        servers[0].report_blocks([b.block_id]);
        servers[1].report_blocks([b.block_id]);

        let placement = ReplicaPlacement::with_seed(GIB, 7);
        let a = placement.assign(&b, &servers, None, true).unwrap();
        assert_eq!(a.servers, vec!["10.0.2.1:7000".to_string()]);
    }

    #[test]
    fn single_rack_prefers_least_loaded() {
        let servers: Vec<_> = (1..=5)
            .map(|i| server(&format!("10.0.0.{i}:7000"), "/r1"))
            .collect();
        for n in 100..110 {
            servers[0].add_pending_block(BlockId::from_u128(n));
            servers[1].add_pending_block(BlockId::from_u128(n));
        }

        let placement = ReplicaPlacement::with_seed(GIB, 3);
        let a = placement
            .assign(&block(3, 3), &servers, Some("192.168.1.9"), false)
            .unwrap();
        let mut got = a.servers.clone();
        got.sort();
        assert_eq!(got, vec!["10.0.0.3:7000", "10.0.0.4:7000", "10.0.0.5:7000"]);
        for addr in &a.servers {
            let s = servers.iter().find(|s| s.address() == addr).unwrap();
            assert!(s.is_pending(BlockId::from_u128(3)));
        }
    }

    #[test]
    fn accidental_local_replica_moves_to_front() {
        let servers = vec![
            server("10.0.0.1:7000", "/r1"),
            server("10.0.0.2:7000", "/r1"),
        ];
        let placement = ReplicaPlacement::with_seed(GIB, 11);
        let a = placement
            .assign(&block(4, 2), &servers, Some("10.0.0.1"), false)
            .unwrap();
        assert_eq!(a.servers, vec!["10.0.0.1:7000", "10.0.0.2:7000"]);
    }

    #[test]
    fn ineligible_servers_are_skipped() {
        let servers = two_racks();
        servers[3].record_heartbeat(DiskMetrics::default(), Utc::now());
        let unreported = Arc::new(DataServerInfo::new("10.0.9.9:7000", "/r9"));
        let mut all = servers.clone();
        all.push(unreported);

        let placement = ReplicaPlacement::with_seed(GIB, 5);
        let eligible = placement.eligible_servers(&all, BlockId::from_u128(5));
        assert_eq!(eligible.len(), 5);
        assert!(eligible.iter().all(|s| s.address() != "10.0.2.1:7000"));
    }

    #[test]
    fn caller_errors_and_exhaustion() {
        let servers = two_racks();
        let b = block(6, 3);
        let placement = ReplicaPlacement::with_seed(GIB, 1);

        assert!(matches!(
            placement.assign(&b, &servers, None, true),
            Err(NamespaceError::InvalidArgument(_))
        ));

        servers[0].report_blocks([b.block_id]);
        assert!(matches!(
            placement.assign(&b, &servers, Some("10.0.1.1"), true),
            Err(NamespaceError::InvalidArgument(_))
        ));

        for s in &servers {
            s.report_blocks([b.block_id]);
        }
        let done = placement.assign(&block(6, 3), &servers, None, true).unwrap();
        assert!(done.servers.is_empty());

        let none: Vec<Arc<DataServerInfo>> = Vec::new();
        assert!(matches!(
            placement.assign(&block(7, 1), &none, Some("10.0.0.1"), true),
            Err(NamespaceError::InsufficientServers { required: 1, .. })
        ));
    }
}
