//! Shared-memory graph segment
//!
//! In-region layout (all integers little-endian, accessed by byte offset):
//!
//! ```text
//! header        magic, vertex capacity, block capacity, blocks-used counter
//! vertex table  capacity × { head block index, out-degree }
//! block arena   block capacity × { next block index, used slots,
//!                                  14 × { target vertex, weight } }
//! ```
//!
//! Adjacency is a chain of fixed-size edge blocks per vertex. Deleting an
//! edge tombstones its slot (`NIL` target); inserts reuse tombstones before
//! growing the chain. Active-vertex and total-edge counts are derived from
//! the vertex table on demand, never cached in the header.
//!
//! Ownership: the handle that allocated or restored the region owns its
//! lifecycle and is the only one that unlinks it on `release`. Read-only
//! attachments are non-owning views and must not outlive the owner's region.

use std::path::Path;

use memmap2::{Mmap, MmapMut};
use rayon::prelude::*;

use crate::error::SegmentError;
use crate::shm;
use crate::snapshot;

const MAGIC: &[u8; 8] = b"SKEINGR1";
const HEADER_LEN: usize = 32;
const BLOCKS_USED_OFF: usize = 24;
const VERTEX_ENTRY_LEN: usize = 16;
const BLOCK_HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 16;

/// Edge slots per block.
const EDGES_PER_BLOCK: usize = 14;
const BLOCK_LEN: usize = BLOCK_HEADER_LEN + EDGES_PER_BLOCK * SLOT_LEN;

/// Edge blocks provisioned per vertex of capacity.
const BLOCKS_PER_VERTEX: u64 = 2;

/// Sentinel: "no block" in chain links, "deleted" in target slots.
const NIL: u64 = u64::MAX;

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// Result of a structural validation pass over a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub vertices_checked: u64,
    pub violations: u64,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.violations == 0
    }
}

impl std::fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} violations across {} vertices",
            self.violations, self.vertices_checked
        )
    }
}

/// Handle to a named shared-memory graph region.
pub struct GraphSegment {
    name: String,
    map: Option<Mapping>,
    owner: bool,
    capacity: u64,
    block_cap: u64,
}

impl std::fmt::Debug for GraphSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSegment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("owner", &self.owner)
            .field("released", &self.map.is_none())
            .finish_non_exhaustive()
    }
}

impl Drop for GraphSegment {
    fn drop(&mut self) {
        self.release();
    }
}

impl GraphSegment {
    /// Allocate a fresh, empty graph region for up to `capacity` vertices.
    pub fn allocate(name: &str, capacity: u64) -> Result<Self, SegmentError> {
        if capacity == 0 {
            return Err(SegmentError::InvalidCapacity(capacity));
        }
        let block_cap = capacity * BLOCKS_PER_VERTEX;
        let len = segment_len(capacity, block_cap);
        let mut map = shm::create_region(name, len).map_err(|e| SegmentError::Io {
            path: shm::region_path(name),
            source: e,
        })?;

        map[0..8].copy_from_slice(MAGIC);
        put_u64(&mut map, 8, capacity);
        put_u64(&mut map, 16, block_cap);
        put_u64(&mut map, BLOCKS_USED_OFF, 0);
        // the region is zeroed; only the head links need a non-zero init
        for v in 0..capacity {
            put_u64(&mut map, vertex_off(v), NIL);
        }

        Ok(Self {
            name: name.to_string(),
            map: Some(Mapping::ReadWrite(map)),
            owner: true,
            capacity,
            block_cap,
        })
    }

    /// Recreate a graph region from a snapshot written by [`persist`].
    ///
    /// [`persist`]: GraphSegment::persist
    pub fn restore(name: &str, path: &Path) -> Result<Self, SegmentError> {
        let image = snapshot::read_snapshot(path)?;
        let (capacity, block_cap) = validate_image(&image)?;
        let mut map = shm::create_region(name, image.len() as u64).map_err(|e| {
            SegmentError::Io {
                path: shm::region_path(name),
                source: e,
            }
        })?;
        map.copy_from_slice(&image);
        Ok(Self {
            name: name.to_string(),
            map: Some(Mapping::ReadWrite(map)),
            owner: true,
            capacity,
            block_cap,
        })
    }

    /// Non-owning read-only view of an existing region, located by name.
    pub fn attach(name: &str) -> Result<Self, SegmentError> {
        let map = shm::open_region(name).map_err(|e| SegmentError::Io {
            path: shm::region_path(name),
            source: e,
        })?;
        let (capacity, block_cap) = validate_image(&map)?;
        Ok(Self {
            name: name.to_string(),
            map: Some(Mapping::ReadOnly(map)),
            owner: false,
            capacity,
            block_cap,
        })
    }

    /// Unmap the region and, for the owning handle, unlink it from the
    /// shared-memory namespace. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if self.map.take().is_none() {
            return;
        }
        if !self.owner {
            return;
        }
        match shm::unlink_region(&self.name) {
            Ok(true) => log::debug!("unlinked graph region {}", self.name),
            Ok(false) => log::debug!("graph region {} was already unlinked", self.name),
            Err(e) => log::warn!("failed to unlink graph region {}: {e}", self.name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total region size in bytes.
    pub fn byte_len(&self) -> u64 {
        segment_len(self.capacity, self.block_cap)
    }

    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }

    fn data(&self) -> Option<&[u8]> {
        match &self.map {
            Some(Mapping::ReadWrite(m)) => Some(&m[..]),
            Some(Mapping::ReadOnly(m)) => Some(&m[..]),
            None => None,
        }
    }

    fn data_mut(&mut self) -> Result<&mut [u8], SegmentError> {
        match &mut self.map {
            Some(Mapping::ReadWrite(m)) => Ok(&mut m[..]),
            Some(Mapping::ReadOnly(_)) => Err(SegmentError::ReadOnly),
            None => Err(SegmentError::Released),
        }
    }

    fn check_vertex(&self, vertex: u64) -> Result<(), SegmentError> {
        if vertex >= self.capacity {
            return Err(SegmentError::VertexOutOfRange {
                vertex,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Insert the edge `src → dst`, reusing a tombstoned slot when one
    /// exists. Returns false if the edge was already present (its weight is
    /// updated in place).
    pub fn insert_edge(&mut self, src: u64, dst: u64, weight: i64) -> Result<bool, SegmentError> {
        self.check_vertex(src)?;
        self.check_vertex(dst)?;
        let capacity = self.capacity;
        let block_cap = self.block_cap;
        let buf = self.data_mut()?;

        let voff = vertex_off(src);
        let mut block = get_u64(buf, voff);
        let mut last = NIL;
        let mut free_slot: Option<(u64, usize)> = None;
        let mut hops = 0u64;
        while block != NIL {
            hops += 1;
            if block >= block_cap || hops > block_cap {
                return Err(SegmentError::BadImage(format!(
                    "corrupt block chain for vertex {src}"
                )));
            }
            let boff = block_off(capacity, block);
            let used = (get_u64(buf, boff + 8) as usize).min(EDGES_PER_BLOCK);
            for slot in 0..used {
                let soff = slot_off(capacity, block, slot);
                let target = get_u64(buf, soff);
                if target == dst {
                    put_i64(buf, soff + 8, weight);
                    return Ok(false);
                }
                if target == NIL && free_slot.is_none() {
                    free_slot = Some((block, slot));
                }
            }
            if used < EDGES_PER_BLOCK && free_slot.is_none() {
                free_slot = Some((block, used));
            }
            last = block;
            block = get_u64(buf, boff);
        }

        let (block, slot) = match free_slot {
            Some(found) => found,
            None => {
                // grow the chain by one block from the arena
                let next = get_u64(buf, BLOCKS_USED_OFF);
                if next >= block_cap {
                    return Err(SegmentError::ArenaFull { blocks: block_cap });
                }
                put_u64(buf, BLOCKS_USED_OFF, next + 1);
                let boff = block_off(capacity, next);
                put_u64(buf, boff, NIL);
                put_u64(buf, boff + 8, 0);
                if last == NIL {
                    put_u64(buf, voff, next);
                } else {
                    put_u64(buf, block_off(capacity, last), next);
                }
                (next, 0)
            }
        };

        let boff = block_off(capacity, block);
        let used = get_u64(buf, boff + 8) as usize;
        if slot == used {
            put_u64(buf, boff + 8, (used + 1) as u64);
        }
        let soff = slot_off(capacity, block, slot);
        put_u64(buf, soff, dst);
        put_i64(buf, soff + 8, weight);
        put_u64(buf, voff + 8, get_u64(buf, voff + 8) + 1);
        Ok(true)
    }

    /// Remove the edge `src → dst`. Returns false if it was not present.
    pub fn delete_edge(&mut self, src: u64, dst: u64) -> Result<bool, SegmentError> {
        self.check_vertex(src)?;
        self.check_vertex(dst)?;
        let capacity = self.capacity;
        let block_cap = self.block_cap;
        let buf = self.data_mut()?;

        let voff = vertex_off(src);
        let mut block = get_u64(buf, voff);
        let mut hops = 0u64;
        while block != NIL {
            hops += 1;
            if block >= block_cap || hops > block_cap {
                return Err(SegmentError::BadImage(format!(
                    "corrupt block chain for vertex {src}"
                )));
            }
            let boff = block_off(capacity, block);
            let used = (get_u64(buf, boff + 8) as usize).min(EDGES_PER_BLOCK);
            for slot in 0..used {
                let soff = slot_off(capacity, block, slot);
                if get_u64(buf, soff) == dst {
                    put_u64(buf, soff, NIL);
                    let degree = get_u64(buf, voff + 8);
                    put_u64(buf, voff + 8, degree.saturating_sub(1));
                    return Ok(true);
                }
            }
            block = get_u64(buf, boff);
        }
        Ok(false)
    }

    /// Weight of the edge `src → dst`, if present.
    pub fn edge_weight(&self, src: u64, dst: u64) -> Option<i64> {
        let buf = self.data()?;
        if src >= self.capacity {
            return None;
        }
        let mut block = get_u64(buf, vertex_off(src));
        let mut hops = 0u64;
        while block != NIL && block < self.block_cap && hops <= self.block_cap {
            hops += 1;
            let boff = block_off(self.capacity, block);
            let used = (get_u64(buf, boff + 8) as usize).min(EDGES_PER_BLOCK);
            for slot in 0..used {
                let soff = slot_off(self.capacity, block, slot);
                if get_u64(buf, soff) == dst {
                    return Some(get_i64(buf, soff + 8));
                }
            }
            block = get_u64(buf, boff);
        }
        None
    }

    /// Number of vertices with at least one outgoing edge. Recomputed from
    /// the vertex table; a released segment reports zero.
    pub fn active_vertices(&self) -> u64 {
        let Some(buf) = self.data() else { return 0 };
        (0..self.capacity)
            .filter(|&v| get_u64(buf, vertex_off(v) + 8) > 0)
            .count() as u64
    }

    /// Total live edges, recomputed from the vertex table.
    pub fn total_edges(&self) -> u64 {
        let Some(buf) = self.data() else { return 0 };
        (0..self.capacity)
            .map(|v| get_u64(buf, vertex_off(v) + 8))
            .sum()
    }

    /// Read-only structural validation: block links in range, no chain
    /// cycles, slot targets within capacity, per-vertex degree equal to the
    /// live slots in its chain. Safe to run at any time, including while a
    /// writer is active (a torn read can only misreport, never corrupt).
    pub fn consistency_check(&self) -> ConsistencyReport {
        let Some(buf) = self.data() else {
            return ConsistencyReport {
                vertices_checked: 0,
                violations: 0,
            };
        };
        let capacity = self.capacity;
        let block_cap = self.block_cap;
        let blocks_used = get_u64(buf, BLOCKS_USED_OFF);
        let mut violations = u64::from(blocks_used > block_cap);
        let blocks_used = blocks_used.min(block_cap);

        violations += (0..capacity)
            .into_par_iter()
            .map(|v| check_chain(buf, capacity, blocks_used, v))
            .sum::<u64>();

        ConsistencyReport {
            vertices_checked: capacity,
            violations,
        }
    }

    /// Serialize the full region to a snapshot file. The caller must have
    /// stopped ingestion first; this layer provides no snapshot-under-
    /// mutation guarantee.
    pub fn persist(&self, path: &Path) -> Result<(), SegmentError> {
        let image = self.data().ok_or(SegmentError::Released)?;
        snapshot::write_snapshot(image, path)?;
        Ok(())
    }
}

/// Violations in one vertex's block chain.
fn check_chain(buf: &[u8], capacity: u64, blocks_used: u64, vertex: u64) -> u64 {
    let voff = vertex_off(vertex);
    let degree = get_u64(buf, voff + 8);
    let mut violations = 0u64;
    let mut live = 0u64;
    let mut block = get_u64(buf, voff);
    let mut hops = 0u64;
    while block != NIL {
        hops += 1;
        if block >= blocks_used || hops > blocks_used {
            // dangling link or cycle; the rest of the chain is unreadable
            return violations + 1;
        }
        let boff = block_off(capacity, block);
        let used = get_u64(buf, boff + 8);
        if used > EDGES_PER_BLOCK as u64 {
            violations += 1;
        }
        for slot in 0..(used.min(EDGES_PER_BLOCK as u64) as usize) {
            let target = get_u64(buf, slot_off(capacity, block, slot));
            if target == NIL {
                continue;
            }
            if target >= capacity {
                violations += 1;
            } else {
                live += 1;
            }
        }
        block = get_u64(buf, boff);
    }
    if live != degree {
        violations += 1;
    }
    violations
}

fn segment_len(capacity: u64, block_cap: u64) -> u64 {
    HEADER_LEN as u64 + capacity * VERTEX_ENTRY_LEN as u64 + block_cap * BLOCK_LEN as u64
}

/// Header sanity for a mapped or deserialized image: magic, capacity, and
/// the exact length the header claims.
fn validate_image(image: &[u8]) -> Result<(u64, u64), SegmentError> {
    if image.len() < HEADER_LEN {
        return Err(SegmentError::BadImage("truncated header".to_string()));
    }
    if &image[0..8] != MAGIC {
        return Err(SegmentError::BadImage("bad magic".to_string()));
    }
    let capacity = get_u64(image, 8);
    let block_cap = get_u64(image, 16);
    if capacity == 0 {
        return Err(SegmentError::BadImage("zero capacity".to_string()));
    }
    if segment_len(capacity, block_cap) != image.len() as u64 {
        return Err(SegmentError::BadImage("length mismatch".to_string()));
    }
    if get_u64(image, BLOCKS_USED_OFF) > block_cap {
        return Err(SegmentError::BadImage(
            "block counter out of range".to_string(),
        ));
    }
    Ok((capacity, block_cap))
}

fn vertex_off(vertex: u64) -> usize {
    HEADER_LEN + vertex as usize * VERTEX_ENTRY_LEN
}

fn block_off(capacity: u64, block: u64) -> usize {
    HEADER_LEN + capacity as usize * VERTEX_ENTRY_LEN + block as usize * BLOCK_LEN
}

fn slot_off(capacity: u64, block: u64, slot: usize) -> usize {
    block_off(capacity, block) + BLOCK_HEADER_LEN + slot * SLOT_LEN
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8-byte slice"))
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().expect("8-byte slice"))
}

fn put_i64(buf: &mut [u8], off: usize, val: i64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "skein-seg-test-{}-{}-{tag}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn fresh_graph_is_empty_and_consistent() {
        let mut seg = GraphSegment::allocate(&unique_name("fresh"), 64).unwrap();
        assert_eq!(seg.active_vertices(), 0);
        assert_eq!(seg.total_edges(), 0);
        let report = seg.consistency_check();
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.vertices_checked, 64);
        seg.release();
    }

    #[test]
    fn insert_and_delete_track_counts() {
        let mut seg = GraphSegment::allocate(&unique_name("counts"), 16).unwrap();
        assert!(seg.insert_edge(1, 2, 5).unwrap());
        assert!(seg.insert_edge(2, 3, 1).unwrap());
        assert_eq!(seg.active_vertices(), 2);
        assert_eq!(seg.total_edges(), 2);

        assert!(seg.delete_edge(2, 3).unwrap());
        assert!(!seg.delete_edge(2, 3).unwrap());
        assert_eq!(seg.active_vertices(), 1);
        assert_eq!(seg.total_edges(), 1);
        assert!(seg.consistency_check().is_clean());
        seg.release();
    }

    #[test]
    fn duplicate_insert_updates_weight_in_place() {
        let mut seg = GraphSegment::allocate(&unique_name("dup"), 8).unwrap();
        assert!(seg.insert_edge(0, 1, 10).unwrap());
        assert!(!seg.insert_edge(0, 1, 20).unwrap());
        assert_eq!(seg.total_edges(), 1);
        assert_eq!(seg.edge_weight(0, 1), Some(20));
        seg.release();
    }

    #[test]
    fn tombstones_are_reused_before_growing() {
        let mut seg = GraphSegment::allocate(&unique_name("tomb"), 8).unwrap();
        for dst in 1..5 {
            seg.insert_edge(0, dst, 1).unwrap();
        }
        seg.delete_edge(0, 2).unwrap();
        seg.insert_edge(0, 7, 1).unwrap();
        assert_eq!(seg.total_edges(), 4);
        assert!(seg.consistency_check().is_clean());
        seg.release();
    }

    #[test]
    fn long_chains_span_multiple_blocks() {
        let mut seg = GraphSegment::allocate(&unique_name("chain"), 64).unwrap();
        // 40 out-edges needs three 14-slot blocks
        for dst in 1..41 {
            assert!(seg.insert_edge(0, dst, dst as i64).unwrap());
        }
        assert_eq!(seg.total_edges(), 40);
        assert_eq!(seg.active_vertices(), 1);
        assert_eq!(seg.edge_weight(0, 40), Some(40));
        assert!(seg.consistency_check().is_clean());
        seg.release();
    }

    #[test]
    fn out_of_range_vertex_is_rejected() {
        let mut seg = GraphSegment::allocate(&unique_name("range"), 4).unwrap();
        assert!(matches!(
            seg.insert_edge(0, 4, 1),
            Err(SegmentError::VertexOutOfRange { vertex: 4, .. })
        ));
        seg.release();
    }

    #[test]
    fn release_is_idempotent_and_unlinks() {
        let name = unique_name("release");
        let mut seg = GraphSegment::allocate(&name, 8).unwrap();
        assert!(shm::region_exists(&name));
        seg.release();
        assert!(!shm::region_exists(&name));
        assert!(seg.is_released());
        seg.release(); // no-op
        assert!(matches!(seg.insert_edge(0, 1, 1), Err(SegmentError::Released)));
    }

    #[test]
    fn attachments_read_but_never_write() {
        let name = unique_name("attach");
        let mut seg = GraphSegment::allocate(&name, 8).unwrap();
        seg.insert_edge(3, 4, 9).unwrap();

        let mut view = GraphSegment::attach(&name).unwrap();
        assert_eq!(view.total_edges(), 1);
        assert_eq!(view.edge_weight(3, 4), Some(9));
        assert!(matches!(
            view.insert_edge(0, 1, 1),
            Err(SegmentError::ReadOnly)
        ));

        // a non-owning view never unlinks the region
        view.release();
        assert!(shm::region_exists(&name));
        seg.release();
        assert!(!shm::region_exists(&name));
    }

    #[test]
    fn persist_then_restore_preserves_counts() {
        let dir = tempfile::tempdir().unwrap();
        let snap = dir.path().join("g.snapshot");

        let mut seg = GraphSegment::allocate(&unique_name("persist"), 32).unwrap();
        for dst in 1..10 {
            seg.insert_edge(0, dst, dst as i64).unwrap();
        }
        seg.delete_edge(0, 5).unwrap();
        let (vertices, edges) = (seg.active_vertices(), seg.total_edges());
        seg.persist(&snap).unwrap();
        seg.release();

        let mut restored = GraphSegment::restore(&unique_name("restored"), &snap).unwrap();
        assert_eq!(restored.active_vertices(), vertices);
        assert_eq!(restored.total_edges(), edges);
        assert_eq!(restored.edge_weight(0, 5), None);
        assert_eq!(restored.edge_weight(0, 6), Some(6));
        assert!(restored.consistency_check().is_clean());
        restored.release();
    }

    #[test]
    fn corrupt_degree_is_reported_not_fatal() {
        let name = unique_name("corrupt");
        let mut seg = GraphSegment::allocate(&name, 8).unwrap();
        seg.insert_edge(1, 2, 1).unwrap();
        // forge a degree the chain cannot account for
        if let Some(Mapping::ReadWrite(map)) = &mut seg.map {
            put_u64(map, vertex_off(1) + 8, 7);
        }
        let report = seg.consistency_check();
        assert_eq!(report.violations, 1);
        seg.release();
    }
}
