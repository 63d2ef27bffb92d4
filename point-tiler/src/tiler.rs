//! The parallel octree tiler.
//!
//! Callers push point batches of arbitrary size; the tiler accumulates
//! them and periodically runs a processing round that routes every queued
//! point to its octree node: parallel Morton indexing, a stable sort, and
//! a root-down recursion in which each node samples its LOD
//! representatives and hands the rest to its children as independent
//! executor tasks. Nodes keep their accepted points in the points cache
//! until a flush drains them to disk.
//!
//! Two scheduling variants exist. V1 sorts the whole round on one thread;
//! V2 (the default above one worker) partitions the round into `8^k`
//! buckets in parallel and sorts the buckets concurrently. The
//! concatenated bucket order equals V1's stable sort, so both variants
//! produce byte-identical output.

use crate::cache::{BufferHandle, PointsCache};
use crate::config::SamplingStrategy;
use crate::error::{Result, TilerError};
use crate::execution::ExecutionGraph;
use crate::persistence::NodeStorage;
use crate::progress::{ProgressCounter, ProgressReporter, PHASE_FLUSHING, PHASE_SAMPLING};
use crate::sampling::NodeSampler;
use point_data::aabb::Aabb;
use point_data::attributes::AttributeSchema;
use point_data::morton::MortonIndex;
use point_data::PointBuffer;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Name of the root node on disk and in the registry.
pub const ROOT_NODE: &str = "r";

const INDEX_CHUNK: usize = 32 * 1024;

/// Shared cancellation flag for one conversion run. Workers check it
/// between tasks; pending work is skipped once it trips.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Scheduling variant; output is identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilingAlgorithm {
    /// Sequential whole-round sort.
    V1,
    /// Parallel bucketed sort.
    V2,
}

impl TilingAlgorithm {
    pub fn for_concurrency(concurrency: usize) -> Self {
        if concurrency > 1 {
            TilingAlgorithm::V2
        } else {
            TilingAlgorithm::V1
        }
    }
}

/// Meta parameters of one tiling run.
#[derive(Debug, Clone)]
pub struct TilerOptions {
    /// Cubic root bounds in native coordinates.
    pub root_bounds: Aabb,
    /// Minimum point separation at the root; halves per level.
    pub spacing: f64,
    pub max_depth: u32,
    pub internal_node_capacity: usize,
    pub process_threshold: usize,
    pub max_memory_bytes: usize,
    pub sampling: SamplingStrategy,
    pub algorithm: TilingAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Open,
    Sampling,
    Flushed,
    Split,
    Closed,
}

struct NodeState {
    name: String,
    depth: u32,
    bounds: Aabb,
    status: NodeStatus,
    sampler: Option<NodeSampler>,
    /// Accepted LOD points not yet on disk, resident in the points cache
    /// so the memory bound sees them.
    pending: Option<BufferHandle>,
    /// LOD points already in this node's file.
    persisted_count: u64,
    /// Total LOD points, pending included.
    lod_count: u64,
    passed_down: u64,
    /// The next flush must replace the file instead of appending, because
    /// a split re-sampled points that were already persisted.
    rewrite_on_flush: bool,
}

#[derive(Debug, Default)]
struct TilerStats {
    points_stored: AtomicU64,
    discarded_by_depth: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TilerStatsSnapshot {
    pub points_stored: u64,
    pub discarded_by_depth: u64,
}

/// Point accounting of one node, as reported by `Tiler::node_summaries`.
#[derive(Debug, Clone)]
pub struct NodeSummary {
    pub name: String,
    pub status: NodeStatus,
    pub lod_count: u64,
    pub passed_down: u64,
}

struct TilerShared {
    options: TilerOptions,
    storage: Arc<NodeStorage>,
    cache: PointsCache,
    nodes: Mutex<HashMap<String, Arc<Mutex<NodeState>>>>,
    stats: TilerStats,
    sampling_progress: Arc<ProgressCounter>,
    cancel: CancellationToken,
    error: Mutex<Option<TilerError>>,
}

impl TilerShared {
    fn record_error(&self, error: TilerError) {
        let mut slot = self.error.lock().expect("tiler error slot poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
        // Fatal errors drain the executor the same way a cancel does.
        self.cancel.cancel();
    }

    fn take_error(&self) -> Option<TilerError> {
        self.error.lock().expect("tiler error slot poisoned").take()
    }

    fn spacing_at(&self, depth: u32) -> f64 {
        self.options.spacing / f64::from(1u32 << depth.min(31))
    }

    /// Fetches or lazily creates the record of a node. The registry lock
    /// is held only for the lookup; node processing locks the node
    /// itself. A node that already has a payload on disk (INCREMENTAL
    /// append) starts out Flushed with its stored count.
    fn node_record(&self, name: &str) -> Result<Arc<Mutex<NodeState>>> {
        {
            let nodes = self.nodes.lock().expect("node registry poisoned");
            if let Some(record) = nodes.get(name) {
                return Ok(Arc::clone(record));
            }
        }

        // Probe disk outside the registry lock.
        let persisted_count = self.storage.stored_count(name)?.unwrap_or(0);
        let depth = (name.len() - 1) as u32;
        let bounds = self.options.root_bounds.descendant(&name[1..]);

        let mut nodes = self.nodes.lock().expect("node registry poisoned");
        if let Some(record) = nodes.get(name) {
            return Ok(Arc::clone(record));
        }
        let record = Arc::new(Mutex::new(NodeState {
            name: name.to_string(),
            depth,
            bounds,
            status: if persisted_count > 0 {
                NodeStatus::Flushed
            } else {
                NodeStatus::Open
            },
            sampler: None,
            pending: None,
            persisted_count,
            lod_count: persisted_count,
            passed_down: 0,
            rewrite_on_flush: false,
        }));
        nodes.insert(name.to_string(), Arc::clone(&record));
        Ok(record)
    }
}

/// The tiler. Owns the ingest queue; everything else is shared with the
/// worker tasks it spawns.
pub struct Tiler {
    shared: Arc<TilerShared>,
    graph: ExecutionGraph,
    queue: PointBuffer,
    flushing_progress: Arc<ProgressCounter>,
}

impl Tiler {
    pub fn new(
        options: TilerOptions,
        schema: AttributeSchema,
        storage: Arc<NodeStorage>,
        graph: ExecutionGraph,
        progress: &ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        let sampling_progress = progress.register_integer(PHASE_SAMPLING, 0);
        let flushing_progress = progress.register_integer(PHASE_FLUSHING, 0);
        let shared = Arc::new(TilerShared {
            options,
            storage,
            cache: PointsCache::new(),
            nodes: Mutex::new(HashMap::new()),
            stats: TilerStats::default(),
            sampling_progress,
            cancel,
            error: Mutex::new(None),
        });
        Self {
            shared,
            graph,
            queue: PointBuffer::new(schema),
            flushing_progress,
        }
    }

    pub fn stats(&self) -> TilerStatsSnapshot {
        TilerStatsSnapshot {
            points_stored: self.shared.stats.points_stored.load(Ordering::Relaxed),
            discarded_by_depth: self
                .shared
                .stats
                .discarded_by_depth
                .load(Ordering::Relaxed),
        }
    }

    /// Per-node accounting of all live nodes, sorted by name. For every
    /// node the LOD points it kept plus the points it passed down equal
    /// the points routed through it.
    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        let nodes = self.shared.nodes.lock().expect("node registry poisoned");
        let mut summaries: Vec<NodeSummary> = nodes
            .iter()
            .map(|(name, record)| {
                let node = record.lock().expect("node state poisoned");
                NodeSummary {
                    name: name.clone(),
                    status: node.status,
                    lod_count: node.lod_count,
                    passed_down: node.passed_down,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Queues a batch. Runs a processing round once enough points are
    /// queued or the memory estimate exceeds the bound; no new batches
    /// are admitted while a round runs.
    pub fn add(&mut self, batch: PointBuffer) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(TilerError::Cancelled);
        }
        self.queue.append(batch);

        let over_threshold = self.queue.len() >= self.shared.options.process_threshold;
        let over_memory = self.memory_estimate() > self.shared.options.max_memory_bytes;
        if over_threshold || over_memory {
            self.process_round()?;
        }
        if self.shared.cache.resident_bytes() > self.shared.options.max_memory_bytes {
            self.flush_to_disk(false)?;
        }
        Ok(())
    }

    /// Processes everything still queued and persists every node; all
    /// live nodes end up Closed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.queue.is_empty() {
            self.process_round()?;
        }
        self.flush_to_disk(true)
    }

    fn memory_estimate(&self) -> usize {
        self.queue.memory_usage() + self.shared.cache.resident_bytes()
    }

    /// One sub-DAG: index, sort, recurse, wait for quiescence.
    fn process_round(&mut self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(TilerError::Cancelled);
        }
        let schema = self.queue.schema().clone();
        let points = std::mem::replace(&mut self.queue, PointBuffer::new(schema));
        if points.is_empty() {
            return Ok(());
        }

        let root = self.shared.options.root_bounds;
        let keys: Vec<MortonIndex> = points
            .positions()
            .par_chunks(INDEX_CHUNK)
            .flat_map_iter(|chunk| {
                chunk
                    .iter()
                    .map(move |&p| MortonIndex::from_point(&root, p))
            })
            .collect();

        let order = match self.shared.options.algorithm {
            TilingAlgorithm::V1 => sort_sequential(&keys),
            TilingAlgorithm::V2 => sort_bucketed(&keys, self.graph.concurrency()),
        };
        let sorted_points = points.gather(&order);
        let sorted_keys: Vec<MortonIndex> = order.iter().map(|&i| keys[i]).collect();

        spawn_node_task(
            &self.shared,
            &self.graph,
            ROOT_NODE.to_string(),
            sorted_points,
            sorted_keys,
        );
        self.graph.wait_all();

        if let Some(error) = self.shared.take_error() {
            return Err(error);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(TilerError::Cancelled);
        }
        Ok(())
    }

    /// Drains every node's pending LOD points to disk through store tasks
    /// on the executor. A final drain closes all nodes; an internal one
    /// (memory pressure) leaves them reopenable.
    fn flush_to_disk(&mut self, close: bool) -> Result<()> {
        let records: Vec<Arc<Mutex<NodeState>>> = {
            let nodes = self.shared.nodes.lock().expect("node registry poisoned");
            nodes.values().map(Arc::clone).collect()
        };

        for record in &records {
            let mut node = record.lock().expect("node state poisoned");
            let pending = node.pending.take().map(|handle| self.shared.cache.take(handle));
            let rewrite = node.rewrite_on_flush;
            node.rewrite_on_flush = false;

            let has_work = pending.is_some() || rewrite;
            if has_work {
                self.flushing_progress.add_to_max(1);
                let name = node.name.clone();
                let buffer = pending.unwrap_or_else(|| {
                    PointBuffer::new(self.queue.schema().clone())
                });
                node.persisted_count += buffer.len() as u64;
                if node.status != NodeStatus::Split {
                    node.status = NodeStatus::Flushed;
                }
                drop(node);

                let shared = Arc::clone(&self.shared);
                let progress = Arc::clone(&self.flushing_progress);
                self.graph.spawn(move || {
                    if shared.cancel.is_cancelled() {
                        return;
                    }
                    let result = if rewrite {
                        shared.storage.store(&name, &buffer)
                    } else {
                        shared.storage.append(&name, &buffer)
                    };
                    if let Err(error) = result {
                        shared.record_error(error);
                    }
                    progress.inc(1);
                });
            }
        }
        self.graph.wait_all();

        if let Some(error) = self.shared.take_error() {
            return Err(error);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(TilerError::Cancelled);
        }

        if close {
            // Store tasks for the whole subtree have completed above;
            // only now may anything transition to Closed.
            for record in &records {
                let mut node = record.lock().expect("node state poisoned");
                node.status = NodeStatus::Closed;
                node.sampler = None;
            }
        }
        Ok(())
    }
}

/// Stable sort of a round by Morton key, single-threaded.
fn sort_sequential(keys: &[MortonIndex]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&i| keys[i]);
    order
}

/// Parallel partition into `8^k` buckets by leading octant digits, then
/// parallel per-bucket stable sorts. Bucket concatenation equals the
/// sequential stable sort because the leading digits are the key's high
/// bits and chunk-ordered merging preserves input order within a bucket.
fn sort_bucketed(keys: &[MortonIndex], concurrency: usize) -> Vec<usize> {
    let digits = pivot_digits(concurrency);
    let bucket_count = 1usize << (3 * digits);

    let partials: Vec<Vec<Vec<usize>>> = keys
        .par_chunks(INDEX_CHUNK)
        .enumerate()
        .map(|(chunk_index, chunk)| {
            let base = chunk_index * INDEX_CHUNK;
            let mut buckets = vec![Vec::new(); bucket_count];
            for (offset, key) in chunk.iter().enumerate() {
                buckets[key.prefix(digits) as usize].push(base + offset);
            }
            buckets
        })
        .collect();

    let mut buckets = vec![Vec::new(); bucket_count];
    for partial in partials {
        for (bucket, mut indices) in partial.into_iter().enumerate() {
            buckets[bucket].append(&mut indices);
        }
    }

    buckets
        .par_iter_mut()
        .for_each(|bucket| bucket.sort_by_key(|&i| keys[i]));
    buckets.concat()
}

/// Smallest digit count whose bucket fan-out covers the worker count.
fn pivot_digits(concurrency: usize) -> u32 {
    let mut digits = 1;
    while (1usize << (3 * digits)) < concurrency && digits < 4 {
        digits += 1;
    }
    digits as u32
}

fn spawn_node_task(
    shared: &Arc<TilerShared>,
    graph: &ExecutionGraph,
    name: String,
    points: PointBuffer,
    keys: Vec<MortonIndex>,
) {
    let handle = shared.cache.insert(points);
    let shared = Arc::clone(shared);
    let task_graph = graph.clone();
    graph.spawn(move || {
        let points = shared.cache.take(handle);
        if shared.cancel.is_cancelled() {
            return;
        }
        process_node(&shared, &task_graph, &name, points, keys);
    });
}

/// Routes one batch of points through one node: leaf accumulation, split
/// on capacity overflow, sampling for already-split nodes, depth-cap
/// discards. Children are spawned as further tasks; sibling subtrees
/// never share state, so the node lock is uncontended.
fn process_node(
    shared: &Arc<TilerShared>,
    graph: &ExecutionGraph,
    name: &str,
    points: PointBuffer,
    keys: Vec<MortonIndex>,
) {
    let record = match shared.node_record(name) {
        Ok(record) => record,
        Err(error) => {
            shared.record_error(error);
            return;
        }
    };
    let mut node = record.lock().expect("node state poisoned");
    debug_assert_ne!(node.status, NodeStatus::Closed);

    let incoming = points.len() as u64;
    let capacity = shared.options.internal_node_capacity as u64;

    if node.status == NodeStatus::Split {
        let children = sample_into_node(shared, &mut node, points, &keys);
        drop(node);
        spawn_children(shared, graph, name, children);
        return;
    }

    if node.depth >= shared.options.max_depth {
        // Depth cap: keep the first points that still fit, count the rest
        // as discarded. No children are ever created here.
        let room = capacity.saturating_sub(node.lod_count) as usize;
        let keep = room.min(points.len());
        let mut points = points;
        let kept = points.take_prefix(keep);
        let discarded = points.len() as u64;
        append_pending(shared, &mut node, kept);
        shared
            .stats
            .discarded_by_depth
            .fetch_add(discarded, Ordering::Relaxed);
        shared.sampling_progress.inc(incoming);
        return;
    }

    if node.lod_count + incoming <= capacity {
        // Leaf with room: every routed point is an LOD point.
        append_pending(shared, &mut node, points);
        node.status = NodeStatus::Open;
        shared.sampling_progress.inc(incoming);
        return;
    }

    // Capacity exceeded: the node splits. Everything it ever held is
    // re-sampled together with the incoming points, in arrival order.
    let mut combined = PointBuffer::new(points.schema().clone());
    if node.persisted_count > 0 {
        match shared.storage.load_native(&node.name) {
            Ok(stored) => combined.append(stored),
            Err(error) => {
                shared.record_error(error);
                return;
            }
        }
        node.persisted_count = 0;
        node.rewrite_on_flush = true;
    }
    if let Some(handle) = node.pending.take() {
        combined.append(shared.cache.take(handle));
    }
    combined.append(points);

    let root = shared.options.root_bounds;
    let combined_keys: Vec<MortonIndex> = combined
        .positions()
        .iter()
        .map(|&p| MortonIndex::from_point(&root, p))
        .collect();

    // The node's previous LOD points are back in flight and will be
    // counted again wherever they land.
    shared
        .stats
        .points_stored
        .fetch_sub(node.lod_count, Ordering::Relaxed);
    node.lod_count = 0;
    node.sampler = Some(NodeSampler::for_node(
        shared.options.sampling,
        &node.bounds,
        shared.spacing_at(node.depth),
        &node.name,
    ));

    let children = sample_into_node(shared, &mut node, combined, &combined_keys);
    node.status = NodeStatus::Split;
    drop(node);
    spawn_children(shared, graph, name, children);
}

/// Runs the node's sampler over a batch: accepted points join the pending
/// LOD payload, rejected points partition into per-octant child batches.
fn sample_into_node(
    shared: &Arc<TilerShared>,
    node: &mut NodeState,
    points: PointBuffer,
    keys: &[MortonIndex],
) -> Vec<(u8, PointBuffer, Vec<MortonIndex>)> {
    node.status = NodeStatus::Sampling;
    let sampler = node.sampler.as_mut().expect("split node has a sampler");
    let outcome = sampler.sample(&points);

    let accepted = points.gather(&outcome.accepted);
    append_pending(shared, node, accepted);

    let depth = node.depth;
    let mut octant_indices: [Vec<usize>; 8] = Default::default();
    for &index in &outcome.rejected {
        octant_indices[keys[index].octant_at(depth) as usize].push(index);
    }
    node.passed_down += outcome.rejected.len() as u64;
    node.status = NodeStatus::Split;
    shared.sampling_progress.inc(points.len() as u64);

    octant_indices
        .iter()
        .enumerate()
        .filter(|(_, indices)| !indices.is_empty())
        .map(|(octant, indices)| {
            let child_points = points.gather(indices);
            let child_keys = indices.iter().map(|&i| keys[i]).collect();
            (octant as u8, child_points, child_keys)
        })
        .collect()
}

fn append_pending(shared: &Arc<TilerShared>, node: &mut NodeState, points: PointBuffer) {
    if points.is_empty() {
        return;
    }
    let count = points.len() as u64;
    let merged = match node.pending.take() {
        Some(handle) => {
            let mut pending = shared.cache.take(handle);
            pending.append(points);
            pending
        }
        None => points,
    };
    node.pending = Some(shared.cache.insert(merged));
    node.lod_count += count;
    shared
        .stats
        .points_stored
        .fetch_add(count, Ordering::Relaxed);
}

fn spawn_children(
    shared: &Arc<TilerShared>,
    graph: &ExecutionGraph,
    parent: &str,
    children: Vec<(u8, PointBuffer, Vec<MortonIndex>)>,
) {
    for (octant, points, keys) in children {
        let child_name = format!("{}{}", parent, octant);
        spawn_node_task(shared, graph, child_name, points, keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivot_digits_cover_concurrency() {
        assert_eq!(pivot_digits(1), 1);
        assert_eq!(pivot_digits(8), 1);
        assert_eq!(pivot_digits(9), 2);
        assert_eq!(pivot_digits(64), 2);
        assert_eq!(pivot_digits(65), 3);
    }

    #[test]
    fn bucketed_sort_equals_sequential_sort() {
        let root = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        // A deterministic pseudo-random scatter with duplicates, so the
        // stable tie-break is actually exercised.
        let mut state = 0x1234_5678u64;
        let mut positions = Vec::new();
        for _ in 0..10_000 {
            let mut next = || {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                ((state >> 33) as f64) / ((1u64 << 31) as f64)
            };
            let p = [next(), next(), next()];
            positions.push(p);
            if positions.len() % 7 == 0 {
                positions.push(p);
            }
        }
        let keys: Vec<MortonIndex> = positions
            .iter()
            .map(|&p| MortonIndex::from_point(&root, p))
            .collect();

        let sequential = sort_sequential(&keys);
        for concurrency in [2, 4, 16, 100] {
            assert_eq!(sort_bucketed(&keys, concurrency), sequential);
        }
    }

    #[test]
    fn cancellation_token_trips_once() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn algorithm_defaults_to_v2_when_parallel() {
        assert_eq!(TilingAlgorithm::for_concurrency(1), TilingAlgorithm::V1);
        assert_eq!(TilingAlgorithm::for_concurrency(8), TilingAlgorithm::V2);
    }
}
