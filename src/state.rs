//! Buffered simulation state
//!
//! Tick-varying attributes (positions) live in [`DoubleBuffer`] pairs: a tick
//! reads `current` and writes `next`, then [`SimulationState::swap_buffers`]
//! flips the roles without copying. Anything that needs committed state
//! (selection, host mirrors) reads `current`.
//!
//! Adjacency arrays are uploaded once per dataset and never double-buffered.

use crate::device::{DeviceBuffer, DeviceContext};
use crate::error::{DeviceOp, DeviceOperationFailure, LayoutError, Result};
use crate::storage::GraphFrame;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Name of the point position pair (`[f32; 2]` per point)
pub const POINT_POSITIONS: &str = "point_positions";
/// CSR offsets of outgoing edges (`num_points + 1` entries)
pub const FORWARD_OFFSETS: &str = "forward_offsets";
/// Destination point of each outgoing edge
pub const FORWARD_DESTINATIONS: &str = "forward_destinations";
/// CSR offsets of incoming edges (`num_points + 1` entries)
pub const BACKWARD_OFFSETS: &str = "backward_offsets";
/// Source point of each incoming edge
pub const BACKWARD_SOURCES: &str = "backward_sources";
/// Total (in + out) degree per point
pub const DEGREES: &str = "degrees";

/// Size in bytes of one position element
pub const POSITION_SIZE: usize = std::mem::size_of::<[f32; 2]>();

/// Memoized named device buffers
///
/// A request reuses the existing buffer while its byte length suffices and
/// reallocates only when the request is larger.
#[derive(Debug)]
pub struct BufferPool {
    device: DeviceContext,
    entries: tokio::sync::Mutex<HashMap<String, DeviceBuffer>>,
    allocations: AtomicU64,
}

impl BufferPool {
    /// Empty pool on `device`
    #[must_use]
    pub fn new(device: DeviceContext) -> Self {
        Self {
            device,
            entries: tokio::sync::Mutex::new(HashMap::new()),
            allocations: AtomicU64::new(0),
        }
    }

    /// Buffer `name` holding at least `elements × elem_size` bytes
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if the size overflows or allocation fails
    pub async fn acquire(
        &self,
        name: &str,
        elements: usize,
        elem_size: usize,
    ) -> std::result::Result<DeviceBuffer, DeviceOperationFailure> {
        let byte_len = elements
            .checked_mul(elem_size)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                DeviceOperationFailure::new(DeviceOp::Allocate, name, "size overflows u64")
            })?;

        // Held across the allocation so concurrent requests share one buffer
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(name) {
            if existing.byte_len() >= byte_len {
                return Ok(existing.clone());
            }
            tracing::debug!(
                buffer = name,
                from = existing.byte_len(),
                to = byte_len,
                "growing pooled buffer"
            );
        }

        let buffer = self.device.create_buffer(name, byte_len).await?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        entries.insert(name.to_owned(), buffer.clone());
        Ok(buffer)
    }

    /// Current buffer for `name`, if any was acquired
    pub async fn get(&self, name: &str) -> Option<DeviceBuffer> {
        self.entries.lock().await.get(name).cloned()
    }

    /// Number of device allocations performed so far
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

/// A current/next buffer pair
///
/// Exactly one slot is current at any time. [`DoubleBuffer::swap`] flips
/// an atomic role index; two swaps restore the original mapping.
#[derive(Debug)]
pub struct DoubleBuffer {
    slots: [DeviceBuffer; 2],
    current: AtomicUsize,
    elements: usize,
}

impl DoubleBuffer {
    /// Pair two equally sized buffers; `a` starts as current
    #[must_use]
    pub fn new(a: DeviceBuffer, b: DeviceBuffer, elements: usize) -> Self {
        Self {
            slots: [a, b],
            current: AtomicUsize::new(0),
            elements,
        }
    }

    /// Committed buffer
    #[must_use]
    pub fn current(&self) -> &DeviceBuffer {
        &self.slots[self.role()]
    }

    /// Buffer the next tick writes
    #[must_use]
    pub fn next(&self) -> &DeviceBuffer {
        &self.slots[self.role() ^ 1]
    }

    /// Slot index currently holding the committed buffer
    #[must_use]
    pub fn role(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Make `next` current
    pub fn swap(&self) {
        self.current.fetch_xor(1, Ordering::AcqRel);
    }

    /// Logical element count
    #[must_use]
    pub fn elements(&self) -> usize {
        self.elements
    }
}

/// Device copies of the read-only graph structure
#[derive(Debug, Clone)]
pub struct Adjacency {
    /// Outgoing CSR offsets
    pub forward_offsets: DeviceBuffer,
    /// Outgoing edge destinations
    pub forward_destinations: DeviceBuffer,
    /// Incoming CSR offsets
    pub backward_offsets: DeviceBuffer,
    /// Incoming edge sources
    pub backward_sources: DeviceBuffer,
    /// Per-point total degree
    pub degrees: DeviceBuffer,
    /// Number of edges
    pub num_edges: usize,
}

/// Axis-aligned bounds of a point set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Smallest x and y
    pub min: [f32; 2],
    /// Largest x and y
    pub max: [f32; 2],
}

impl Bounds {
    /// Bounds of `points`, `None` when empty
    #[must_use]
    pub fn of(points: &[[f32; 2]]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        Some(rest.iter().fold(
            Self {
                min: *first,
                max: *first,
            },
            |b, [x, y]| Self {
                min: [b.min[0].min(*x), b.min[1].min(*y)],
                max: [b.max[0].max(*x), b.max[1].max(*y)],
            },
        ))
    }

    /// Whether `[x, y]` lies inside (inclusive)
    #[must_use]
    pub fn contains(&self, [x, y]: [f32; 2]) -> bool {
        self.min[0] <= x && x <= self.max[0] && self.min[1] <= y && y <= self.max[1]
    }
}

#[derive(Debug, Default)]
struct MirrorData {
    positions: Arc<Vec<[f32; 2]>>,
    bounds: Option<Bounds>,
    edge_lengths: Arc<Vec<f32>>,
}

/// Host-visible copies other consumers read (rendering hints, histograms)
#[derive(Debug, Default)]
pub struct HostMirrors {
    data: Mutex<MirrorData>,
}

impl HostMirrors {
    fn data(&self) -> std::sync::MutexGuard<'_, MirrorData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the position mirror (also recomputes bounds)
    pub fn set_positions(&self, positions: Vec<[f32; 2]>) {
        let mut data = self.data();
        data.bounds = Bounds::of(&positions);
        data.positions = Arc::new(positions);
    }

    /// Replace the per-edge length mirror
    pub fn set_edge_lengths(&self, lengths: Vec<f32>) {
        self.data().edge_lengths = Arc::new(lengths);
    }

    /// Last mirrored positions
    #[must_use]
    pub fn positions(&self) -> Arc<Vec<[f32; 2]>> {
        Arc::clone(&self.data().positions)
    }

    /// Bounds of the last mirrored positions
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        self.data().bounds
    }

    /// Last mirrored edge lengths, in forward-edge order
    #[must_use]
    pub fn edge_lengths(&self) -> Arc<Vec<f32>> {
        Arc::clone(&self.data().edge_lengths)
    }
}

/// Device-resident state of one simulation
#[derive(Debug)]
pub struct SimulationState {
    device: DeviceContext,
    pool: BufferPool,
    pairs: RwLock<BTreeMap<String, Arc<DoubleBuffer>>>,
    adjacency: OnceLock<Adjacency>,
    num_points: AtomicUsize,
    mirrors: HostMirrors,
}

impl SimulationState {
    /// Empty state on `device`
    #[must_use]
    pub fn new(device: DeviceContext) -> Self {
        Self {
            pool: BufferPool::new(device.clone()),
            device,
            pairs: RwLock::new(BTreeMap::new()),
            adjacency: OnceLock::new(),
            num_points: AtomicUsize::new(0),
            mirrors: HostMirrors::default(),
        }
    }

    /// Owning device
    #[must_use]
    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    /// Named buffer pool
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Host mirrors
    #[must_use]
    pub fn mirrors(&self) -> &HostMirrors {
        &self.mirrors
    }

    /// Points in the position pair
    #[must_use]
    pub fn num_points(&self) -> usize {
        self.num_points.load(Ordering::Acquire)
    }

    /// Edges in the loaded adjacency (zero before loading)
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.adjacency.get().map_or(0, |a| a.num_edges)
    }

    /// Install (or refill) the double-buffered pair `name`
    ///
    /// Both slots start with `bytes`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if `bytes` is not a whole number of elements
    /// - `Device` if allocation or upload fails
    pub async fn install_pair(
        &self,
        name: &str,
        bytes: &[u8],
        elem_size: usize,
    ) -> Result<Arc<DoubleBuffer>> {
        if elem_size == 0 || bytes.len() % elem_size != 0 {
            return Err(LayoutError::InvalidState(format!(
                "{} bytes is not a whole number of {elem_size}-byte `{name}` elements",
                bytes.len()
            )));
        }
        let elements = bytes.len() / elem_size;

        let a = self.pool.acquire(&format!("{name}/0"), elements, elem_size).await?;
        let b = self.pool.acquire(&format!("{name}/1"), elements, elem_size).await?;
        a.write(bytes).await?;
        b.write(bytes).await?;

        let pair = Arc::new(DoubleBuffer::new(a, b, elements));
        self.pairs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::clone(&pair));
        if name == POINT_POSITIONS {
            self.num_points.store(elements, Ordering::Release);
        }
        tracing::debug!(pair = name, elements, "double buffer installed");
        Ok(pair)
    }

    /// Install point positions
    ///
    /// # Errors
    ///
    /// Returns `Device` if allocation or upload fails
    pub async fn install_positions(&self, positions: &[[f32; 2]]) -> Result<Arc<DoubleBuffer>> {
        self.install_pair(POINT_POSITIONS, bytemuck::cast_slice(positions), POSITION_SIZE)
            .await
    }

    /// The pair called `name`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no such pair was installed
    pub fn pair(&self, name: &str) -> Result<Arc<DoubleBuffer>> {
        self.pairs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| LayoutError::InvalidState(format!("buffer pair `{name}` not installed")))
    }

    /// Committed buffer of pair `name`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no such pair was installed
    pub fn current(&self, name: &str) -> Result<DeviceBuffer> {
        Ok(self.pair(name)?.current().clone())
    }

    /// Next-tick buffer of pair `name`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no such pair was installed
    pub fn next(&self, name: &str) -> Result<DeviceBuffer> {
        Ok(self.pair(name)?.next().clone())
    }

    /// Swap every pair
    pub fn swap_buffers(&self) {
        for pair in self.pairs.read().unwrap_or_else(PoisonError::into_inner).values() {
            pair.swap();
        }
    }

    /// Upload degree and adjacency arrays from `frame`
    ///
    /// # Errors
    ///
    /// - `InvalidState` if adjacency was already loaded
    /// - `Device` if allocation or upload fails
    pub async fn load_adjacency(&self, frame: &GraphFrame) -> Result<()> {
        if self.adjacency.get().is_some() {
            return Err(LayoutError::InvalidState("adjacency already loaded".into()));
        }

        let upload = |name: &'static str| async move {
            let host = frame
                .host_buffer(name)
                .ok_or_else(|| LayoutError::InvalidState(format!("frame has no `{name}` array")))?;
            // Empty arrays still get a one-element buffer so they can be bound
            let buffer = self
                .pool
                .acquire(name, host.len().max(1), std::mem::size_of::<u32>())
                .await?;
            buffer.write(bytemuck::cast_slice(host)).await?;
            Ok::<_, LayoutError>(buffer)
        };

        let adjacency = Adjacency {
            forward_offsets: upload(FORWARD_OFFSETS).await?,
            forward_destinations: upload(FORWARD_DESTINATIONS).await?,
            backward_offsets: upload(BACKWARD_OFFSETS).await?,
            backward_sources: upload(BACKWARD_SOURCES).await?,
            degrees: upload(DEGREES).await?,
            num_edges: frame.edge_destinations().len(),
        };
        let num_edges = adjacency.num_edges;
        self.adjacency
            .set(adjacency)
            .map_err(|_| LayoutError::InvalidState("adjacency already loaded".into()))?;
        tracing::debug!(num_edges, "adjacency uploaded");
        Ok(())
    }

    /// Loaded adjacency buffers
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before [`SimulationState::load_adjacency`]
    pub fn adjacency(&self) -> Result<&Adjacency> {
        self.adjacency
            .get()
            .ok_or_else(|| LayoutError::InvalidState("adjacency not loaded".into()))
    }

    /// Read committed positions back to the host
    ///
    /// # Errors
    ///
    /// - `InvalidState` if positions were never installed
    /// - `Device` if the transfer fails
    pub async fn read_positions(&self) -> Result<Vec<[f32; 2]>> {
        let pair = self.pair(POINT_POSITIONS)?;
        let mut out = vec![[0.0_f32; 2]; pair.elements()];
        pair.current().read(bytemuck::cast_slice_mut(&mut out)).await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CsrGraph;

    #[tokio::test]
    async fn test_pool_reuses_until_larger() {
        let pool = BufferPool::new(DeviceContext::host());

        let a = pool.acquire("mask", 100, 1).await.unwrap();
        assert_eq!(a.byte_len(), 100);

        let b = pool.acquire("mask", 40, 1).await.unwrap();
        assert!(a.same_as(&b));
        let c = pool.acquire("mask", 100, 1).await.unwrap();
        assert!(a.same_as(&c));
        assert_eq!(pool.allocations(), 1);

        let d = pool.acquire("mask", 101, 1).await.unwrap();
        assert!(!a.same_as(&d));
        assert_eq!(d.byte_len(), 101);
        assert_eq!(pool.allocations(), 2);
        assert!(pool.get("mask").await.unwrap().same_as(&d));
    }

    #[tokio::test]
    async fn test_pool_overflow_is_allocation_failure() {
        let pool = BufferPool::new(DeviceContext::host());
        let err = pool.acquire("huge", usize::MAX, 2).await.unwrap_err();
        assert_eq!(err.op, DeviceOp::Allocate);
    }

    #[tokio::test]
    async fn test_swap_is_role_only_and_self_inverse() {
        let state = SimulationState::new(DeviceContext::host());
        state.install_positions(&[[1.0, 2.0], [3.0, 4.0]]).await.unwrap();

        let current = state.current(POINT_POSITIONS).unwrap();
        let next = state.next(POINT_POSITIONS).unwrap();
        assert!(!current.same_as(&next));

        state.swap_buffers();
        assert!(state.current(POINT_POSITIONS).unwrap().same_as(&next));
        assert!(state.next(POINT_POSITIONS).unwrap().same_as(&current));

        state.swap_buffers();
        assert!(state.current(POINT_POSITIONS).unwrap().same_as(&current));
    }

    #[tokio::test]
    async fn test_read_positions_reads_current() {
        let state = SimulationState::new(DeviceContext::host());
        state.install_positions(&[[1.0, 2.0]]).await.unwrap();
        state
            .next(POINT_POSITIONS)
            .unwrap()
            .write(bytemuck::cast_slice(&[[9.0_f32, 9.0]]))
            .await
            .unwrap();

        assert_eq!(state.read_positions().await.unwrap(), vec![[1.0, 2.0]]);
        state.swap_buffers();
        assert_eq!(state.read_positions().await.unwrap(), vec![[9.0, 9.0]]);
        assert_eq!(state.num_points(), 1);
    }

    #[tokio::test]
    async fn test_install_rejects_partial_elements() {
        let state = SimulationState::new(DeviceContext::host());
        let err = state.install_pair("weights", &[0; 7], 4).await.unwrap_err();
        assert!(matches!(err, LayoutError::InvalidState(_)));
        assert!(state.pair("weights").is_err());
    }

    #[tokio::test]
    async fn test_load_adjacency_once() {
        let graph = CsrGraph::from_edges(3, &[(0, 1), (1, 2)]).unwrap();
        let frame = GraphFrame::from_graph(graph).unwrap();
        let state = SimulationState::new(DeviceContext::host());

        assert!(state.adjacency().is_err());
        state.load_adjacency(&frame).await.unwrap();
        assert_eq!(state.num_edges(), 2);

        let adjacency = state.adjacency().unwrap();
        let mut offsets = [0_u32; 4];
        adjacency
            .forward_offsets
            .read(bytemuck::cast_slice_mut(&mut offsets))
            .await
            .unwrap();
        assert_eq!(offsets, [0, 1, 2, 2]);

        let err = state.load_adjacency(&frame).await.unwrap_err();
        assert!(matches!(err, LayoutError::InvalidState(_)));
    }

    #[test]
    fn test_mirror_bounds() {
        let mirrors = HostMirrors::default();
        assert!(mirrors.bounds().is_none());

        mirrors.set_positions(vec![[1.0, -1.0], [-2.0, 3.0]]);
        let bounds = mirrors.bounds().unwrap();
        assert_eq!(bounds.min, [-2.0, -1.0]);
        assert_eq!(bounds.max, [1.0, 3.0]);
        assert!(bounds.contains([0.0, 0.0]));
        assert_eq!(mirrors.positions().len(), 2);
    }
}
