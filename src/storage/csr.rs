//! CSR (Compressed Sparse Row) adjacency for layout graphs
//!
//! Both directions are kept: layout springs pull along outgoing *and*
//! incoming edges, and the device kernels walk each as its own CSR.
//!
//! # CSR Format
//!
//! ```text
//! Graph: 0 → 1, 0 → 2, 1 → 2
//!
//! forward_offsets:      [0, 2, 3, 3]   // point 0: edges [0..2), point 1: [2..3), point 2: [3..3)
//! forward_destinations: [1, 2, 2]
//! backward_offsets:     [0, 0, 1, 3]
//! backward_sources:     [0, 0, 1]
//! ```

use anyhow::{ensure, Result};
use std::collections::HashMap;

/// Point identifier (zero-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointId(pub u32);

/// Directed graph in forward + reverse CSR form
///
/// # Example
///
/// ```
/// use trueno_layout::storage::{CsrGraph, PointId};
///
/// let graph = CsrGraph::from_edges(3, &[(0, 1), (0, 2)]).unwrap();
/// assert_eq!(graph.outgoing(PointId(0)).unwrap(), &[1, 2]);
/// assert_eq!(graph.degrees(), vec![2, 1, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct CsrGraph {
    /// Point i's outgoing edges are `forward_destinations[forward_offsets[i]..forward_offsets[i + 1]]`
    forward_offsets: Vec<u32>,
    forward_destinations: Vec<u32>,

    /// Point i's incoming edges, same layout
    backward_offsets: Vec<u32>,
    backward_sources: Vec<u32>,

    labels: HashMap<PointId, String>,
    num_points: usize,
}

/// Build one CSR direction from per-point neighbor lists
fn compress(lists: &[Vec<u32>]) -> (Vec<u32>, Vec<u32>) {
    let mut offsets = Vec::with_capacity(lists.len() + 1);
    let mut flat = Vec::with_capacity(lists.iter().map(Vec::len).sum());

    offsets.push(0);
    for neighbors in lists {
        flat.extend_from_slice(neighbors);
        #[allow(clippy::cast_possible_truncation)] // Graphs >4B edges not supported
        offsets.push(flat.len() as u32);
    }
    (offsets, flat)
}

impl CsrGraph {
    /// Create a graph over exactly `num_points` points
    ///
    /// Points without edges are kept (they still take part in the layout).
    ///
    /// # Errors
    ///
    /// Returns error if an endpoint is `>= num_points` or the point count
    /// overflows `u32`
    pub fn from_edges(num_points: usize, edges: &[(u32, u32)]) -> Result<Self> {
        ensure!(
            u32::try_from(num_points).is_ok(),
            "{num_points} points exceeds u32 indexing"
        );

        let mut outgoing: Vec<Vec<u32>> = vec![Vec::new(); num_points];
        let mut incoming: Vec<Vec<u32>> = vec![Vec::new(); num_points];

        for &(src, dst) in edges {
            let (s, d) = (src as usize, dst as usize);
            ensure!(
                s < num_points && d < num_points,
                "edge {src} → {dst} out of range for {num_points} points"
            );
            outgoing[s].push(dst);
            incoming[d].push(src);
        }

        let (forward_offsets, forward_destinations) = compress(&outgoing);
        let (backward_offsets, backward_sources) = compress(&incoming);

        Ok(Self {
            forward_offsets,
            forward_destinations,
            backward_offsets,
            backward_sources,
            labels: HashMap::new(),
            num_points,
        })
    }

    fn check(&self, point: PointId) -> Result<usize> {
        let idx = point.0 as usize;
        ensure!(idx < self.num_points, "Point ID {} out of bounds", point.0);
        Ok(idx)
    }

    /// Destinations of a point's outgoing edges
    ///
    /// # Errors
    ///
    /// Returns error if point ID is out of bounds
    pub fn outgoing(&self, point: PointId) -> Result<&[u32]> {
        let idx = self.check(point)?;
        let (start, end) = (
            self.forward_offsets[idx] as usize,
            self.forward_offsets[idx + 1] as usize,
        );
        Ok(&self.forward_destinations[start..end])
    }

    /// Sources of a point's incoming edges
    ///
    /// # Errors
    ///
    /// Returns error if point ID is out of bounds
    pub fn incoming(&self, point: PointId) -> Result<&[u32]> {
        let idx = self.check(point)?;
        let (start, end) = (
            self.backward_offsets[idx] as usize,
            self.backward_offsets[idx + 1] as usize,
        );
        Ok(&self.backward_sources[start..end])
    }

    /// Forward CSR `(offsets, destinations)`
    #[must_use]
    pub fn forward(&self) -> (&[u32], &[u32]) {
        (&self.forward_offsets, &self.forward_destinations)
    }

    /// Reverse CSR `(offsets, sources)`
    #[must_use]
    pub fn backward(&self) -> (&[u32], &[u32]) {
        (&self.backward_offsets, &self.backward_sources)
    }

    /// Total degree (outgoing + incoming) per point
    #[must_use]
    pub fn degrees(&self) -> Vec<u32> {
        let span = |offsets: &[u32]| offsets.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
        span(&self.forward_offsets)
            .into_iter()
            .zip(span(&self.backward_offsets))
            .map(|(out, inc)| out + inc)
            .collect()
    }

    /// All edges as `(source, destination)` in forward order
    pub fn edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.forward_offsets
            .windows(2)
            .zip(0_u32..)
            .flat_map(move |(w, src)| {
                self.forward_destinations[w[0] as usize..w[1] as usize]
                    .iter()
                    .map(move |dst| (src, *dst))
            })
    }

    /// Attach a display label to a point
    pub fn set_label(&mut self, point: PointId, label: String) {
        self.labels.insert(point, label);
    }

    /// Display label of a point
    #[must_use]
    pub fn label(&self, point: PointId) -> Option<&str> {
        self.labels.get(&point).map(String::as_str)
    }

    /// Get number of points
    #[must_use]
    pub const fn num_points(&self) -> usize {
        self.num_points
    }

    /// Get number of edges
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.forward_destinations.len()
    }
}
