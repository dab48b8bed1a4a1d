//! Host dataframe: graph structure, initial positions and point columns

use super::CsrGraph;
use anyhow::{ensure, Result};
use std::f32::consts::TAU;

/// Element kinds a frame counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Graph vertices
    Points,
    /// Directed edges
    Edges,
}

/// Column value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Any integer or floating point column (held as `f64`)
    Numeric,
    /// UTF-8 strings
    Text,
}

/// Column values, one per point
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Numeric values
    Numeric(Vec<f64>),
    /// String values
    Text(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }
}

/// Named per-point attribute column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Values
    pub data: ColumnData,
}

impl Column {
    /// Numeric column
    pub fn numeric(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    /// Text column
    pub fn text(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Text(values),
        }
    }

    /// Value type
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self.data {
            ColumnData::Numeric(_) => ColumnType::Numeric,
            ColumnData::Text(_) => ColumnType::Text,
        }
    }

    /// `(min, max)` of a non-empty numeric column (NaNs ignored)
    #[must_use]
    pub fn range(&self) -> Option<(f64, f64)> {
        let ColumnData::Numeric(values) = &self.data else {
            return None;
        };
        values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Everything the engine needs from a loaded dataset
///
/// Degrees are computed once at construction; the CSR arrays are served
/// from the graph without copying.
#[derive(Debug, Clone)]
pub struct GraphFrame {
    graph: CsrGraph,
    positions: Vec<[f32; 2]>,
    degrees: Vec<u32>,
    columns: Vec<Column>,
}

/// Points evenly spaced on a circle whose circumference grows with the count
fn circle_layout(num_points: usize) -> Vec<[f32; 2]> {
    #[allow(clippy::cast_precision_loss)]
    let n = num_points as f32;
    let radius = n.sqrt().max(1.0);
    (0..num_points)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let angle = TAU * i as f32 / n;
            [radius * angle.cos(), radius * angle.sin()]
        })
        .collect()
}

impl GraphFrame {
    /// Frame with explicit positions and columns
    ///
    /// # Errors
    ///
    /// Returns error if `positions` or any column length differs from the
    /// graph's point count
    pub fn new(graph: CsrGraph, positions: Vec<[f32; 2]>, columns: Vec<Column>) -> Result<Self> {
        let n = graph.num_points();
        ensure!(
            positions.len() == n,
            "{} positions for {n} points",
            positions.len()
        );
        for column in &columns {
            ensure!(
                column.data.len() == n,
                "column `{}` has {} values for {n} points",
                column.name,
                column.data.len()
            );
        }
        Ok(Self {
            degrees: graph.degrees(),
            graph,
            positions,
            columns,
        })
    }

    /// Frame with a circular initial layout and no columns
    ///
    /// # Errors
    ///
    /// Infallible for well-formed graphs; kept fallible to match [`GraphFrame::new`]
    pub fn from_graph(graph: CsrGraph) -> Result<Self> {
        let positions = circle_layout(graph.num_points());
        Self::new(graph, positions, Vec::new())
    }

    /// Initial layout positions for a graph without stored coordinates
    #[must_use]
    pub fn default_positions(num_points: usize) -> Vec<[f32; 2]> {
        circle_layout(num_points)
    }

    /// Element count of `kind`
    #[must_use]
    pub fn num_elements(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Points => self.graph.num_points(),
            ElementKind::Edges => self.graph.num_edges(),
        }
    }

    /// Host array by state buffer name (`forward_offsets`,
    /// `forward_destinations`, `backward_offsets`, `backward_sources`,
    /// `degrees`)
    #[must_use]
    pub fn host_buffer(&self, name: &str) -> Option<&[u32]> {
        let (fwd_offsets, fwd) = self.graph.forward();
        let (bwd_offsets, bwd) = self.graph.backward();
        match name {
            "forward_offsets" => Some(fwd_offsets),
            "forward_destinations" => Some(fwd),
            "backward_offsets" => Some(bwd_offsets),
            "backward_sources" => Some(bwd),
            "degrees" => Some(&self.degrees),
            _ => None,
        }
    }

    /// Per-point total degree
    #[must_use]
    pub fn degrees(&self) -> &[u32] {
        &self.degrees
    }

    /// Destination of every edge, in forward order
    #[must_use]
    pub fn edge_destinations(&self) -> &[u32] {
        self.graph.forward().1
    }

    /// Columns of one value type, in frame order
    pub fn columns_by_type(&self, ty: ColumnType) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(move |c| c.column_type() == ty)
    }

    /// All columns
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Initial positions
    #[must_use]
    pub fn positions(&self) -> &[[f32; 2]] {
        &self.positions
    }

    /// Underlying graph
    #[must_use]
    pub fn graph(&self) -> &CsrGraph {
        &self.graph
    }
}
