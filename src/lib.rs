//! trueno-layout: GPU-resident iterative graph layout engine
//!
//! # Overview
//!
//! trueno-layout keeps a graph's point positions on a compute device and
//! iterates force-directed layouts over them. Positions are double-buffered:
//! a tick reads `current`, writes `next`, then swaps roles without copying.
//! Spatial selections (rectangle, circle) run as kernels against committed
//! positions. Datasets load through an unpack pipeline and are shared per
//! dataset by a single-flight registry.
//!
//! # Quick Start
//!
//! ```
//! use trueno_layout::device::DeviceContext;
//! use trueno_layout::layout::{LayoutKind, ParamSet};
//! use trueno_layout::selection::SelectionShape;
//! use trueno_layout::storage::{CsrGraph, GraphFrame};
//! use trueno_layout::Simulation;
//!
//! # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
//! let graph = CsrGraph::from_edges(3, &[(0, 1), (1, 2)])?;
//! let frame = GraphFrame::new(graph, vec![[0.0, 0.0], [5.0, 0.0], [9.0, 9.0]], Vec::new())?;
//!
//! let sim = Simulation::build(
//!     &DeviceContext::host(),
//!     "example",
//!     frame,
//!     &[LayoutKind::EdgeSpring],
//!     &ParamSet::new(),
//! )
//! .await?;
//! sim.finalize(4).await?;
//!
//! // Select before ticking: points 0 and 1 lie inside the box
//! let mask = sim.select(&SelectionShape::rectangle(-1.0, -1.0, 1.0, 6.0)).await?;
//! assert_eq!(mask, vec![1, 1, 0]);
//!
//! sim.run(10).await?;
//! assert_eq!(sim.step(), 10);
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Architecture
//!
//! - **Device**: host reference backend, or wgpu (feature `gpu`)
//! - **Kernels**: named catalog of WGSL programs with host reference twins
//! - **State**: memoized buffer pool, double-buffered positions, adjacency
//! - **Layouts**: `force_directed`, `edge_spring` behind one trait
//! - **Storage**: CSR adjacency, Parquet canonical datasets (feature `storage`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod kernels;
pub mod layout;
pub mod registry;
pub mod selection;
pub mod simulation;
pub mod state;
pub mod storage;

// Dataset loading (Parquet canonical format)
#[cfg(feature = "storage")]
pub mod dataset;

// Re-export core types
pub use config::EngineConfig;
pub use device::{BackendKind, BufferDeps, DeviceBuffer, DeviceContext};
pub use error::{DeviceOp, DeviceOperationFailure, LayoutError, Result};
pub use kernel::{ArgValue, Kernel, KernelStats, RuntimeReport};
pub use layout::{LayoutAlgorithm, LayoutKind, ParamSet, ParamValue};
pub use registry::SingleFlight;
pub use selection::{SelectionKind, SelectionShape};
pub use simulation::{Interaction, LoadSummary, Simulation, SimulationId};
pub use state::{DoubleBuffer, SimulationState};
pub use storage::{CsrGraph, GraphFrame, PointId};

#[cfg(feature = "storage")]
pub use dataset::{DatasetDescriptor, DatasetPipeline};
#[cfg(feature = "storage")]
pub use registry::SimulationRegistry;

#[cfg(feature = "gpu")]
pub use device::{GpuDevice, GpuDeviceError};
