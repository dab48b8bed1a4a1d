//! Spring-only layout along forward edges

use super::{dispatch_size, LayoutAlgorithm, ParamSet, ParamValue};
use crate::device::{BufferDeps, DeviceContext};
use crate::error::{LayoutError, Result};
use crate::kernel::{ArgValue, Kernel};
use crate::kernels::{EDGE_SPRING, NUM_POINTS};
use crate::state::{SimulationState, POINT_POSITIONS};
use futures::future::{BoxFuture, FutureExt};

/// Edge-spring layout algorithm
///
/// Its host mirror is the length of every forward edge, the input for edge
/// length histograms.
#[derive(Debug)]
pub struct EdgeSpring {
    kernels: [Kernel; 1],
}

impl EdgeSpring {
    /// Default physics parameters
    #[must_use]
    pub fn defaults() -> ParamSet {
        ParamSet::new()
            .with("stiffness", ParamValue::F32(0.1))
            .with("step_size", ParamValue::F32(0.1))
    }

    /// Compile the kernel and apply [`EdgeSpring::defaults`]
    ///
    /// # Errors
    ///
    /// Returns `Device` if the kernel fails to compile
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let layout = Self {
            kernels: [Kernel::compile(device, &EDGE_SPRING)?],
        };
        layout.configure(&Self::defaults())?;
        Ok(layout)
    }

    fn spring(&self) -> &Kernel {
        &self.kernels[0]
    }
}

/// Euclidean length of every forward edge
fn edge_lengths(positions: &[[f32; 2]], offsets: &[u32], destinations: &[u32]) -> Result<Vec<f32>> {
    let mut lengths = Vec::with_capacity(destinations.len());
    for (src, w) in offsets.windows(2).enumerate() {
        let [sx, sy] = positions[src];
        for &dst in &destinations[w[0] as usize..w[1] as usize] {
            let [dx, dy] = *positions.get(dst as usize).ok_or_else(|| {
                LayoutError::InvalidState(format!("edge destination {dst} out of range"))
            })?;
            lengths.push((dx - sx).hypot(dy - sy));
        }
    }
    Ok(lengths)
}

impl LayoutAlgorithm for EdgeSpring {
    fn name(&self) -> &'static str {
        "edge_spring"
    }

    fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    fn bind_points<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            self.spring()
                .set([(NUM_POINTS, ArgValue::U32(dispatch_size(state)?))])?;
            Ok(())
        }
        .boxed()
    }

    fn bind_edges<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            let adjacency = state.adjacency()?;
            self.spring().set([
                ("forward_offsets", ArgValue::from(&adjacency.forward_offsets)),
                ("forward_destinations", ArgValue::from(&adjacency.forward_destinations)),
            ])?;
            Ok(())
        }
        .boxed()
    }

    fn tick<'a>(&'a self, state: &'a SimulationState, step: u64) -> BoxFuture<'a, Result<()>> {
        async move {
            let n = dispatch_size(state)?;
            let pair = state.pair(POINT_POSITIONS)?;
            self.spring().set([
                ("positions", ArgValue::from(pair.current())),
                ("next_positions", ArgValue::from(pair.next())),
            ])?;
            self.spring().exec(n, BufferDeps::new()).await?;

            state.swap_buffers();
            tracing::trace!(algorithm = self.name(), step, "tick complete");
            Ok(())
        }
        .boxed()
    }

    fn refresh_host_mirrors<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            let adjacency = state.adjacency()?;
            let positions = state.read_positions().await?;

            let mut offsets = vec![0_u32; positions.len() + 1];
            adjacency
                .forward_offsets
                .read(bytemuck::cast_slice_mut(&mut offsets))
                .await?;
            let mut destinations = vec![0_u32; adjacency.num_edges];
            adjacency
                .forward_destinations
                .read(bytemuck::cast_slice_mut(&mut destinations))
                .await?;

            state
                .mirrors()
                .set_edge_lengths(edge_lengths(&positions, &offsets, &destinations)?);
            Ok(())
        }
        .boxed()
    }
}
