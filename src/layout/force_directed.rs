//! Force-directed layout
//!
//! Each tick runs two kernels: `point_forces` (all-pairs repulsion plus
//! gravity toward the origin, into a forces buffer) and `integrate_edges`
//! (springs along forward and backward edges, integrated into `next`).

use super::{dispatch_size, LayoutAlgorithm, ParamSet, ParamValue};
use crate::device::{BufferDeps, DeviceContext};
use crate::error::Result;
use crate::kernel::{ArgValue, Kernel};
use crate::kernels::{INTEGRATE_EDGES, NUM_POINTS, POINT_FORCES};
use crate::state::{SimulationState, POINT_POSITIONS, POSITION_SIZE};
use futures::future::{BoxFuture, FutureExt};

/// Pooled buffer holding per-point forces between the two kernels
pub const FORCES: &str = "forces";

const POINT_FORCES_IDX: usize = 0;
const INTEGRATE_IDX: usize = 1;

/// Force-directed layout algorithm
#[derive(Debug)]
pub struct ForceDirected {
    kernels: [Kernel; 2],
}

impl ForceDirected {
    /// Default physics parameters
    #[must_use]
    pub fn defaults() -> ParamSet {
        ParamSet::new()
            .with("repulsion", ParamValue::F32(1.0))
            .with("gravity", ParamValue::F32(0.05))
            .with("stiffness", ParamValue::F32(0.1))
            .with("step_size", ParamValue::F32(0.01))
    }

    /// Compile the kernels and apply [`ForceDirected::defaults`]
    ///
    /// # Errors
    ///
    /// Returns `Device` if a kernel fails to compile
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let layout = Self {
            kernels: [
                Kernel::compile(device, &POINT_FORCES)?,
                Kernel::compile(device, &INTEGRATE_EDGES)?,
            ],
        };
        layout.configure(&Self::defaults())?;
        Ok(layout)
    }

    fn point_forces(&self) -> &Kernel {
        &self.kernels[POINT_FORCES_IDX]
    }

    fn integrate(&self) -> &Kernel {
        &self.kernels[INTEGRATE_IDX]
    }
}

impl LayoutAlgorithm for ForceDirected {
    fn name(&self) -> &'static str {
        "force_directed"
    }

    fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    fn bind_points<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            let n = dispatch_size(state)?;
            let forces = state
                .pool()
                .acquire(FORCES, state.num_points(), POSITION_SIZE)
                .await?;
            self.point_forces().set([
                (NUM_POINTS, ArgValue::U32(n)),
                (FORCES, ArgValue::Buffer(forces.clone())),
            ])?;
            self.integrate().set([
                (NUM_POINTS, ArgValue::U32(n)),
                (FORCES, ArgValue::Buffer(forces)),
            ])?;
            Ok(())
        }
        .boxed()
    }

    fn bind_edges<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            let adjacency = state.adjacency()?;
            self.integrate().set([
                ("forward_offsets", ArgValue::from(&adjacency.forward_offsets)),
                ("forward_destinations", ArgValue::from(&adjacency.forward_destinations)),
                ("backward_offsets", ArgValue::from(&adjacency.backward_offsets)),
                ("backward_sources", ArgValue::from(&adjacency.backward_sources)),
            ])?;
            Ok(())
        }
        .boxed()
    }

    fn tick<'a>(&'a self, state: &'a SimulationState, step: u64) -> BoxFuture<'a, Result<()>> {
        async move {
            let n = dispatch_size(state)?;
            let pair = state.pair(POINT_POSITIONS)?;
            let (current, next) = (pair.current(), pair.next());

            self.point_forces()
                .set([("positions", ArgValue::from(current))])?;
            self.point_forces().exec(n, BufferDeps::new()).await?;

            self.integrate().set([
                ("positions", ArgValue::from(current)),
                ("next_positions", ArgValue::from(next)),
            ])?;
            self.integrate().exec(n, BufferDeps::new()).await?;

            state.swap_buffers();
            tracing::trace!(algorithm = self.name(), step, "tick complete");
            Ok(())
        }
        .boxed()
    }

    fn refresh_host_mirrors<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        async move {
            let positions = state.read_positions().await?;
            state.mirrors().set_positions(positions);
            Ok(())
        }
        .boxed()
    }
}
