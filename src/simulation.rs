//! A loaded, ready-to-tick simulation
//!
//! A [`Simulation`] owns the device state of one dataset together with the
//! layout algorithms that tick it and the selection kernels that query it.
//! It is shared (`Arc`) between every caller that requested the same
//! dataset, so all operations take `&self`.

use crate::device::DeviceContext;
use crate::error::{LayoutError, Result};
use crate::kernel::RuntimeReport;
use crate::layout::{LayoutAlgorithm, LayoutKind, ParamSet};
use crate::selection::{SelectionKind, SelectionShape, Selections};
use crate::state::{Bounds, SimulationState};
use crate::storage::{ColumnType, ElementKind, GraphFrame};
use futures::future::try_join_all;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::sync::broadcast;

static NEXT_SIMULATION_ID: AtomicU64 = AtomicU64::new(1);

const EVENT_CAPACITY: usize = 64;

/// Process-unique simulation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimulationId(u64);

impl SimulationId {
    fn next() -> Self {
        Self(NEXT_SIMULATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim-{}", self.0)
    }
}

/// User interaction broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    /// Physics parameters changed
    Configured(ParamSet),
    /// A tick committed
    Ticked {
        /// Step number of the committed tick
        step: u64,
    },
    /// A selection resolved
    Selected {
        /// Shape family
        shape: SelectionKind,
        /// Number of selected points
        selected: usize,
    },
}

/// Value range of one numeric column
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramColumn {
    /// Column name
    pub name: String,
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
}

/// Element counts the renderer sizes its buffers by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderCounts {
    /// Points drawn
    pub points: usize,
    /// Edges drawn
    pub edges: usize,
}

/// Artifacts derived once when a dataset finishes loading
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSummary {
    /// Initial histogram selection (leading numeric columns)
    pub histograms: Vec<HistogramColumn>,
    /// Rendering element counts
    pub render_counts: RenderCounts,
    /// Bounds of the mirrored positions, if an algorithm mirrors them
    pub bounds: Option<Bounds>,
}

/// Device state, algorithms and selections of one loaded dataset
pub struct Simulation {
    id: SimulationId,
    key: String,
    state: SimulationState,
    algorithms: Vec<Box<dyn LayoutAlgorithm>>,
    selections: Selections,
    frame: GraphFrame,
    params: Mutex<ParamSet>,
    events: broadcast::Sender<Interaction>,
    step: AtomicU64,
    summary: OnceLock<LoadSummary>,
    tick_lock: tokio::sync::Mutex<()>,
    finalize_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("points", &self.state.num_points())
            .field("algorithms", &self.algorithm_names())
            .field("step", &self.step())
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Build a simulation for `frame` on `device`
    ///
    /// Uploads positions, compiles every algorithm in `kinds`, applies
    /// `params` and binds per-point buffers. Adjacency is uploaded later by
    /// [`Simulation::finalize`].
    ///
    /// # Errors
    ///
    /// - `Device` if compilation, allocation or upload fails
    /// - `UnrecognizedConfiguration` if a parameter does not fit its kernel
    pub async fn build(
        device: &DeviceContext,
        key: impl Into<String>,
        frame: GraphFrame,
        kinds: &[LayoutKind],
        params: &ParamSet,
    ) -> Result<Self> {
        let state = SimulationState::new(device.clone());
        state.install_positions(frame.positions()).await?;

        let algorithms = kinds
            .iter()
            .map(|kind| kind.build(device))
            .collect::<Result<Vec<_>>>()?;
        for algorithm in &algorithms {
            algorithm.configure(params)?;
            algorithm.bind_points(&state).await?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let simulation = Self {
            id: SimulationId::next(),
            key: key.into(),
            selections: Selections::new(device)?,
            state,
            algorithms,
            frame,
            params: Mutex::new(params.clone()),
            events,
            step: AtomicU64::new(0),
            summary: OnceLock::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            finalize_lock: tokio::sync::Mutex::new(()),
        };
        tracing::debug!(id = %simulation.id, key = %simulation.key, "simulation built");
        Ok(simulation)
    }

    /// Identifier
    #[must_use]
    pub fn id(&self) -> SimulationId {
        self.id
    }

    /// Dataset key this simulation was loaded from
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Device the state lives on
    #[must_use]
    pub fn device(&self) -> &DeviceContext {
        self.state.device()
    }

    /// Device-resident state
    #[must_use]
    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    /// Host dataframe the simulation was loaded from
    #[must_use]
    pub fn frame(&self) -> &GraphFrame {
        &self.frame
    }

    /// Layout algorithms, in tick order
    #[must_use]
    pub fn algorithms(&self) -> &[Box<dyn LayoutAlgorithm>] {
        &self.algorithms
    }

    /// Algorithm names, in tick order
    #[must_use]
    pub fn algorithm_names(&self) -> Vec<&'static str> {
        self.algorithms.iter().map(|a| a.name()).collect()
    }

    /// Selection kernels
    #[must_use]
    pub fn selections(&self) -> &Selections {
        &self.selections
    }

    /// Committed ticks so far
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    /// Parameters currently applied
    #[must_use]
    pub fn params(&self) -> ParamSet {
        self.params.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Summary written by [`Simulation::finalize`]
    #[must_use]
    pub fn summary(&self) -> Option<&LoadSummary> {
        self.summary.get()
    }

    /// Subscribe to interaction events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Interaction> {
        self.events.subscribe()
    }

    fn publish(&self, event: Interaction) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Fan `params` out to every algorithm
    ///
    /// Entries no kernel declares are ignored.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedConfiguration` if a value does not fit a
    /// declared argument type
    pub fn configure(&self, params: &ParamSet) -> Result<()> {
        for algorithm in &self.algorithms {
            algorithm.configure(params)?;
        }
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(params);
        self.publish(Interaction::Configured(params.clone()));
        Ok(())
    }

    /// Run one tick of every algorithm, in order
    ///
    /// Ticks are serialized per simulation. Returns the committed step.
    ///
    /// # Errors
    ///
    /// - `InvalidState` before [`Simulation::finalize`]
    /// - `Device` if a kernel fails
    pub async fn tick(&self) -> Result<u64> {
        let _guard = self.tick_lock.lock().await;
        self.state.adjacency()?;

        let step = self.step();
        for algorithm in &self.algorithms {
            algorithm.tick(&self.state, step).await?;
        }
        let committed = step + 1;
        self.step.store(committed, Ordering::Release);
        self.publish(Interaction::Ticked { step: committed });
        Ok(committed)
    }

    /// Run `count` ticks
    ///
    /// # Errors
    ///
    /// See [`Simulation::tick`]
    pub async fn run(&self, count: u64) -> Result<u64> {
        let mut step = self.step();
        for _ in 0..count {
            step = self.tick().await?;
        }
        Ok(step)
    }

    /// Select against committed positions
    ///
    /// # Errors
    ///
    /// See [`crate::selection::SelectionKernel::select`]
    pub async fn select(&self, shape: &SelectionShape) -> Result<Vec<u8>> {
        let mask = self.selections.select(&self.state, shape).await?;
        self.publish(Interaction::Selected {
            shape: shape.kind(),
            selected: mask.iter().filter(|m| **m != 0).count(),
        });
        Ok(mask)
    }

    /// Refresh every algorithm's host mirrors concurrently
    ///
    /// # Errors
    ///
    /// Returns the first failure; the others still run to completion
    pub async fn refresh_host_mirrors(&self) -> Result<()> {
        try_join_all(
            self.algorithms
                .iter()
                .map(|a| a.refresh_host_mirrors(&self.state)),
        )
        .await?;
        Ok(())
    }

    /// Merged kernel statistics of all algorithms and selections
    #[must_use]
    pub fn runtime_stats(&self) -> RuntimeReport {
        let extra = self.selections.kernels();
        let mut report = RuntimeReport::collect(std::iter::empty(), extra);
        for algorithm in &self.algorithms {
            report.merge(algorithm.runtime_stats(&[]));
        }
        report
    }

    /// Upload adjacency, bind it, refresh mirrors and derive the summary
    ///
    /// Runs once per simulation.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if already finalized
    /// - `Device` if an upload, bind or mirror refresh fails
    pub async fn finalize(&self, histogram_columns: usize) -> Result<&LoadSummary> {
        let _guard = self.finalize_lock.lock().await;
        if self.summary.get().is_some() {
            return Err(LayoutError::InvalidState(format!("{} already finalized", self.id)));
        }
        self.state.load_adjacency(&self.frame).await?;
        for algorithm in &self.algorithms {
            algorithm.bind_edges(&self.state).await?;
        }
        self.refresh_host_mirrors().await?;

        let summary = self.derive_summary(histogram_columns);
        self.summary
            .set(summary)
            .map_err(|_| LayoutError::InvalidState(format!("{} already finalized", self.id)))?;
        tracing::info!(
            id = %self.id,
            key = %self.key,
            points = self.state.num_points(),
            edges = self.state.num_edges(),
            "simulation ready"
        );
        self.summary
            .get()
            .ok_or_else(|| LayoutError::InvalidState("summary missing after finalize".into()))
    }

    fn derive_summary(&self, histogram_columns: usize) -> LoadSummary {
        let histograms = self
            .frame
            .columns_by_type(ColumnType::Numeric)
            .filter_map(|c| {
                c.range().map(|(min, max)| HistogramColumn {
                    name: c.name.clone(),
                    min,
                    max,
                })
            })
            .take(histogram_columns)
            .collect();
        LoadSummary {
            histograms,
            render_counts: RenderCounts {
                points: self.frame.num_elements(ElementKind::Points),
                edges: self.frame.num_elements(ElementKind::Edges),
            },
            bounds: self.state.mirrors().bounds(),
        }
    }
}
