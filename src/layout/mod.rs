//! Layout algorithm contract
//!
//! A [`LayoutAlgorithm`] owns an ordered list of [`Kernel`]s and drives them
//! against a [`SimulationState`]. Variants differ only in which kernels they
//! own and what a tick does; parameter fan-out ([`configure_kernels`]) and
//! statistics are generic over the kernel list.
//!
//! # Example
//!
//! ```
//! use trueno_layout::device::DeviceContext;
//! use trueno_layout::layout::{LayoutKind, ParamSet, ParamValue};
//!
//! let device = DeviceContext::host();
//! let algorithm = "edge_spring".parse::<LayoutKind>()?.build(&device)?;
//!
//! // `repulsion` is not an `edge_spring` argument and is silently ignored
//! let params = ParamSet::new()
//!     .with("stiffness", ParamValue::F32(0.2))
//!     .with("repulsion", ParamValue::F32(5.0));
//! algorithm.configure(&params)?;
//! # Ok::<(), trueno_layout::LayoutError>(())
//! ```

pub mod edge_spring;
pub mod force_directed;

pub use edge_spring::EdgeSpring;
pub use force_directed::ForceDirected;

use crate::device::DeviceContext;
use crate::error::{LayoutError, Result};
use crate::kernel::{ArgValue, Kernel, RuntimeReport};
use crate::kernels::{ArgType, ScalarKind};
use crate::state::SimulationState;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Value of one physics parameter
///
/// Integers deserialize as `U32` and are widened when a kernel declares the
/// argument as `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Unsigned integer
    U32(u32),
    /// Float
    F32(f32),
}

impl ParamValue {
    /// Kernel argument value for a declared type
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedConfiguration` if the value cannot represent `ty`
    #[allow(clippy::cast_precision_loss)]
    pub fn to_arg(self, name: &str, ty: ArgType) -> Result<ArgValue> {
        match (self, ty) {
            (Self::F32(v), ArgType::Scalar(ScalarKind::F32)) => Ok(ArgValue::F32(v)),
            (Self::U32(v), ArgType::Scalar(ScalarKind::F32)) => Ok(ArgValue::F32(v as f32)),
            (Self::U32(v), ArgType::Scalar(ScalarKind::U32)) => Ok(ArgValue::U32(v)),
            _ => Err(LayoutError::unrecognized("argument kind", name)),
        }
    }
}

/// Named physics parameters shared by every algorithm of a simulation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ParamSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParamSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace `name`
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    /// Value of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    /// Overlay `other` on top of this set
    pub fn merge(&mut self, other: &Self) {
        for (name, value) in other.iter() {
            self.values.insert(name.to_owned(), value);
        }
    }

    /// Entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Bind to each kernel exactly the entries of `params` it declares as tunable
///
/// Entries no kernel declares, and entries naming internal arguments such as
/// `num_points` or buffers, are ignored.
///
/// # Errors
///
/// Returns `UnrecognizedConfiguration` if a value does not fit the declared
/// argument type; that kernel keeps its previous bindings
pub fn configure_kernels(kernels: &[Kernel], params: &ParamSet) -> Result<()> {
    for kernel in kernels {
        let entries = params
            .iter()
            .filter_map(|(name, value)| kernel.param_type(name).map(|ty| (name, value, ty)))
            .map(|(name, value, ty)| Ok((name, value.to_arg(name, ty)?)))
            .collect::<Result<Vec<_>>>()?;
        if !entries.is_empty() {
            tracing::debug!(kernel = kernel.name(), bound = entries.len(), "parameters bound");
            kernel.set(entries)?;
        }
    }
    Ok(())
}

/// Point count as a dispatch size
pub(crate) fn dispatch_size(state: &SimulationState) -> Result<u32> {
    u32::try_from(state.num_points())
        .map_err(|_| LayoutError::InvalidState("point count exceeds u32 dispatch range".into()))
}

/// Capability set every layout algorithm provides
///
/// Defaults only log, so a variant overrides what it needs.
pub trait LayoutAlgorithm: Send + Sync + fmt::Debug {
    /// Algorithm name
    fn name(&self) -> &'static str;

    /// Owned kernels, in execution order
    fn kernels(&self) -> &[Kernel];

    /// Fan `params` out to the owned kernels
    ///
    /// # Errors
    ///
    /// See [`configure_kernels`]
    fn configure(&self, params: &ParamSet) -> Result<()> {
        configure_kernels(self.kernels(), params)
    }

    /// Attach per-point buffers
    fn bind_points<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        tracing::debug!(algorithm = self.name(), points = state.num_points(), "bind_points");
        async { Ok(()) }.boxed()
    }

    /// Attach adjacency buffers
    fn bind_edges<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        tracing::debug!(algorithm = self.name(), edges = state.num_edges(), "bind_edges");
        async { Ok(()) }.boxed()
    }

    /// Compute `next` from `current`, then swap
    fn tick<'a>(&'a self, state: &'a SimulationState, step: u64) -> BoxFuture<'a, Result<()>> {
        let _ = state;
        tracing::debug!(algorithm = self.name(), step, "tick");
        async { Ok(()) }.boxed()
    }

    /// Update host-visible copies from committed state
    fn refresh_host_mirrors<'a>(&'a self, state: &'a SimulationState) -> BoxFuture<'a, Result<()>> {
        let _ = state;
        tracing::debug!(algorithm = self.name(), "refresh_host_mirrors");
        async { Ok(()) }.boxed()
    }

    /// Owned kernel statistics merged with `extra`
    fn runtime_stats(&self, extra: &[&Kernel]) -> RuntimeReport {
        RuntimeReport::collect(self.kernels(), extra.iter().copied())
    }
}

/// Layout variants selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Repulsion + gravity + springs along both edge directions
    ForceDirected,
    /// Springs along forward edges only
    EdgeSpring,
}

impl LayoutKind {
    /// Canonical name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ForceDirected => "force_directed",
            Self::EdgeSpring => "edge_spring",
        }
    }

    /// Compile the variant's kernels on `device`
    ///
    /// # Errors
    ///
    /// Returns `Device` if a kernel fails to compile
    pub fn build(self, device: &DeviceContext) -> Result<Box<dyn LayoutAlgorithm>> {
        Ok(match self {
            Self::ForceDirected => Box::new(ForceDirected::new(device)?),
            Self::EdgeSpring => Box::new(EdgeSpring::new(device)?),
        })
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayoutKind {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "force_directed" | "forceatlas" => Ok(Self::ForceDirected),
            "edge_spring" | "spring" => Ok(Self::EdgeSpring),
            _ => Err(LayoutError::unrecognized("layout algorithm", s)),
        }
    }
}
