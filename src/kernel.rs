//! Compiled compute kernels
//!
//! A [`Kernel`] pairs a catalog [`KernelSource`] with a program compiled for
//! one [`DeviceContext`]. Arguments are bound by name and persist across
//! executions, so a layout algorithm binds its buffers once and only rebinds
//! what changes per tick.
//!
//! # Example
//!
//! ```
//! # use trueno_layout::{device::{BufferDeps, DeviceContext}, kernel::{ArgValue, Kernel}};
//! # tokio_test_block_on(async {
//! let device = DeviceContext::host();
//! let positions = device
//!     .create_buffer_init("positions", bytemuck::cast_slice(&[[1.0_f32, 1.0]]))
//!     .await?;
//! let mask = device.create_buffer("mask", 1).await?;
//!
//! let kernel = Kernel::by_name(&device, "select_circle")?;
//! kernel.set([
//!     ("center_x", ArgValue::F32(0.0)),
//!     ("center_y", ArgValue::F32(0.0)),
//!     ("radius_squared", ArgValue::F32(4.0)),
//!     ("num_points", ArgValue::U32(1)),
//!     ("positions", ArgValue::Buffer(positions.clone())),
//!     ("mask", ArgValue::Buffer(mask.clone())),
//! ])?;
//! kernel.exec(1, BufferDeps::new().read(&positions).write(&mask)).await?;
//! assert_eq!(mask.read_to_vec().await?, vec![1]);
//! # Ok::<(), trueno_layout::LayoutError>(())
//! # }).unwrap();
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use crate::device::{BufferDeps, DeviceBuffer, DeviceContext, Program};
use crate::error::{DeviceOp, DeviceOperationFailure, LayoutError, Result};
use crate::kernels::{self, ArgDecl, ArgType, KernelSource, ScalarKind};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Value bound to a kernel argument
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// 32-bit float scalar
    F32(f32),
    /// 32-bit unsigned scalar
    U32(u32),
    /// Device buffer reference
    Buffer(DeviceBuffer),
}

impl ArgValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::F32(_) => "f32",
            Self::U32(_) => "u32",
            Self::Buffer(_) => "buffer",
        }
    }

    fn fits(&self, ty: ArgType) -> bool {
        matches!(
            (self, ty),
            (Self::F32(_), ArgType::Scalar(ScalarKind::F32))
                | (Self::U32(_), ArgType::Scalar(ScalarKind::U32))
                | (Self::Buffer(_), ArgType::Buffer(_))
        )
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<&DeviceBuffer> for ArgValue {
    fn from(buffer: &DeviceBuffer) -> Self {
        Self::Buffer(buffer.clone())
    }
}

/// Execution statistics for one kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Completed executions
    pub calls: u64,
    /// Duration of the most recent execution
    pub last: Duration,
    /// Sum over all executions
    pub total: Duration,
}

impl KernelStats {
    /// Mean duration per call (zero before the first call)
    #[must_use]
    pub fn mean(&self) -> Duration {
        u32::try_from(self.calls)
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| self.total / n)
    }

    fn merge(&mut self, other: Self) {
        self.calls += other.calls;
        self.total += other.total;
        if other.calls > 0 {
            self.last = other.last;
        }
    }
}

/// A compiled kernel with its current argument bindings
pub struct Kernel {
    source: &'static KernelSource,
    device: DeviceContext,
    program: Program,
    bindings: Mutex<Vec<Option<ArgValue>>>,
    stats: Mutex<KernelStats>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.source.name)
            .field("device", &self.device)
            .field("bound", &self.bound_names())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Compile a catalog kernel for `device`
    ///
    /// # Errors
    ///
    /// Returns `LayoutError::Device` if the backend rejects the program
    #[track_caller]
    pub fn compile(device: &DeviceContext, source: &'static KernelSource) -> Result<Self> {
        let program = device.compile(source, Location::caller())?;
        Ok(Self {
            source,
            device: device.clone(),
            program,
            bindings: Mutex::new(vec![None; source.args.len()]),
            stats: Mutex::new(KernelStats::default()),
        })
    }

    /// Compile a kernel by catalog name
    ///
    /// # Errors
    ///
    /// - `UnrecognizedConfiguration` for unknown names
    /// - `Device` if compilation fails
    #[track_caller]
    pub fn by_name(device: &DeviceContext, name: &str) -> Result<Self> {
        Self::compile(device, kernels::lookup(name)?)
    }

    /// Kernel name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.source.name
    }

    /// Declared argument names, in order
    pub fn arg_names(&self) -> impl Iterator<Item = &'static str> {
        self.source.args.iter().map(|a| a.name)
    }

    /// Whether the kernel declares an argument called `name`
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Declared type of `name` if a parameter set may bind it
    ///
    /// Dispatch sizes and buffers are internal and yield `None`.
    #[must_use]
    pub fn param_type(&self, name: &str) -> Option<ArgType> {
        self.position(name)
            .map(|idx| self.source.args[idx])
            .filter(|decl| decl.tunable)
            .map(|decl| decl.ty)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.source.args.iter().position(|a| a.name == name)
    }

    /// Bind named arguments
    ///
    /// The whole call is validated before anything is bound.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedConfiguration` for an undeclared name or a value
    /// of the wrong kind
    pub fn set<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, ArgValue)>,
        S: AsRef<str>,
    {
        let mut staged = Vec::new();
        for (name, value) in args {
            let name = name.as_ref();
            let idx = self.position(name).ok_or_else(|| {
                LayoutError::unrecognized("kernel argument", format!("{}.{name}", self.name()))
            })?;
            let decl = self.source.args[idx];
            if !value.fits(decl.ty) {
                return Err(LayoutError::unrecognized(
                    "argument kind",
                    format!("{}.{name} = {}", self.name(), value.kind()),
                ));
            }
            staged.push((idx, value));
        }

        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        for (idx, value) in staged {
            bindings[idx] = Some(value);
        }
        Ok(())
    }

    /// Names of currently bound arguments, in declaration order
    #[must_use]
    pub fn bound_names(&self) -> Vec<&'static str> {
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        self.source
            .args
            .iter()
            .zip(bindings.iter())
            .filter(|(_, slot)| slot.is_some())
            .map(|(decl, _)| decl.name)
            .collect()
    }

    /// Currently bound value of `name`
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<ArgValue> {
        let idx = self.position(name)?;
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings[idx].clone()
    }

    fn snapshot(
        &self,
        site: &'static Location<'static>,
    ) -> std::result::Result<Vec<(ArgDecl, ArgValue)>, DeviceOperationFailure> {
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        self.source
            .args
            .iter()
            .zip(bindings.iter())
            .map(|(decl, slot)| {
                slot.clone().map(|v| (*decl, v)).ok_or_else(|| {
                    DeviceOperationFailure::at(
                        DeviceOp::Execute,
                        self.name(),
                        format!("argument `{}` is not bound", decl.name),
                        site,
                    )
                })
            })
            .collect()
    }

    /// Execute over `global_size` work items
    ///
    /// `deps` declares buffers the dispatch must be ordered against in
    /// addition to the bound arguments.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` (tagged with this kernel's name and
    /// the caller's location) if an argument is unbound or the device fails
    #[track_caller]
    pub fn exec(
        &self,
        global_size: u32,
        deps: BufferDeps,
    ) -> impl Future<Output = std::result::Result<(), DeviceOperationFailure>> + '_ {
        let site = Location::caller();
        async move {
            let bindings = self.snapshot(site)?;
            let started = Instant::now();
            self.device
                .dispatch(self.name(), &self.program, bindings, global_size, &deps, site)
                .await?;
            self.record(started.elapsed());
            Ok(())
        }
    }

    fn record(&self, elapsed: Duration) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.merge(KernelStats {
                calls: 1,
                last: elapsed,
                total: elapsed,
            });
        }
    }

    /// Accumulated statistics, or `None` if they were lost to a poisoned lock
    #[must_use]
    pub fn stats(&self) -> Option<KernelStats> {
        self.stats.lock().ok().map(|s| *s)
    }
}

/// Merged statistics across any set of kernels, keyed by kernel name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeReport {
    kernels: BTreeMap<&'static str, KernelStats>,
}

impl RuntimeReport {
    /// Collect statistics from owned kernels plus any extra kernels
    ///
    /// Kernels whose statistics are unavailable are omitted.
    pub fn collect<'a>(
        owned: impl IntoIterator<Item = &'a Kernel>,
        extra: impl IntoIterator<Item = &'a Kernel>,
    ) -> Self {
        let mut report = Self::default();
        for kernel in owned.into_iter().chain(extra) {
            if let Some(stats) = kernel.stats() {
                report.kernels.entry(kernel.name()).or_default().merge(stats);
            }
        }
        report
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: Self) {
        for (name, stats) in other.kernels {
            self.kernels.entry(name).or_default().merge(stats);
        }
    }

    /// Statistics for one kernel
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&KernelStats> {
        self.kernels.get(name)
    }

    /// All entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &KernelStats)> {
        self.kernels.iter().map(|(k, v)| (*k, v))
    }

    /// Number of kernels reported
    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether no kernel reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Total device time across all kernels
    #[must_use]
    pub fn total(&self) -> Duration {
        self.kernels.values().map(|s| s.total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{EDGE_SPRING, SELECT_RECTANGLE};

    fn rectangle(device: &DeviceContext) -> Kernel {
        Kernel::compile(device, &SELECT_RECTANGLE).unwrap()
    }

    #[test]
    fn test_by_name_unknown() {
        let err = Kernel::by_name(&DeviceContext::host(), "radix_sort").unwrap_err();
        assert!(matches!(err, LayoutError::UnrecognizedConfiguration { kind: "kernel", .. }));
    }

    #[test]
    fn test_param_type_hides_internal_arguments() {
        let kernel = Kernel::compile(&DeviceContext::host(), &EDGE_SPRING).unwrap();

        assert_eq!(
            kernel.param_type("stiffness"),
            Some(ArgType::Scalar(ScalarKind::F32))
        );
        assert!(kernel.accepts("num_points"));
        assert_eq!(kernel.param_type("num_points"), None);
        assert_eq!(kernel.param_type("positions"), None);
        assert_eq!(kernel.param_type("gravity"), None);
    }

    #[test]
    fn test_set_is_all_or_nothing() {
        let kernel = rectangle(&DeviceContext::host());

        let err = kernel
            .set([("top", ArgValue::F32(0.0)), ("depth", ArgValue::F32(1.0))])
            .unwrap_err();
        assert!(matches!(
            err,
            LayoutError::UnrecognizedConfiguration { kind: "kernel argument", .. }
        ));
        assert!(kernel.bound_names().is_empty());

        let err = kernel
            .set([("left", ArgValue::F32(0.0)), ("num_points", ArgValue::F32(3.0))])
            .unwrap_err();
        assert!(matches!(
            err,
            LayoutError::UnrecognizedConfiguration { kind: "argument kind", .. }
        ));
        assert!(kernel.bound_names().is_empty());

        kernel
            .set([("left", ArgValue::F32(0.0)), ("top", ArgValue::F32(1.0))])
            .unwrap();
        assert_eq!(kernel.bound_names(), vec!["top", "left"]);
    }

    #[tokio::test]
    async fn test_exec_requires_every_argument() {
        let kernel = rectangle(&DeviceContext::host());
        kernel.set([("top", ArgValue::F32(0.0))]).unwrap();

        let err = kernel.exec(1, BufferDeps::new()).await.unwrap_err();
        assert_eq!(err.op, DeviceOp::Execute);
        assert_eq!(err.name, "select_rectangle");
        assert!(err.reason.contains("`left`"));
        assert!(err.site.contains("kernel.rs"));
        assert_eq!(kernel.stats().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let device = DeviceContext::host();
        let positions = device
            .create_buffer_init("positions", bytemuck::cast_slice(&[[0.0_f32, 0.0], [1.0, 0.0]]))
            .await
            .unwrap();
        let offsets = device
            .create_buffer_init("offsets", bytemuck::cast_slice(&[0_u32, 1, 1]))
            .await
            .unwrap();
        let destinations = device
            .create_buffer_init("destinations", bytemuck::cast_slice(&[1_u32]))
            .await
            .unwrap();
        let next = device.create_buffer("next", 16).await.unwrap();

        let kernel = Kernel::compile(&device, &EDGE_SPRING).unwrap();
        kernel
            .set([
                ("stiffness", ArgValue::F32(0.5)),
                ("step_size", ArgValue::F32(1.0)),
                ("num_points", ArgValue::U32(2)),
                ("positions", ArgValue::from(&positions)),
                ("forward_offsets", ArgValue::from(&offsets)),
                ("forward_destinations", ArgValue::from(&destinations)),
                ("next_positions", ArgValue::from(&next)),
            ])
            .unwrap();

        for _ in 0..3 {
            kernel.exec(2, BufferDeps::new()).await.unwrap();
        }

        let stats = kernel.stats().unwrap();
        assert_eq!(stats.calls, 3);
        assert!(stats.total >= stats.last);

        let mut points = [[0.0_f32; 2]; 2];
        next.read(bytemuck::cast_slice_mut(&mut points)).await.unwrap();
        assert_eq!(points, [[0.5, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_poisoned_stats_are_omitted() {
        let device = DeviceContext::host();
        let healthy = rectangle(&device);
        let poisoned = Kernel::compile(&device, &EDGE_SPRING).unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = poisoned.stats.lock().unwrap();
            panic!("poison the stats lock");
        }));

        assert!(poisoned.stats().is_none());
        let report = RuntimeReport::collect([&healthy], [&poisoned]);
        assert_eq!(report.len(), 1);
        assert!(report.get("select_rectangle").is_some());
        assert!(report.get("edge_spring").is_none());
    }

    #[test]
    fn test_report_merge_sums_calls() {
        let mut a = RuntimeReport::default();
        a.kernels.insert(
            "k",
            KernelStats {
                calls: 2,
                last: Duration::from_millis(1),
                total: Duration::from_millis(3),
            },
        );
        let mut b = RuntimeReport::default();
        b.kernels.insert(
            "k",
            KernelStats {
                calls: 1,
                last: Duration::from_millis(5),
                total: Duration::from_millis(5),
            },
        );

        a.merge(b);
        let k = a.get("k").unwrap();
        assert_eq!(k.calls, 3);
        assert_eq!(k.last, Duration::from_millis(5));
        assert_eq!(k.total, Duration::from_millis(8));
        assert_eq!(k.mean(), Duration::from_nanos(8_000_000 / 3));
    }
}
