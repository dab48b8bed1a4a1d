//! Compute device abstraction
//!
//! A [`DeviceContext`] is either the host reference backend (always
//! available, kernels run on the blocking thread pool) or the wgpu backend
//! (feature `gpu`). Both expose the same asynchronous operations: buffer
//! allocation, host↔device transfer, kernel compilation and dispatch.
//!
//! Dispatch ordering is the device's job. Callers declare which buffers a
//! dispatch reads and writes ([`BufferDeps`]); the host backend turns those
//! into per-buffer async read/write locks, the GPU backend relies on queue
//! submission order.

mod host;

#[cfg(feature = "gpu")]
mod gpu;

pub use host::{HostArgs, HostKernelFn, HostOutputs};

#[cfg(feature = "gpu")]
pub use gpu::{GpuDevice, GpuDeviceError};

use crate::error::{DeviceOp, DeviceOperationFailure, LayoutError};
use crate::kernel::ArgValue;
use crate::kernels::{ArgDecl, KernelSource};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Which backend a [`DeviceContext`] runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host reference backend
    #[default]
    Host,
    /// wgpu backend (feature `gpu`)
    Gpu,
}

impl FromStr for BackendKind {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Self::Host),
            "gpu" | "wgpu" => Ok(Self::Gpu),
            _ => Err(LayoutError::unrecognized("backend", s)),
        }
    }
}

enum Backend {
    Host(host::HostDevice),
    #[cfg(feature = "gpu")]
    Gpu(Arc<gpu::GpuDevice>),
}

/// Shared handle to a compute device
#[derive(Clone)]
pub struct DeviceContext {
    backend: Arc<Backend>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl DeviceContext {
    /// Host reference device
    #[must_use]
    pub fn host() -> Self {
        Self {
            backend: Arc::new(Backend::Host(host::HostDevice)),
        }
    }

    /// Wrap an initialized GPU device
    #[cfg(feature = "gpu")]
    #[must_use]
    pub fn from_gpu(device: GpuDevice) -> Self {
        Self {
            backend: Arc::new(Backend::Gpu(Arc::new(device))),
        }
    }

    /// Open a device of the requested kind
    ///
    /// # Errors
    ///
    /// - `UnrecognizedConfiguration` if `gpu` is requested without the `gpu` feature
    /// - `Device` if no GPU adapter/device can be acquired
    pub async fn open(kind: BackendKind) -> Result<Self, LayoutError> {
        match kind {
            BackendKind::Host => Ok(Self::host()),
            #[cfg(feature = "gpu")]
            BackendKind::Gpu => {
                let device = GpuDevice::new().await.map_err(|e| {
                    DeviceOperationFailure::new(DeviceOp::Allocate, "gpu device", e.to_string())
                })?;
                tracing::info!(adapter = %device.info().name, "GPU device opened");
                Ok(Self::from_gpu(device))
            }
            #[cfg(not(feature = "gpu"))]
            BackendKind::Gpu => Err(LayoutError::unrecognized(
                "backend (built without `gpu` feature)",
                "gpu",
            )),
        }
    }

    /// Backend name for diagnostics
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        match &*self.backend {
            Backend::Host(_) => "host",
            #[cfg(feature = "gpu")]
            Backend::Gpu(_) => "gpu",
        }
    }

    /// Allocate a zeroed buffer of `byte_len` bytes
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if the backend cannot allocate
    #[track_caller]
    pub fn create_buffer(
        &self,
        tag: &str,
        byte_len: u64,
    ) -> impl Future<Output = Result<DeviceBuffer, DeviceOperationFailure>> + '_ {
        let site = Location::caller();
        let tag = tag.to_owned();
        async move {
            let storage = match &*self.backend {
                Backend::Host(dev) => Storage::Host(dev.allocate(&tag, byte_len, site)?),
                #[cfg(feature = "gpu")]
                Backend::Gpu(dev) => Storage::Gpu {
                    buffer: dev.allocate(&tag, byte_len, site)?,
                    device: Arc::clone(dev),
                },
            };
            tracing::debug!(tag = %tag, byte_len, backend = self.backend_name(), "buffer allocated");
            Ok(DeviceBuffer {
                inner: Arc::new(BufferInner {
                    id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                    tag,
                    byte_len,
                    storage,
                }),
            })
        }
    }

    /// Allocate a buffer and upload `contents`
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if allocation or upload fails
    #[track_caller]
    pub fn create_buffer_init<'a>(
        &'a self,
        tag: &str,
        contents: &'a [u8],
    ) -> impl Future<Output = Result<DeviceBuffer, DeviceOperationFailure>> + 'a {
        let site = Location::caller();
        let tag = tag.to_owned();
        async move {
            let buffer = self.create_buffer(&tag, contents.len() as u64).await?;
            buffer.write_at(contents, site).await?;
            Ok(buffer)
        }
    }

    pub(crate) fn compile(
        &self,
        source: &'static KernelSource,
        site: &'static Location<'static>,
    ) -> Result<Program, DeviceOperationFailure> {
        match &*self.backend {
            Backend::Host(_) => Ok(Program::Host(source.host)),
            #[cfg(feature = "gpu")]
            Backend::Gpu(dev) => Ok(Program::Gpu(dev.compile(source, site)?)),
        }
        .map(|program| {
            tracing::debug!(kernel = source.name, backend = self.backend_name(), %site, "kernel compiled");
            program
        })
    }

    pub(crate) async fn dispatch(
        &self,
        kernel: &'static str,
        program: &Program,
        bindings: Vec<(ArgDecl, ArgValue)>,
        global_size: u32,
        deps: &BufferDeps,
        site: &'static Location<'static>,
    ) -> Result<(), DeviceOperationFailure> {
        match (&*self.backend, program) {
            (Backend::Host(dev), Program::Host(f)) => {
                dev.dispatch(kernel, *f, bindings, global_size, deps, site)
                    .await
            }
            #[cfg(feature = "gpu")]
            (Backend::Gpu(dev), Program::Gpu(p)) => {
                dev.dispatch(kernel, p, &bindings, global_size, site)
            }
            #[cfg(feature = "gpu")]
            _ => Err(DeviceOperationFailure::at(
                DeviceOp::Execute,
                kernel,
                "program was compiled for another backend",
                site,
            )),
        }
    }
}

/// Backend-specific compiled program
pub(crate) enum Program {
    Host(HostKernelFn),
    #[cfg(feature = "gpu")]
    Gpu(gpu::GpuProgram),
}

pub(crate) enum Storage {
    Host(host::HostBuffer),
    #[cfg(feature = "gpu")]
    Gpu {
        buffer: wgpu::Buffer,
        device: Arc<gpu::GpuDevice>,
    },
}

struct BufferInner {
    id: u64,
    tag: String,
    byte_len: u64,
    storage: Storage,
}

/// Handle to a device buffer
///
/// Cloning is cheap and shares the same allocation. `byte_len` is the
/// logical length requested at allocation.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("tag", &self.inner.tag)
            .field("byte_len", &self.inner.byte_len)
            .finish()
    }
}

impl DeviceBuffer {
    /// Process-unique buffer id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Allocation tag
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Logical length in bytes
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.inner.byte_len
    }

    /// Whether both handles refer to the same allocation
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Read the first `out.len()` bytes into host memory
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if `out` is longer than the buffer or
    /// the transfer fails
    #[track_caller]
    pub fn read<'a>(
        &'a self,
        out: &'a mut [u8],
    ) -> impl Future<Output = Result<(), DeviceOperationFailure>> + 'a {
        let site = Location::caller();
        async move {
            if out.len() as u64 > self.byte_len() {
                return Err(DeviceOperationFailure::at(
                    DeviceOp::Read,
                    self.tag(),
                    format!("read of {} bytes exceeds length {}", out.len(), self.byte_len()),
                    site,
                ));
            }
            self.read_at(out, site).await
        }
    }

    /// Read the whole buffer into a new vector
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if the transfer fails
    #[track_caller]
    pub fn read_to_vec(&self) -> impl Future<Output = Result<Vec<u8>, DeviceOperationFailure>> + '_ {
        let site = Location::caller();
        async move {
            #[allow(clippy::cast_possible_truncation)]
            let mut out = vec![0_u8; self.byte_len() as usize];
            self.read_at(&mut out, site).await?;
            Ok(out)
        }
    }

    async fn read_at(
        &self,
        out: &mut [u8],
        site: &'static Location<'static>,
    ) -> Result<(), DeviceOperationFailure> {
        match &self.inner.storage {
            Storage::Host(buf) => {
                buf.read(out).await;
                Ok(())
            }
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, device } => device.read(buffer, out).await.map_err(|e| {
                DeviceOperationFailure::at(DeviceOp::Read, self.tag(), format!("{e:#}"), site)
            }),
        }
    }

    /// Upload `bytes` at offset 0
    ///
    /// # Errors
    ///
    /// Returns `DeviceOperationFailure` if `bytes` is longer than the buffer
    #[track_caller]
    pub fn write<'a>(
        &'a self,
        bytes: &'a [u8],
    ) -> impl Future<Output = Result<(), DeviceOperationFailure>> + 'a {
        let site = Location::caller();
        self.write_at(bytes, site)
    }

    async fn write_at(
        &self,
        bytes: &[u8],
        site: &'static Location<'static>,
    ) -> Result<(), DeviceOperationFailure> {
        if bytes.len() as u64 > self.byte_len() {
            return Err(DeviceOperationFailure::at(
                DeviceOp::Write,
                self.tag(),
                format!("write of {} bytes exceeds length {}", bytes.len(), self.byte_len()),
                site,
            ));
        }
        match &self.inner.storage {
            Storage::Host(buf) => {
                buf.write(bytes).await;
                Ok(())
            }
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, device } => {
                device.write(buffer, bytes, self.byte_len()).map_err(|e| {
                    DeviceOperationFailure::at(DeviceOp::Write, self.tag(), format!("{e:#}"), site)
                })
            }
        }
    }
}

/// Buffers a dispatch reads and writes
///
/// The device orders a dispatch after earlier dispatches that write any of
/// its reads, and after any earlier access to its writes.
#[derive(Debug, Clone, Default)]
pub struct BufferDeps {
    reads: Vec<DeviceBuffer>,
    writes: Vec<DeviceBuffer>,
}

impl BufferDeps {
    /// No dependencies
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read dependency
    #[must_use]
    pub fn read(mut self, buffer: &DeviceBuffer) -> Self {
        self.reads.push(buffer.clone());
        self
    }

    /// Declare a write dependency
    #[must_use]
    pub fn write(mut self, buffer: &DeviceBuffer) -> Self {
        self.writes.push(buffer.clone());
        self
    }

    /// Declared reads
    #[must_use]
    pub fn reads(&self) -> &[DeviceBuffer] {
        &self.reads
    }

    /// Declared writes
    #[must_use]
    pub fn writes(&self) -> &[DeviceBuffer] {
        &self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_buffer_roundtrip() {
        let device = DeviceContext::host();
        let buffer = device.create_buffer_init("roundtrip", &[1, 2, 3, 4, 5]).await.unwrap();

        assert_eq!(buffer.byte_len(), 5);
        assert_eq!(buffer.read_to_vec().await.unwrap(), vec![1, 2, 3, 4, 5]);

        let mut head = [0_u8; 2];
        buffer.read(&mut head).await.unwrap();
        assert_eq!(head, [1, 2]);
    }

    #[tokio::test]
    async fn test_oversized_transfer_rejected() {
        let device = DeviceContext::host();
        let buffer = device.create_buffer("small", 2).await.unwrap();

        let err = buffer.write(&[0; 3]).await.unwrap_err();
        assert_eq!(err.op, DeviceOp::Write);
        assert_eq!(err.name, "small");

        let mut out = [0_u8; 8];
        let err = buffer.read(&mut out).await.unwrap_err();
        assert_eq!(err.op, DeviceOp::Read);
    }

    #[tokio::test]
    async fn test_buffer_ids_unique() {
        let device = DeviceContext::host();
        let a = device.create_buffer("a", 4).await.unwrap();
        let b = device.create_buffer("b", 4).await.unwrap();

        assert!(!a.same_as(&b));
        assert!(a.same_as(&a.clone()));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("host".parse::<BackendKind>().unwrap(), BackendKind::Host);
        assert_eq!("WGPU".parse::<BackendKind>().unwrap(), BackendKind::Gpu);
        assert!(matches!(
            "opencl".parse::<BackendKind>(),
            Err(LayoutError::UnrecognizedConfiguration { kind: "backend", .. })
        ));
    }

    #[cfg(not(feature = "gpu"))]
    #[tokio::test]
    async fn test_gpu_backend_requires_feature() {
        let err = DeviceContext::open(BackendKind::Gpu).await.unwrap_err();
        assert!(matches!(err, LayoutError::UnrecognizedConfiguration { .. }));
    }
}
