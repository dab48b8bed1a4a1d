//! Host reference backend
//!
//! Buffers are word-aligned `Vec<u32>` allocations behind async read/write
//! locks. A dispatch locks every bound or declared buffer in ascending id
//! order (shared for reads, exclusive for writes), then runs the kernel on
//! the blocking pool. Conflicting dispatches therefore serialize while
//! disjoint ones run concurrently.

use super::{BufferDeps, DeviceBuffer, Storage};
use crate::error::{DeviceOp, DeviceOperationFailure};
use crate::kernel::ArgValue;
use crate::kernels::{Access, ArgDecl, ArgType};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::panic::Location;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Host kernel entry point
///
/// Returns a human-readable reason on failure.
pub type HostKernelFn = fn(&HostArgs, &mut HostOutputs) -> Result<(), String>;

/// Marker for the host device
#[derive(Debug)]
pub(crate) struct HostDevice;

/// Host-resident buffer storage
#[derive(Debug, Clone)]
pub(crate) struct HostBuffer {
    words: Arc<RwLock<Vec<u32>>>,
    byte_len: usize,
}

impl HostBuffer {
    pub(crate) async fn read(&self, out: &mut [u8]) {
        let words = self.words.read().await;
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        out.copy_from_slice(&bytes[..out.len()]);
    }

    pub(crate) async fn write(&self, data: &[u8]) {
        let mut words = self.words.write().await;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
        bytes[..data.len()].copy_from_slice(data);
    }
}

enum Guard {
    Shared(OwnedRwLockReadGuard<Vec<u32>>),
    Exclusive(OwnedRwLockWriteGuard<Vec<u32>>),
}

impl Guard {
    fn words(&self) -> &[u32] {
        match self {
            Self::Shared(g) => g.as_slice(),
            Self::Exclusive(g) => g.as_slice(),
        }
    }
}

struct InputView {
    guard: Guard,
    byte_len: usize,
}

struct OutputView {
    guard: OwnedRwLockWriteGuard<Vec<u32>>,
    byte_len: usize,
}

/// Typed element views over word storage
fn elements<T: bytemuck::Pod>(words: &[u32], byte_len: usize) -> &[T] {
    let count = byte_len / std::mem::size_of::<T>();
    let used = count * std::mem::size_of::<T>() / 4;
    bytemuck::cast_slice(&words[..used])
}

fn elements_mut<T: bytemuck::Pod>(words: &mut [u32], byte_len: usize) -> &mut [T] {
    let count = byte_len / std::mem::size_of::<T>();
    let used = count * std::mem::size_of::<T>() / 4;
    bytemuck::cast_slice_mut(&mut words[..used])
}

/// Read-only view of a dispatch's scalars and input buffers
pub struct HostArgs {
    global_size: u32,
    scalars: HashMap<&'static str, ArgValue>,
    inputs: HashMap<&'static str, InputView>,
}

impl HostArgs {
    /// Number of work items in this dispatch
    #[must_use]
    pub fn global_size(&self) -> u32 {
        self.global_size
    }

    /// Bound `f32` scalar
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound `f32`
    pub fn f32(&self, name: &str) -> Result<f32, String> {
        match self.scalars.get(name) {
            Some(ArgValue::F32(v)) => Ok(*v),
            _ => Err(format!("`{name}` is not a bound f32 argument")),
        }
    }

    /// Bound `u32` scalar
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound `u32`
    pub fn u32(&self, name: &str) -> Result<u32, String> {
        match self.scalars.get(name) {
            Some(ArgValue::U32(v)) => Ok(*v),
            _ => Err(format!("`{name}` is not a bound u32 argument")),
        }
    }

    fn input(&self, name: &str) -> Result<&InputView, String> {
        self.inputs
            .get(name)
            .ok_or_else(|| format!("`{name}` is not a bound input buffer"))
    }

    /// Input buffer viewed as `u32` elements
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound input buffer
    pub fn u32s(&self, name: &str) -> Result<&[u32], String> {
        let view = self.input(name)?;
        Ok(elements(view.guard.words(), view.byte_len))
    }

    /// Input buffer viewed as 2D points
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound input buffer
    pub fn vec2s(&self, name: &str) -> Result<&[[f32; 2]], String> {
        let view = self.input(name)?;
        Ok(elements(view.guard.words(), view.byte_len))
    }
}

/// Writable view of a dispatch's output buffers
pub struct HostOutputs {
    outputs: HashMap<&'static str, OutputView>,
}

impl HostOutputs {
    fn output(&mut self, name: &str) -> Result<&mut OutputView, String> {
        self.outputs
            .get_mut(name)
            .ok_or_else(|| format!("`{name}` is not a bound output buffer"))
    }

    /// Output buffer as raw bytes
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound output buffer
    pub fn bytes_mut(&mut self, name: &str) -> Result<&mut [u8], String> {
        let view = self.output(name)?;
        let len = view.byte_len;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut view.guard[..]);
        Ok(&mut bytes[..len])
    }

    /// Output buffer viewed as 2D points
    ///
    /// # Errors
    ///
    /// Returns a reason if `name` is not a bound output buffer
    pub fn vec2s_mut(&mut self, name: &str) -> Result<&mut [[f32; 2]], String> {
        let view = self.output(name)?;
        let len = view.byte_len;
        Ok(elements_mut(&mut view.guard[..], len))
    }
}

struct Planned {
    words: Arc<RwLock<Vec<u32>>>,
    byte_len: usize,
    exclusive: bool,
    arg: Option<(&'static str, Access)>,
}

fn host_storage(buffer: &DeviceBuffer) -> Option<&HostBuffer> {
    match buffer.storage() {
        Storage::Host(b) => Some(b),
        #[cfg(feature = "gpu")]
        Storage::Gpu { .. } => None,
    }
}

impl HostDevice {
    #[allow(clippy::unused_self)]
    pub(crate) fn allocate(
        &self,
        tag: &str,
        byte_len: u64,
        site: &'static Location<'static>,
    ) -> Result<HostBuffer, DeviceOperationFailure> {
        let byte_len = usize::try_from(byte_len).map_err(|_| {
            DeviceOperationFailure::at(DeviceOp::Allocate, tag, "size exceeds address space", site)
        })?;
        Ok(HostBuffer {
            words: Arc::new(RwLock::new(vec![0; byte_len.div_ceil(4)])),
            byte_len,
        })
    }

    #[allow(clippy::unused_self)]
    pub(crate) async fn dispatch(
        &self,
        kernel: &'static str,
        entry: HostKernelFn,
        bindings: Vec<(ArgDecl, ArgValue)>,
        global_size: u32,
        deps: &BufferDeps,
        site: &'static Location<'static>,
    ) -> Result<(), DeviceOperationFailure> {
        let fail = |reason: String| DeviceOperationFailure::at(DeviceOp::Execute, kernel, reason, site);

        let mut scalars = HashMap::new();
        let mut plan: BTreeMap<u64, Planned> = BTreeMap::new();

        for (decl, value) in bindings {
            match (decl.ty, value) {
                (ArgType::Scalar(_), v @ (ArgValue::F32(_) | ArgValue::U32(_))) => {
                    scalars.insert(decl.name, v);
                }
                (ArgType::Buffer(access), ArgValue::Buffer(buffer)) => {
                    let host = host_storage(&buffer).ok_or_else(|| {
                        fail(format!("buffer `{}` belongs to another backend", buffer.tag()))
                    })?;
                    match plan.entry(buffer.id()) {
                        Entry::Occupied(_) => {
                            return Err(fail(format!(
                                "buffer `{}` bound to more than one argument",
                                buffer.tag()
                            )));
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(Planned {
                                words: Arc::clone(&host.words),
                                byte_len: host.byte_len,
                                exclusive: access == Access::ReadWrite,
                                arg: Some((decl.name, access)),
                            });
                        }
                    }
                }
                _ => return Err(fail(format!("argument `{}` bound to wrong kind", decl.name))),
            }
        }

        let declared = deps
            .reads()
            .iter()
            .map(|b| (b, false))
            .chain(deps.writes().iter().map(|b| (b, true)));
        for (buffer, write) in declared {
            let host = host_storage(buffer).ok_or_else(|| {
                fail(format!("dependency `{}` belongs to another backend", buffer.tag()))
            })?;
            let planned = plan.entry(buffer.id()).or_insert_with(|| Planned {
                words: Arc::clone(&host.words),
                byte_len: host.byte_len,
                exclusive: false,
                arg: None,
            });
            planned.exclusive |= write;
        }

        // Ascending id order keeps concurrent dispatches deadlock-free.
        let mut inputs = HashMap::new();
        let mut outputs = HashMap::new();
        let mut held = Vec::new();
        for planned in plan.into_values() {
            let Planned {
                words,
                byte_len,
                exclusive,
                arg,
            } = planned;
            match arg {
                Some((name, Access::ReadWrite)) => {
                    let guard = words.write_owned().await;
                    outputs.insert(name, OutputView { guard, byte_len });
                }
                other => {
                    let guard = if exclusive {
                        Guard::Exclusive(words.write_owned().await)
                    } else {
                        Guard::Shared(words.read_owned().await)
                    };
                    match other {
                        Some((name, _)) => {
                            inputs.insert(name, InputView { guard, byte_len });
                        }
                        None => held.push(guard),
                    }
                }
            }
        }

        tracing::trace!(kernel, global_size, locked = inputs.len() + outputs.len() + held.len(), "host dispatch");

        let args = HostArgs {
            global_size,
            scalars,
            inputs,
        };
        let mut outputs = HostOutputs { outputs };
        let joined = tokio::task::spawn_blocking(move || {
            let result = entry(&args, &mut outputs);
            drop(held);
            result
        })
        .await;

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(fail(reason)),
            Err(e) => Err(fail(format!("host kernel task failed: {e}"))),
        }
    }
}
