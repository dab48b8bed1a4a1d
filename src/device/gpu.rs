//! wgpu compute backend
//!
//! Handles wgpu device creation, adapter selection, pipeline compilation and
//! dispatch. Scalars travel in a per-dispatch uniform block at `@binding(0)`,
//! buffers follow in declaration order.

use super::Storage;
use crate::error::{DeviceOp, DeviceOperationFailure};
use crate::kernel::ArgValue;
use crate::kernels::{Access, ArgDecl, ArgType, KernelSource, WORKGROUP_SIZE};
use anyhow::{Context, Result};
use std::panic::Location;
use thiserror::Error;
use wgpu::util::DeviceExt;

/// GPU device initialization errors
#[derive(Debug, Error)]
pub enum GpuDeviceError {
    /// No compatible GPU adapter found
    #[error("No compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request GPU device
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),
}

/// GPU device wrapper
#[derive(Debug)]
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
}

/// Compiled compute pipeline plus its bind group layout
#[derive(Debug)]
pub(crate) struct GpuProgram {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// Physical size backing a logical length (storage bindings are word-sized)
fn padded_size(byte_len: u64) -> u64 {
    byte_len.div_ceil(4).max(1) * 4
}

fn layout_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuDevice {
    /// Check if GPU is available without keeping a device
    ///
    /// This is useful for tests to skip gracefully when GPU is not available.
    pub async fn is_gpu_available() -> bool {
        Self::new().await.is_ok()
    }

    /// Initialize GPU device with default settings
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if no adapter is found or the device request fails
    pub async fn new() -> Result<Self, GpuDeviceError> {
        Self::new_with_backend(wgpu::Backends::all()).await
    }

    /// Initialize GPU device with specific backend
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if device initialization fails
    pub async fn new_with_backend(backends: wgpu::Backends) -> Result<Self, GpuDeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuDeviceError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("trueno-layout GPU device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuDeviceError::DeviceRequest(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            adapter,
        })
    }

    /// Get adapter info (GPU name, backend, etc.)
    #[must_use]
    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Get device reference
    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get queue reference
    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub(crate) fn allocate(
        &self,
        tag: &str,
        byte_len: u64,
        site: &'static Location<'static>,
    ) -> Result<wgpu::Buffer, DeviceOperationFailure> {
        let size = padded_size(byte_len);
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(DeviceOperationFailure::at(
                DeviceOp::Allocate,
                tag,
                format!("{size} bytes exceeds device limit {limit}"),
                site,
            ));
        }
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(tag),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    pub(crate) fn compile(
        &self,
        source: &'static KernelSource,
        site: &'static Location<'static>,
    ) -> Result<GpuProgram, DeviceOperationFailure> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source.name),
                source: wgpu::ShaderSource::Wgsl(source.wgsl.into()),
            });

        let entries: Vec<_> = std::iter::once(layout_entry(0, wgpu::BufferBindingType::Uniform))
            .chain(source.buffers().zip(1..).map(|(arg, binding)| {
                let read_only = arg.ty == ArgType::Buffer(Access::Read);
                layout_entry(binding, wgpu::BufferBindingType::Storage { read_only })
            }))
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(source.name),
                entries: &entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(source.name),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(source.name),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: source.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        if let Some(err) = futures::executor::block_on(self.device.pop_error_scope()) {
            return Err(DeviceOperationFailure::at(
                DeviceOp::Compile,
                source.name,
                err.to_string(),
                site,
            ));
        }
        Ok(GpuProgram { pipeline, layout })
    }

    pub(crate) fn dispatch(
        &self,
        kernel: &'static str,
        program: &GpuProgram,
        bindings: &[(ArgDecl, ArgValue)],
        global_size: u32,
        site: &'static Location<'static>,
    ) -> Result<(), DeviceOperationFailure> {
        let fail = |reason: String| DeviceOperationFailure::at(DeviceOp::Execute, kernel, reason, site);

        // Uniform blocks are sized in 16-byte units
        let mut words: Vec<u32> = bindings
            .iter()
            .filter_map(|(_, value)| match value {
                ArgValue::F32(v) => Some(v.to_bits()),
                ArgValue::U32(v) => Some(*v),
                ArgValue::Buffer(_) => None,
            })
            .collect();
        words.resize(words.len().div_ceil(4).max(1) * 4, 0);

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(kernel),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut buffers = Vec::new();
        for (decl, value) in bindings {
            if let ArgValue::Buffer(buffer) = value {
                match buffer.storage() {
                    Storage::Gpu { buffer, .. } => buffers.push(buffer),
                    Storage::Host(_) => {
                        return Err(fail(format!("argument `{}` is a host buffer", decl.name)));
                    }
                }
            }
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let entries: Vec<_> = std::iter::once(params.as_entire_binding())
            .chain(buffers.iter().map(|b| b.as_entire_binding()))
            .zip(0..)
            .map(|(resource, binding)| wgpu::BindGroupEntry { binding, resource })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel),
            layout: &program.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(kernel) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(global_size.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(err) = futures::executor::block_on(self.device.pop_error_scope()) {
            return Err(fail(err.to_string()));
        }
        self.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    /// Copy the first `out.len()` bytes of `buffer` back to host memory
    pub(crate) async fn read(&self, buffer: &wgpu::Buffer, out: &mut [u8]) -> Result<()> {
        let size = padded_size(out.len() as u64);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);
        rx.receive()
            .await
            .context("Failed to receive map result")?
            .context("Buffer mapping failed")?;

        let data = slice.get_mapped_range();
        out.copy_from_slice(&data[..out.len()]);
        drop(data);
        staging.unmap();
        Ok(())
    }

    /// Upload `bytes` at offset 0
    ///
    /// Queue writes are word-granular, so an unaligned upload is only allowed
    /// when it covers the whole logical buffer (the padding is not data).
    pub(crate) fn write(&self, buffer: &wgpu::Buffer, bytes: &[u8], logical_len: u64) -> Result<()> {
        if bytes.len() % 4 == 0 {
            self.queue.write_buffer(buffer, 0, bytes);
            return Ok(());
        }
        anyhow::ensure!(
            bytes.len() as u64 == logical_len,
            "unaligned partial write of {} bytes",
            bytes.len()
        );
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len().div_ceil(4) * 4, 0);
        self.queue.write_buffer(buffer, 0, &padded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferDeps, DeviceContext};
    use crate::kernel::Kernel;
    use crate::kernels::SELECT_RECTANGLE;

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(1), 4);
        assert_eq!(padded_size(8), 8);
        assert_eq!(padded_size(9), 12);
    }

    #[tokio::test]
    async fn test_gpu_adapter_info() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_gpu_adapter_info: GPU not available");
            return;
        }

        let device = GpuDevice::new().await.unwrap();
        assert!(!device.info().name.is_empty(), "Adapter name should not be empty");
    }

    #[tokio::test]
    async fn test_gpu_rectangle_selection_matches_host() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_gpu_rectangle_selection_matches_host: GPU not available");
            return;
        }

        let device = DeviceContext::from_gpu(GpuDevice::new().await.unwrap());
        let points: Vec<[f32; 2]> = (0..10).map(|i| [i as f32, 0.0]).collect();
        let positions = device
            .create_buffer_init("positions", bytemuck::cast_slice(&points))
            .await
            .unwrap();
        let mask = device.create_buffer("mask", 10).await.unwrap();

        let kernel = Kernel::compile(&device, &SELECT_RECTANGLE).unwrap();
        kernel
            .set([
                ("top", ArgValue::F32(-1.0)),
                ("left", ArgValue::F32(2.0)),
                ("bottom", ArgValue::F32(1.0)),
                ("right", ArgValue::F32(4.0)),
                ("num_points", ArgValue::U32(10)),
                ("positions", ArgValue::Buffer(positions.clone())),
                ("mask", ArgValue::Buffer(mask.clone())),
            ])
            .unwrap();
        kernel
            .exec(10, BufferDeps::new().read(&positions).write(&mask))
            .await
            .unwrap();

        let bytes = mask.read_to_vec().await.unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 1, 1, 0, 0, 0, 0, 0]);
    }
}
