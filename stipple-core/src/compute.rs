//! # Compute Device Orchestration
//!
//! Process-wide compute context plus a named-kernel registry, built on wgpu
//! compute pipelines.
//!
//! The context (instance, adapter, device, queue) is created lazily when the
//! first handle is acquired and torn down when the last handle drops. Every
//! caller in the process shares the same underlying device while at least one
//! handle is alive.
//!
//! Kernels are WGSL compute shaders compiled from source at runtime and
//! addressed by name. Each kernel owns a private table of named device
//! buffers and a set of argument bindings, so callers can set up a kernel
//! once and re-execute it frame after frame.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use wgpu::util::DeviceExt;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("no usable compute device: {0}")]
    DeviceUnavailable(String),
    #[error("kernel \"{kernel}\" failed to compile: {log}")]
    Compile { kernel: String, log: String },
    #[error("\"{0}\" already exists")]
    AlreadyExists(String),
    #[error("no kernel named \"{0}\"")]
    KernelNotFound(String),
    #[error("kernel \"{kernel}\" has no buffer named \"{buffer}\"")]
    BufferNotFound { kernel: String, buffer: String },
    #[error("buffer \"{buffer}\" holds {device} bytes but host data is {host} bytes")]
    SizeMismatch {
        buffer: String,
        device: usize,
        host: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("kernel \"{kernel}\" failed to execute: {reason}")]
    Execute { kernel: String, reason: String },
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Access mode of a device buffer, from the kernel's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Written by the host, read by the kernel.
    ReadOnly,
    /// Written by the kernel, read back by the host.
    WriteOnly,
    /// Both directions.
    ReadWrite,
}

impl BufferAccess {
    fn usages(self) -> wgpu::BufferUsages {
        match self {
            BufferAccess::ReadOnly => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST
            }
            BufferAccess::WriteOnly => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC
            }
            BufferAccess::ReadWrite => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        }
    }
}

/// Rounds a byte count up to wgpu's copy alignment (4 bytes).
fn aligned_size(bytes: u64) -> u64 {
    bytes.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

/// 2-D work-group ("tile") selection.
///
/// Starts from floor(sqrt(preferred)) per axis, then shrinks each axis until
/// it divides the corresponding image dimension. Some backends dispatch
/// fastest when the local size divides the global size; a 1x1 tile is the
/// accepted worst-case fallback (the dispatch still succeeds, just without
/// cross-item parallelism inside a group).
pub fn select_tile_sizes(preferred: u32, width: u32, height: u32) -> [u32; 2] {
    let mut tile_0 = (f64::from(preferred)).sqrt() as u32;
    if tile_0 == 0 {
        tile_0 = 1;
    }
    let mut tile_1 = tile_0;
    while tile_0 > 1 && width % tile_0 != 0 {
        tile_0 -= 1;
    }
    while tile_1 > 1 && height % tile_1 != 0 {
        tile_1 -= 1;
    }
    [tile_0, tile_1]
}

// ============================================================================
// Context
// ============================================================================

struct ComputeContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    valid: Arc<AtomicBool>,
}

impl ComputeContext {
    /// Acquires an adapter (discrete/integrated GPU preferred, software
    /// rasterizer fallback) and creates one device with one in-order queue.
    fn acquire() -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            },
        ))
        .or_else(|| {
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: true,
            }))
        })
        .ok_or_else(|| ComputeError::DeviceUnavailable("no adapter found".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("stipple_compute"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| ComputeError::DeviceUnavailable(format!("device request failed: {e}")))?;

        let valid = Arc::new(AtomicBool::new(true));
        let lost_flag = valid.clone();
        device.set_device_lost_callback(move |_reason, message| {
            tracing::error!("compute device lost: {message}");
            lost_flag.store(false, Ordering::Release);
        });
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!("uncaptured device error: {error}");
        }));

        let adapter_name = adapter.get_info().name;
        tracing::info!("compute device: {}", adapter_name);

        Ok(Self {
            device,
            queue,
            adapter_name,
            valid,
        })
    }
}

// ============================================================================
// Kernel registry
// ============================================================================

struct BufferRecord {
    buffer: wgpu::Buffer,
    /// Logical size in bytes, as requested by the caller. The device
    /// allocation may be padded up to copy alignment.
    size: u64,
    #[allow(dead_code)]
    access: BufferAccess,
}

enum ArgBinding {
    /// A named buffer from the kernel's buffer table.
    Buffer(String),
    /// A by-value scalar or small struct, stored in a uniform buffer.
    Value { buffer: wgpu::Buffer, size: u64 },
}

struct CompiledPipeline {
    pipeline: wgpu::ComputePipeline,
    local: [u32; 2],
}

struct KernelEntry {
    module: wgpu::ShaderModule,
    entry_point: String,
    /// Compiled lazily against a concrete local size; recompiled only when
    /// the requested local size changes.
    pipeline: Option<CompiledPipeline>,
    buffers: HashMap<String, BufferRecord>,
    args: BTreeMap<u32, ArgBinding>,
}

/// Workgroup dimensions baked into a kernel at creation time, matching the
/// `tile_w`/`tile_h` override defaults in shader source.
const DEFAULT_TILE: [u32; 2] = [16, 16];

/// Error scopes form one per-device stack, so tests that push and pop them
/// from several threads would observe each other's failures; device-touching
/// tests serialize on this.
#[cfg(test)]
pub(crate) static DEVICE_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Process-wide slot holding a weak reference to the outstanding handle.
/// The handle itself is the only strong owner of the context, so dropping
/// the last `Arc<ComputeHandle>` releases the device and queue.
static HANDLE_SLOT: Lazy<Mutex<Weak<ComputeHandle>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Returns the shared compute handle, creating the underlying context on
/// first use.
///
/// Fails with [`ComputeError::DeviceUnavailable`] when neither a hardware
/// adapter nor the software fallback can be initialized.
pub fn acquire_handle() -> Result<Arc<ComputeHandle>, ComputeError> {
    let mut slot = HANDLE_SLOT.lock();
    if let Some(handle) = slot.upgrade() {
        return Ok(handle);
    }
    let context = ComputeContext::acquire()?;
    let handle = Arc::new(ComputeHandle {
        context,
        kernels: Mutex::new(HashMap::new()),
    });
    *slot = Arc::downgrade(&handle);
    Ok(handle)
}

/// A reference-counted accessor that keeps the compute context alive and
/// owns a private kernel registry.
///
/// All operations are addressed by kernel/buffer name; name collisions are
/// errors rather than silent replacements.
pub struct ComputeHandle {
    context: ComputeContext,
    kernels: Mutex<HashMap<String, KernelEntry>>,
}

impl ComputeHandle {
    /// Whether the device behind this handle is still usable.
    pub fn is_valid(&self) -> bool {
        self.context.valid.load(Ordering::Acquire)
    }

    /// Name of the adapter backing the context.
    pub fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    /// Compiles WGSL source and registers it under `kernel_name`, which must
    /// also be the entry-point function name in the source.
    ///
    /// Shaders that want a runtime-selectable work-group size declare
    /// pipeline overrides `tile_w`/`tile_h`; other shaders are only
    /// dispatchable with the local size baked into their `@workgroup_size`.
    pub fn create_kernel_from_source(
        &self,
        source: &str,
        kernel_name: &str,
    ) -> Result<(), ComputeError> {
        if !self.is_valid() {
            return Err(ComputeError::DeviceUnavailable(
                "compute device lost".to_string(),
            ));
        }
        let mut kernels = self.kernels.lock();
        if kernels.contains_key(kernel_name) {
            return Err(ComputeError::AlreadyExists(kernel_name.to_string()));
        }

        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel_name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        // Building a pipeline eagerly validates the entry point and binding
        // interface, so a bad kernel fails here instead of at first dispatch.
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel_name),
            layout: None,
            module: &module,
            entry_point: Some(kernel_name),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ComputeError::Compile {
                kernel: kernel_name.to_string(),
                log: error.to_string(),
            });
        }

        kernels.insert(
            kernel_name.to_string(),
            KernelEntry {
                module,
                entry_point: kernel_name.to_string(),
                pipeline: Some(CompiledPipeline {
                    pipeline,
                    local: DEFAULT_TILE,
                }),
                buffers: HashMap::new(),
                args: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Loads WGSL source from a file and delegates to
    /// [`create_kernel_from_source`](Self::create_kernel_from_source).
    pub fn create_kernel_from_file(
        &self,
        path: impl AsRef<Path>,
        kernel_name: &str,
    ) -> Result<(), ComputeError> {
        let source = std::fs::read_to_string(path)?;
        self.create_kernel_from_source(&source, kernel_name)
    }

    /// Allocates a device buffer of `byte_size` bytes under `buffer_name`,
    /// optionally initialized from host memory. The buffer lives until its
    /// kernel entry is cleaned up; its size is immutable once created.
    pub fn create_buffer(
        &self,
        kernel_name: &str,
        access: BufferAccess,
        byte_size: usize,
        host_init: Option<&[u8]>,
        buffer_name: &str,
    ) -> Result<(), ComputeError> {
        if byte_size == 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "buffer \"{buffer_name}\" must have a non-zero size"
            )));
        }
        let mut kernels = self.kernels.lock();
        let entry = kernels
            .get_mut(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;
        if entry.buffers.contains_key(buffer_name) {
            return Err(ComputeError::AlreadyExists(buffer_name.to_string()));
        }
        if let Some(init) = host_init {
            if init.len() > byte_size {
                return Err(ComputeError::SizeMismatch {
                    buffer: buffer_name.to_string(),
                    device: byte_size,
                    host: init.len(),
                });
            }
        }

        let device = &self.context.device;
        let buffer = match host_init {
            Some(init) => {
                let mut contents = init.to_vec();
                contents.resize(byte_size, 0);
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(buffer_name),
                    contents: &contents,
                    usage: access.usages(),
                })
            }
            None => device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(buffer_name),
                size: aligned_size(byte_size as u64),
                usage: access.usages(),
                mapped_at_creation: false,
            }),
        };
        entry.buffers.insert(
            buffer_name.to_string(),
            BufferRecord {
                buffer,
                size: byte_size as u64,
                access,
            },
        );
        Ok(())
    }

    /// Host-to-device copy. Writing fewer bytes than the buffer holds
    /// succeeds with a warning; writing more is an error.
    pub fn write_buffer(
        &self,
        kernel_name: &str,
        buffer_name: &str,
        data: &[u8],
    ) -> Result<(), ComputeError> {
        let kernels = self.kernels.lock();
        let entry = kernels
            .get(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;
        let record = entry
            .buffers
            .get(buffer_name)
            .ok_or_else(|| ComputeError::BufferNotFound {
                kernel: kernel_name.to_string(),
                buffer: buffer_name.to_string(),
            })?;

        if data.len() as u64 > record.size {
            return Err(ComputeError::SizeMismatch {
                buffer: buffer_name.to_string(),
                device: record.size as usize,
                host: data.len(),
            });
        }
        if (data.len() as u64) < record.size {
            tracing::warn!(
                "writing {} bytes into buffer \"{}\" of {} bytes",
                data.len(),
                buffer_name,
                record.size
            );
        }
        if data.is_empty() {
            return Ok(());
        }

        // The staging copy completes before the queue sees any later work,
        // so callers may reuse the host slice immediately.
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.context.queue.write_buffer(&record.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned_size(data.len() as u64) as usize, 0);
            self.context.queue.write_buffer(&record.buffer, 0, &padded);
        }
        Ok(())
    }

    /// Binds a previously created buffer as the kernel argument at
    /// `arg_index` (the WGSL `@binding` index).
    pub fn bind_buffer(
        &self,
        kernel_name: &str,
        arg_index: u32,
        buffer_name: &str,
    ) -> Result<(), ComputeError> {
        let mut kernels = self.kernels.lock();
        let entry = kernels
            .get_mut(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;
        if !entry.buffers.contains_key(buffer_name) {
            return Err(ComputeError::BufferNotFound {
                kernel: kernel_name.to_string(),
                buffer: buffer_name.to_string(),
            });
        }
        entry
            .args
            .insert(arg_index, ArgBinding::Buffer(buffer_name.to_string()));
        Ok(())
    }

    /// Binds a scalar or small struct by value at `arg_index`. The bytes are
    /// uploaded into a uniform buffer owned by the kernel entry; rebinding
    /// the same index with the same size reuses the allocation.
    pub fn bind_value(
        &self,
        kernel_name: &str,
        arg_index: u32,
        data: &[u8],
    ) -> Result<(), ComputeError> {
        if data.is_empty() {
            return Err(ComputeError::InvalidArgument(
                "by-value argument must not be empty".to_string(),
            ));
        }
        let mut kernels = self.kernels.lock();
        let entry = kernels
            .get_mut(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;

        if let Some(ArgBinding::Value { buffer, size }) = entry.args.get(&arg_index) {
            if *size == data.len() as u64 {
                let mut padded = data.to_vec();
                padded.resize(aligned_size(data.len() as u64) as usize, 0);
                self.context.queue.write_buffer(buffer, 0, &padded);
                return Ok(());
            }
        }

        let mut contents = data.to_vec();
        contents.resize(aligned_size(data.len() as u64) as usize, 0);
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("stipple_value_arg"),
                contents: &contents,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        entry.args.insert(
            arg_index,
            ArgBinding::Value {
                buffer,
                size: data.len() as u64,
            },
        );
        Ok(())
    }

    /// Enqueues a 1-D dispatch. See [`execute_2d`](Self::execute_2d).
    pub fn execute_1d(
        &self,
        kernel_name: &str,
        global: u32,
        local: u32,
        blocking: bool,
    ) -> Result<(), ComputeError> {
        self.execute_2d(kernel_name, [global, 1], [local, 1], blocking)
    }

    /// Enqueues the kernel over a `global[0] x global[1]` grid with
    /// `local`-sized work groups. With `blocking` set, returns only after
    /// the device has finished the dispatch.
    ///
    /// When `local` does not divide `global` the grid is rounded up; kernels
    /// are expected to bounds-check their invocation id.
    pub fn execute_2d(
        &self,
        kernel_name: &str,
        global: [u32; 2],
        local: [u32; 2],
        blocking: bool,
    ) -> Result<(), ComputeError> {
        if global[0] == 0 || global[1] == 0 || local[0] == 0 || local[1] == 0 {
            return Err(ComputeError::InvalidArgument(
                "global and local sizes must be non-zero".to_string(),
            ));
        }
        let mut kernels = self.kernels.lock();
        let entry = kernels
            .get_mut(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;

        let device = &self.context.device;
        ensure_pipeline(device, entry, kernel_name, local)?;
        let Some(compiled) = entry.pipeline.as_ref() else {
            return Err(ComputeError::Execute {
                kernel: kernel_name.to_string(),
                reason: "pipeline missing after compilation".to_string(),
            });
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = compiled.pipeline.get_bind_group_layout(0);
        let mut bindings = Vec::with_capacity(entry.args.len());
        for (&index, arg) in &entry.args {
            let resource = match arg {
                ArgBinding::Buffer(name) => {
                    let record =
                        entry
                            .buffers
                            .get(name)
                            .ok_or_else(|| ComputeError::BufferNotFound {
                                kernel: kernel_name.to_string(),
                                buffer: name.clone(),
                            })?;
                    record.buffer.as_entire_binding()
                }
                ArgBinding::Value { buffer, .. } => buffer.as_entire_binding(),
            };
            bindings.push(wgpu::BindGroupEntry {
                binding: index,
                resource,
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel_name),
            layout: &layout,
            entries: &bindings,
        });

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel_name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                global[0].div_ceil(local[0]),
                global[1].div_ceil(local[1]),
                1,
            );
        }
        self.context.queue.submit(Some(encoder.finish()));

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ComputeError::Execute {
                kernel: kernel_name.to_string(),
                reason: error.to_string(),
            });
        }
        if blocking {
            let _ = device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    /// Device-to-host blocking copy. The shorter of the buffer size and
    /// `out.len()` is transferred, with a warning when they differ.
    pub fn read_buffer(
        &self,
        kernel_name: &str,
        buffer_name: &str,
        out: &mut [u8],
    ) -> Result<(), ComputeError> {
        let kernels = self.kernels.lock();
        let entry = kernels
            .get(kernel_name)
            .ok_or_else(|| ComputeError::KernelNotFound(kernel_name.to_string()))?;
        let record = entry
            .buffers
            .get(buffer_name)
            .ok_or_else(|| ComputeError::BufferNotFound {
                kernel: kernel_name.to_string(),
                buffer: buffer_name.to_string(),
            })?;

        let copy_len = (record.size as usize).min(out.len());
        if record.size as usize != out.len() {
            tracing::warn!(
                "reading {} bytes from buffer \"{}\" of {} bytes",
                copy_len,
                buffer_name,
                record.size
            );
        }
        if copy_len == 0 {
            return Ok(());
        }

        let device = &self.context.device;
        let padded = aligned_size(copy_len as u64);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stipple_readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&record.buffer, 0, &staging, 0, padded);
        self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| ComputeError::Execute {
                kernel: kernel_name.to_string(),
                reason: "readback callback dropped".to_string(),
            })?
            .map_err(|e| ComputeError::Execute {
                kernel: kernel_name.to_string(),
                reason: format!("readback mapping failed: {e:?}"),
            })?;

        let data = slice.get_mapped_range();
        out[..copy_len].copy_from_slice(&data[..copy_len]);
        drop(data);
        staging.unmap();
        Ok(())
    }

    /// Returns true if a kernel with the given name exists.
    pub fn has_kernel(&self, kernel_name: &str) -> bool {
        self.kernels.lock().contains_key(kernel_name)
    }

    /// Returns true if the kernel exists and owns a buffer with the name.
    pub fn has_buffer(&self, kernel_name: &str, buffer_name: &str) -> bool {
        self.kernels
            .lock()
            .get(kernel_name)
            .is_some_and(|entry| entry.buffers.contains_key(buffer_name))
    }

    /// Logical size in bytes of a named buffer, if it exists.
    pub fn buffer_size(&self, kernel_name: &str, buffer_name: &str) -> Option<usize> {
        self.kernels
            .lock()
            .get(kernel_name)
            .and_then(|entry| entry.buffers.get(buffer_name))
            .map(|record| record.size as usize)
    }

    /// Preferred work-group size for 2-D tile selection. The device's
    /// invocations-per-workgroup limit is the closest wgpu analog to a
    /// per-kernel preferred size query.
    pub fn work_group_size(&self, kernel_name: &str) -> Result<u32, ComputeError> {
        if !self.has_kernel(kernel_name) {
            return Err(ComputeError::KernelNotFound(kernel_name.to_string()));
        }
        Ok(self
            .context
            .device
            .limits()
            .max_compute_invocations_per_workgroup)
    }

    /// Releases a single buffer. Returns false when nothing was removed;
    /// repeated cleanup is a no-op, not an error.
    pub fn cleanup_buffer(&self, kernel_name: &str, buffer_name: &str) -> bool {
        let mut kernels = self.kernels.lock();
        let Some(entry) = kernels.get_mut(kernel_name) else {
            return false;
        };
        let removed = entry.buffers.remove(buffer_name).is_some();
        if removed {
            // Drop any argument binding that referenced the buffer.
            entry.args.retain(|_, arg| match arg {
                ArgBinding::Buffer(name) => name != buffer_name,
                ArgBinding::Value { .. } => true,
            });
        }
        removed
    }

    /// Releases a kernel together with all of its buffers. Returns false
    /// when no such kernel exists.
    pub fn cleanup_kernel(&self, kernel_name: &str) -> bool {
        self.kernels.lock().remove(kernel_name).is_some()
    }

    /// Releases every kernel and buffer owned by this handle.
    pub fn cleanup_all(&self) {
        self.kernels.lock().clear();
    }
}

/// Compiles (or reuses) the pipeline for the requested local size. Shaders
/// expose the local size through the `tile_w`/`tile_h` pipeline overrides.
fn ensure_pipeline(
    device: &wgpu::Device,
    entry: &mut KernelEntry,
    kernel_name: &str,
    local: [u32; 2],
) -> Result<(), ComputeError> {
    if entry
        .pipeline
        .as_ref()
        .is_some_and(|compiled| compiled.local == local)
    {
        return Ok(());
    }

    let constants = HashMap::from([
        ("tile_w".to_string(), f64::from(local[0])),
        ("tile_h".to_string(), f64::from(local[1])),
    ]);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kernel_name),
        layout: None,
        module: &entry.module,
        entry_point: Some(&entry.entry_point),
        compilation_options: wgpu::PipelineCompilationOptions {
            constants: &constants,
            ..Default::default()
        },
        cache: None,
    });
    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(ComputeError::Execute {
            kernel: kernel_name.to_string(),
            reason: format!("local size {:?} rejected: {error}", local),
        });
    }
    entry.pipeline = Some(CompiledPipeline { pipeline, local });
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
