//! wgpu compute backend
//!
//! Single GPU code path for every runtime wgpu reaches (Vulkan, Metal, DX12,
//! GL). All device calls are synchronous submit-and-wait: upload, transform,
//! kernel launch, and download each complete before returning, trading peak
//! throughput for deterministic per-frame fallback. Every device-facing
//! operation runs inside wgpu error scopes so a failed call surfaces as a
//! `ComputeError::Device` the caller can recover from.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::backend::{
    ComputeBackend, ComputeKernel, DeviceBuffer, DeviceInfo, FftPlan, validate_fft_len,
};
use crate::error::{ComputeError, ComputeResult};

const WORKGROUP_SIZE: u32 = 256;

/// Shared device/queue pair, kept alive by every object created from it
pub(crate) struct WgpuShared {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuShared {
    fn push_scopes(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    }

    /// Wait for submitted work, then resolve the error scopes pushed by
    /// [`push_scopes`].
    ///
    /// [`push_scopes`]: WgpuShared::push_scopes
    fn pop_scopes(&self, what: &str) -> ComputeResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        let oom = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = oom.or(validation) {
            return Err(ComputeError::Device(format!("{what}: {err}")));
        }
        Ok(())
    }
}

/// GPU compute backend on wgpu
pub struct WgpuBackend {
    shared: Arc<WgpuShared>,
    info: DeviceInfo,
}

impl WgpuBackend {
    /// Acquire the highest-performance adapter, blocking
    pub fn acquire() -> ComputeResult<Self> {
        pollster::block_on(Self::acquire_async())
    }

    async fn acquire_async() -> ComputeResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| ComputeError::Unavailable("no suitable GPU adapter found".into()))?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        log::info!(
            "wgpu backend: using {} ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ClearForge Compute"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ComputeError::Unavailable(e.to_string()))?;

        // wgpu reports no memory totals; the single-allocation ceiling is the
        // closest available figure.
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            vendor: vendor_name(adapter_info.vendor),
            backend: format!("wgpu/{}", format!("{:?}", adapter_info.backend).to_lowercase()),
            total_memory: limits.max_buffer_size,
            available_memory: limits.max_buffer_size,
            compute_units: 0,
            max_workgroup_size: limits.max_compute_invocations_per_workgroup,
        };

        Ok(Self {
            shared: Arc::new(WgpuShared {
                device: Arc::new(device),
                queue: Arc::new(queue),
            }),
            info,
        })
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn create_buffer(&self) -> Box<dyn DeviceBuffer> {
        Box::new(WgpuBuffer {
            shared: Arc::clone(&self.shared),
            storage: None,
            staging: None,
            size: 0,
        })
    }

    fn create_fft_plan(&self, fft_len: usize, batch: usize) -> ComputeResult<Box<dyn FftPlan>> {
        validate_fft_len(fft_len, batch)?;
        Ok(Box::new(WgpuFftPlan::new(
            Arc::clone(&self.shared),
            fft_len,
            batch,
        )?))
    }

    fn create_kernel(
        &self,
        source: &str,
        entry_point: &str,
    ) -> ComputeResult<Box<dyn ComputeKernel>> {
        self.shared.push_scopes();

        let module = self
            .shared
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Compute Kernel"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let pipeline = self
            .shared
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Compute Kernel Pipeline"),
                layout: None,
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        if let Err(err) = self.shared.pop_scopes("kernel compilation") {
            let detail = match err {
                ComputeError::Device(msg) => msg,
                other => other.to_string(),
            };
            return Err(ComputeError::Compilation(format!(
                "entry point '{entry_point}': {detail}"
            )));
        }

        Ok(Box::new(WgpuKernel {
            shared: Arc::clone(&self.shared),
            pipeline: Some(pipeline),
            args: BTreeMap::new(),
        }))
    }

    fn synchronize(&self) -> ComputeResult<()> {
        self.shared.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn shutdown(&mut self) {
        // Device and queue are refcounted; buffers and plans still alive keep
        // them valid until dropped.
        log::info!("wgpu backend: shutdown ({})", self.info.name);
    }
}

fn vendor_name(pci_id: u32) -> String {
    match pci_id {
        0x1002 => "AMD".into(),
        0x10DE => "NVIDIA".into(),
        0x8086 => "Intel".into(),
        0x106B => "Apple".into(),
        0x13B5 => "ARM".into(),
        0x5143 => "Qualcomm".into(),
        other => format!("0x{other:04X}"),
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// Device storage buffer plus a mappable staging twin for downloads
pub(crate) struct WgpuBuffer {
    shared: Arc<WgpuShared>,
    storage: Option<Arc<wgpu::Buffer>>,
    staging: Option<wgpu::Buffer>,
    /// Logical size honored by the transfer contract; physical allocations
    /// are padded to wgpu's 8-byte map alignment.
    size: usize,
}

impl WgpuBuffer {
    pub(crate) fn storage(&self) -> ComputeResult<&Arc<wgpu::Buffer>> {
        self.storage
            .as_ref()
            .ok_or_else(|| ComputeError::InvalidConfig("buffer is not allocated".into()))
    }
}

fn padded_len(len: usize) -> u64 {
    len.next_multiple_of(8) as u64
}

impl DeviceBuffer for WgpuBuffer {
    fn allocate(&mut self, size_bytes: usize) -> ComputeResult<()> {
        self.release();
        if size_bytes == 0 {
            return Err(ComputeError::InvalidConfig(
                "cannot allocate a zero-size buffer".into(),
            ));
        }

        self.shared.push_scopes();
        let storage = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Device Buffer"),
            size: padded_len(size_bytes),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: padded_len(size_bytes),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.shared.pop_scopes("buffer allocation")?;

        self.storage = Some(Arc::new(storage));
        self.staging = Some(staging);
        self.size = size_bytes;
        Ok(())
    }

    fn upload(&mut self, data: &[u8]) -> ComputeResult<()> {
        let storage = Arc::clone(self.storage()?);
        if data.len() > self.size {
            return Err(ComputeError::InvalidConfig(format!(
                "upload of {} bytes exceeds allocated size {}",
                data.len(),
                self.size
            )));
        }

        self.shared.push_scopes();
        if data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            self.shared.queue.write_buffer(&storage, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.shared.queue.write_buffer(&storage, 0, &padded);
        }
        self.shared.queue.submit(std::iter::empty());
        self.shared.pop_scopes("buffer upload")
    }

    fn download(&self, data: &mut [u8]) -> ComputeResult<()> {
        let storage = self.storage()?;
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| ComputeError::InvalidConfig("buffer is not allocated".into()))?;
        if data.len() > self.size {
            return Err(ComputeError::InvalidConfig(format!(
                "download of {} bytes exceeds allocated size {}",
                data.len(),
                self.size
            )));
        }
        let copy_len = padded_len(data.len());

        self.shared.push_scopes();
        let mut encoder =
            self.shared
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Download Encoder"),
                });
        encoder.copy_buffer_to_buffer(storage, 0, staging, 0, copy_len);
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        self.shared.pop_scopes("buffer download")?;

        let slice = staging.slice(0..copy_len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.shared.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ComputeError::Device(format!("buffer map failed: {err}"))),
            Err(_) => return Err(ComputeError::Device("buffer map callback lost".into())),
        }

        let mapped = slice.get_mapped_range();
        data.copy_from_slice(&mapped[..data.len()]);
        drop(mapped);
        staging.unmap();
        Ok(())
    }

    fn size_bytes(&self) -> usize {
        self.size
    }

    fn release(&mut self) {
        self.storage = None;
        self.staging = None;
        self.size = 0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn as_wgpu_buffer<'a>(buffer: &'a dyn DeviceBuffer) -> ComputeResult<&'a WgpuBuffer> {
    buffer
        .as_any()
        .downcast_ref::<WgpuBuffer>()
        .ok_or_else(|| {
            ComputeError::InvalidConfig("buffer does not belong to the wgpu backend".into())
        })
}

// ============================================================================
// FFT plan
// ============================================================================

/// Per-pass parameters (uniform buffer, one per recorded pass)
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FftPassParams {
    n: u32,
    log2_n: u32,
    stage: u32,
    inverse: u32,
    batch: u32,
    total: u32,
    _pad0: u32,
    _pad1: u32,
}

#[derive(Clone, Copy)]
enum FftPassKind {
    LoadReal,
    Butterfly,
    StoreHalf,
    ExpandHalf,
    StoreReal,
}

struct FftPass {
    kind: FftPassKind,
    params: wgpu::Buffer,
    total: u32,
}

struct FftPipelines {
    load_real: wgpu::ComputePipeline,
    butterfly: wgpu::ComputePipeline,
    store_half: wgpu::ComputePipeline,
    expand_half: wgpu::ComputePipeline,
    store_real: wgpu::ComputePipeline,
}

impl FftPipelines {
    fn get(&self, kind: FftPassKind) -> &wgpu::ComputePipeline {
        match kind {
            FftPassKind::LoadReal => &self.load_real,
            FftPassKind::Butterfly => &self.butterfly,
            FftPassKind::StoreHalf => &self.store_half,
            FftPassKind::ExpandHalf => &self.expand_half,
            FftPassKind::StoreReal => &self.store_real,
        }
    }
}

/// Bind groups are rebuilt only when the caller hands in different buffers;
/// the streaming consumer reuses one buffer pair so this hits every frame.
struct FftBindCache {
    src_id: usize,
    dst_id: usize,
    groups: Vec<wgpu::BindGroup>,
}

struct FftPlanInner {
    pipelines: FftPipelines,
    layout: wgpu::BindGroupLayout,
    work: wgpu::Buffer,
    forward_passes: Vec<FftPass>,
    inverse_passes: Vec<FftPass>,
    forward_cache: Option<FftBindCache>,
    inverse_cache: Option<FftBindCache>,
}

/// Batched radix-2 real FFT executed as one compute pass per butterfly stage.
///
/// Everything that allocates (pipelines, work buffer, per-stage uniform
/// buffers) happens at plan creation; per-frame execution only records
/// passes against prebuilt state.
pub(crate) struct WgpuFftPlan {
    shared: Arc<WgpuShared>,
    fft_len: usize,
    batch: usize,
    inner: Option<FftPlanInner>,
}

impl WgpuFftPlan {
    fn new(shared: Arc<WgpuShared>, fft_len: usize, batch: usize) -> ComputeResult<Self> {
        let log2_n = fft_len.trailing_zeros();
        let bins = fft_len / 2 + 1;

        shared.push_scopes();

        let module = shared
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("FFT Shader"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/fft.wgsl").into()),
            });

        let layout = shared
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("FFT Bind Group Layout"),
                entries: &[
                    storage_entry(0, true),
                    storage_entry(1, false),
                    storage_entry(2, false),
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let pipeline_layout = shared
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("FFT Pipeline Layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let make_pipeline = |entry: &str| {
            shared
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("FFT Pipeline"),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    cache: None,
                })
        };

        let pipelines = FftPipelines {
            load_real: make_pipeline("load_real"),
            butterfly: make_pipeline("butterfly"),
            store_half: make_pipeline("store_half"),
            expand_half: make_pipeline("expand_half"),
            store_real: make_pipeline("store_real"),
        };

        // One complex value per sample per batch row
        let work = shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("FFT Work Buffer"),
            size: (batch * fft_len * 8) as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let make_pass = |kind: FftPassKind, stage: u32, inverse: u32, total: u32| {
            let params = FftPassParams {
                n: fft_len as u32,
                log2_n,
                stage,
                inverse,
                batch: batch as u32,
                total,
                _pad0: 0,
                _pad1: 0,
            };
            let buffer = shared.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("FFT Pass Params"),
                size: std::mem::size_of::<FftPassParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            shared.queue.write_buffer(&buffer, 0, bytemuck::bytes_of(&params));
            FftPass {
                kind,
                params: buffer,
                total,
            }
        };

        let half_total = (batch * fft_len / 2) as u32;
        let full_total = (batch * fft_len) as u32;

        let mut forward_passes =
            vec![make_pass(FftPassKind::LoadReal, 0, 0, full_total)];
        for stage in 1..=log2_n {
            forward_passes.push(make_pass(FftPassKind::Butterfly, stage, 0, half_total));
        }
        forward_passes.push(make_pass(
            FftPassKind::StoreHalf,
            0,
            0,
            (batch * bins) as u32,
        ));

        let mut inverse_passes =
            vec![make_pass(FftPassKind::ExpandHalf, 0, 1, full_total)];
        for stage in 1..=log2_n {
            inverse_passes.push(make_pass(FftPassKind::Butterfly, stage, 1, half_total));
        }
        inverse_passes.push(make_pass(FftPassKind::StoreReal, 0, 1, full_total));

        shared.queue.submit(std::iter::empty());
        shared.pop_scopes("fft plan creation")?;

        Ok(Self {
            shared,
            fft_len,
            batch,
            inner: Some(FftPlanInner {
                pipelines,
                layout,
                work,
                forward_passes,
                inverse_passes,
                forward_cache: None,
                inverse_cache: None,
            }),
        })
    }

    fn run(
        &mut self,
        input: &dyn DeviceBuffer,
        output: &dyn DeviceBuffer,
        forward: bool,
    ) -> ComputeResult<()> {
        let real_bytes = self.batch * self.fft_len * 4;
        let complex_bytes = self.batch * (self.fft_len / 2 + 1) * 8;
        let (need_in, need_out) = if forward {
            (real_bytes, complex_bytes)
        } else {
            (complex_bytes, real_bytes)
        };

        let src = as_wgpu_buffer(input)?;
        let dst = as_wgpu_buffer(output)?;
        if src.size_bytes() < need_in || dst.size_bytes() < need_out {
            return Err(ComputeError::InvalidConfig(format!(
                "fft buffers too small: need {need_in}/{need_out} bytes, got {}/{}",
                src.size_bytes(),
                dst.size_bytes()
            )));
        }
        let src_storage = Arc::clone(src.storage()?);
        let dst_storage = Arc::clone(dst.storage()?);

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| ComputeError::InvalidConfig("fft plan has been released".into()))?;

        let src_id = Arc::as_ptr(&src_storage) as usize;
        let dst_id = Arc::as_ptr(&dst_storage) as usize;
        let (passes, cache) = if forward {
            (&inner.forward_passes, &mut inner.forward_cache)
        } else {
            (&inner.inverse_passes, &mut inner.inverse_cache)
        };

        let stale = match cache {
            Some(c) => c.src_id != src_id || c.dst_id != dst_id,
            None => true,
        };
        if stale {
            let groups: Vec<wgpu::BindGroup> = passes
                .iter()
                .map(|pass| {
                    self.shared
                        .device
                        .create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some("FFT Bind Group"),
                            layout: &inner.layout,
                            entries: &[
                                wgpu::BindGroupEntry {
                                    binding: 0,
                                    resource: src_storage.as_entire_binding(),
                                },
                                wgpu::BindGroupEntry {
                                    binding: 1,
                                    resource: dst_storage.as_entire_binding(),
                                },
                                wgpu::BindGroupEntry {
                                    binding: 2,
                                    resource: inner.work.as_entire_binding(),
                                },
                                wgpu::BindGroupEntry {
                                    binding: 3,
                                    resource: pass.params.as_entire_binding(),
                                },
                            ],
                        })
                })
                .collect();
            *cache = Some(FftBindCache {
                src_id,
                dst_id,
                groups,
            });
        }
        let groups = match cache {
            Some(c) => &c.groups,
            None => return Err(ComputeError::Device("fft bind cache missing".into())),
        };

        self.shared.push_scopes();
        let mut encoder =
            self.shared
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("FFT Encoder"),
                });
        for (pass, group) in passes.iter().zip(groups) {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("FFT Pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(inner.pipelines.get(pass.kind));
            cpass.set_bind_group(0, group, &[]);
            cpass.dispatch_workgroups(pass.total.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        self.shared
            .pop_scopes(if forward { "fft forward" } else { "fft inverse" })
    }
}

impl FftPlan for WgpuFftPlan {
    fn fft_len(&self) -> usize {
        self.fft_len
    }

    fn batch(&self) -> usize {
        self.batch
    }

    fn execute_forward(
        &mut self,
        input: &dyn DeviceBuffer,
        output: &dyn DeviceBuffer,
    ) -> ComputeResult<()> {
        self.run(input, output, true)
    }

    fn execute_inverse(
        &mut self,
        input: &dyn DeviceBuffer,
        output: &dyn DeviceBuffer,
    ) -> ComputeResult<()> {
        self.run(input, output, false)
    }

    fn release(&mut self) {
        self.inner = None;
    }
}

// ============================================================================
// Kernels
// ============================================================================

enum KernelArg {
    Buffer(Arc<wgpu::Buffer>),
    Scalar {
        buffer: wgpu::Buffer,
        bytes: [u8; 4],
        dirty: bool,
    },
}

/// Compiled compute pipeline with positional argument binding.
///
/// Argument index N binds at `@group(0) @binding(N)` of the entry point.
/// Scalar binds only record the value; the uniform write and the bind group
/// are deferred to `execute`, keeping bind and launch strictly separate for
/// buffers and scalars alike.
pub(crate) struct WgpuKernel {
    shared: Arc<WgpuShared>,
    pipeline: Option<wgpu::ComputePipeline>,
    args: BTreeMap<u32, KernelArg>,
}

impl WgpuKernel {
    fn set_scalar(&mut self, index: u32, bytes: [u8; 4]) -> ComputeResult<()> {
        match self.args.get_mut(&index) {
            Some(KernelArg::Scalar {
                bytes: stored,
                dirty,
                ..
            }) => {
                *stored = bytes;
                *dirty = true;
            }
            _ => {
                // First bind at this index allocates the uniform; later binds
                // in the per-block path only mark it dirty.
                let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Kernel Scalar Arg"),
                    size: 16,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                self.args.insert(
                    index,
                    KernelArg::Scalar {
                        buffer,
                        bytes,
                        dirty: true,
                    },
                );
            }
        }
        Ok(())
    }
}

impl ComputeKernel for WgpuKernel {
    fn set_buffer_arg(&mut self, index: u32, buffer: &dyn DeviceBuffer) -> ComputeResult<()> {
        let storage = Arc::clone(as_wgpu_buffer(buffer)?.storage()?);
        self.args.insert(index, KernelArg::Buffer(storage));
        Ok(())
    }

    fn set_f32_arg(&mut self, index: u32, value: f32) -> ComputeResult<()> {
        self.set_scalar(index, value.to_ne_bytes())
    }

    fn set_u32_arg(&mut self, index: u32, value: u32) -> ComputeResult<()> {
        self.set_scalar(index, value.to_ne_bytes())
    }

    fn execute(&mut self, total_work_items: u32, work_items_per_group: u32) -> ComputeResult<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| ComputeError::InvalidConfig("kernel has been released".into()))?;
        if total_work_items == 0 || work_items_per_group == 0 {
            return Err(ComputeError::InvalidConfig(
                "work sizes must be non-zero".into(),
            ));
        }

        self.shared.push_scopes();

        for arg in self.args.values_mut() {
            if let KernelArg::Scalar {
                buffer,
                bytes,
                dirty,
            } = arg
            {
                if *dirty {
                    self.shared.queue.write_buffer(buffer, 0, bytes);
                    *dirty = false;
                }
            }
        }

        let entries: Vec<wgpu::BindGroupEntry> = self
            .args
            .iter()
            .map(|(&index, arg)| wgpu::BindGroupEntry {
                binding: index,
                resource: match arg {
                    KernelArg::Buffer(buffer) => buffer.as_entire_binding(),
                    KernelArg::Scalar { buffer, .. } => buffer.as_entire_binding(),
                },
            })
            .collect();

        let bind_group = self
            .shared
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Kernel Bind Group"),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });

        let mut encoder =
            self.shared
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Kernel Encoder"),
                });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Kernel Pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(total_work_items.div_ceil(work_items_per_group), 1, 1);
        }
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        self.shared.pop_scopes("kernel execution")
    }

    fn release(&mut self) {
        self.pipeline = None;
        self.args.clear();
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
