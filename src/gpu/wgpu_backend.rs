//! wgpu device: storage buffers, RGBA32F storage textures and the two compute pipelines.
//!
//! ## Usage
//! ```ignore
//! let mut backend = WgpuBackend::new(device.clone(), queue.clone());
//! let mut tracer = RenderLoop::new(backend, &settings);
//! tracer.run_frame(&input);
//! let view = tracer.backend().display_view(); // rgba8unorm, register with egui
//! ```

use std::collections::HashMap;

use trace_kernel::{bindings, BlendUniforms, KernelUniforms, BLEND_SHADER_SOURCE, TRACE_KERNEL_SOURCE};

use super::backend::{BoundBuffer, BufferId, DispatchJob, GpuBackend, ImageId};
use super::headless::SkyModel;
use crate::util::{Error, Result};

/// Size of the stand-in bound to unused storage slots.
const PLACEHOLDER_BYTES: u64 = 256;
const DEFAULT_SKY_SIZE: (u32, u32) = (128, 64);

struct GpuBuffer {
    buffer: wgpu::Buffer,
    byte_len: u64,
    label: String,
}

struct GpuImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct DisplayTarget {
    view: wgpu::TextureView,
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

/// [`GpuBackend`] on a wgpu device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,

    trace_pipeline: wgpu::ComputePipeline,
    trace_layout: wgpu::BindGroupLayout,
    blend_pipeline: wgpu::ComputePipeline,
    blend_layout: wgpu::BindGroupLayout,

    uniform_buffer: wgpu::Buffer,
    blend_uniform_buffer: wgpu::Buffer,
    placeholder: wgpu::Buffer,
    skybox: GpuImage,

    buffers: HashMap<u64, GpuBuffer>,
    images: HashMap<u64, GpuImage>,
    next_id: u64,

    display: Option<DisplayTarget>,
    /// Bumped whenever the display texture is recreated.
    display_generation: u64,
    presented: Option<ImageId>,
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn sampled_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}

fn storage_texture_entry(
    binding: u32,
    access: wgpu::StorageTextureAccess,
    format: wgpu::TextureFormat,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

impl WgpuBackend {
    /// Build both pipelines and the default gradient sky.
    ///
    /// The device needs `TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES` for the
    /// read-write RGBA32F converged image.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let trace_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("trace_bind_group_layout"),
            entries: &[
                storage_texture_entry(
                    bindings::RESULT_BINDING,
                    wgpu::StorageTextureAccess::WriteOnly,
                    wgpu::TextureFormat::Rgba32Float,
                ),
                sampled_entry(bindings::SKYBOX_BINDING),
                storage_entry(bindings::SPHERES_BINDING),
                storage_entry(bindings::MESH_OBJECTS_BINDING),
                storage_entry(bindings::VERTICES_BINDING),
                storage_entry(bindings::INDICES_BINDING),
                uniform_entry(bindings::UNIFORMS_BINDING),
            ],
        });
        let trace_pipeline = compute_pipeline(&device, "trace_kernel", TRACE_KERNEL_SOURCE, &trace_layout);

        let blend_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blend_bind_group_layout"),
            entries: &[
                sampled_entry(0),
                storage_texture_entry(1, wgpu::StorageTextureAccess::ReadWrite, wgpu::TextureFormat::Rgba32Float),
                storage_texture_entry(2, wgpu::StorageTextureAccess::WriteOnly, wgpu::TextureFormat::Rgba8Unorm),
                uniform_entry(3),
            ],
        });
        let blend_pipeline = compute_pipeline(&device, "accumulate_blend", BLEND_SHADER_SOURCE, &blend_layout);

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace_uniforms"),
            size: std::mem::size_of::<KernelUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let blend_uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("blend_uniforms"),
            size: std::mem::size_of::<BlendUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        // wgpu needs something bound in every slot; counts tell the kernel to ignore it.
        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("unbound_placeholder"),
            size: PLACEHOLDER_BYTES,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let skybox = Self::create_skybox(&device, DEFAULT_SKY_SIZE.0, DEFAULT_SKY_SIZE.1);
        let mut backend = Self {
            device,
            queue,
            trace_pipeline,
            trace_layout,
            blend_pipeline,
            blend_layout,
            uniform_buffer,
            blend_uniform_buffer,
            placeholder,
            skybox,
            buffers: HashMap::new(),
            images: HashMap::new(),
            next_id: 1,
            display: None,
            display_generation: 0,
            presented: None,
        };
        backend.upload_default_sky();
        backend
    }

    fn create_skybox(device: &wgpu::Device, width: u32, height: u32) -> GpuImage {
        let (texture, view) = create_texture(
            device,
            bindings::SKYBOX_TEXTURE,
            width,
            height,
            wgpu::TextureFormat::Rgba32Float,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        GpuImage {
            texture,
            view,
            width,
            height,
        }
    }

    /// Bake the procedural gradient into the equirect sky.
    fn upload_default_sky(&mut self) {
        let (width, height) = DEFAULT_SKY_SIZE;
        let sky = SkyModel::default();
        let texels: Vec<[f32; 4]> = (0..height)
            .flat_map(|y| {
                let theta = (y as f32 + 0.5) / height as f32 * std::f32::consts::PI;
                (0..width).map(move |_| {
                    let c = sky.sample(glam::Vec3::new(0.0, theta.cos(), 0.0));
                    [c.x, c.y, c.z, 1.0]
                })
            })
            .collect();
        self.write_skybox_texels(&texels);
    }

    fn write_skybox_texels(&self, texels: &[[f32; 4]]) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.skybox.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.skybox.width * 16),
                rows_per_image: Some(self.skybox.height),
            },
            wgpu::Extent3d {
                width: self.skybox.width,
                height: self.skybox.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Replace the equirectangular environment (`_SkyboxTexture`).
    pub fn set_skybox(&mut self, width: u32, height: u32, texels: &[[f32; 4]]) -> Result<()> {
        if texels.len() != width as usize * height as usize || width == 0 || height == 0 {
            return Err(Error::other(format!(
                "skybox {width}x{height} needs {} texels, got {}",
                width as usize * height as usize,
                texels.len()
            )));
        }
        self.check_texture_size(bindings::SKYBOX_TEXTURE, width, height)?;
        self.skybox = Self::create_skybox(&self.device, width, height);
        self.write_skybox_texels(texels);
        tracing::info!(width, height, "skybox replaced");
        Ok(())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// RGBA8 tonemapped copy of the last blended image, if any frame was blended.
    pub fn display_view(&self) -> Option<&wgpu::TextureView> {
        self.display.as_ref().map(|d| &d.view)
    }

    pub fn display_texture(&self) -> Option<&wgpu::Texture> {
        self.display.as_ref().map(|d| &d.texture)
    }

    pub fn display_size(&self) -> Option<(u32, u32)> {
        self.display.as_ref().map(|d| (d.width, d.height))
    }

    /// Changes whenever `display_view` points at a new texture.
    pub fn display_generation(&self) -> u64 {
        self.display_generation
    }

    pub fn presented(&self) -> Option<ImageId> {
        self.presented
    }

    fn issue_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_texture_size(&self, label: &str, width: u32, height: u32) -> Result<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(Error::exhausted(label, width as u64 * height as u64 * 16));
        }
        Ok(())
    }

    /// Run `f` inside an out-of-memory error scope.
    fn oom_scope<T>(&self, label: &str, bytes: u64, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => {
                tracing::warn!(label, bytes, %err, "GPU allocation failed");
                Err(Error::exhausted(label, bytes))
            }
            None => Ok(value),
        }
    }

    /// Run `f` inside a validation error scope, mapping failures to `Dispatch`.
    fn validation_scope(&self, f: impl FnOnce(&Self)) -> Result<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        f(self);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(Error::Dispatch(err.to_string())),
            None => Ok(()),
        }
    }

    fn image(&self, id: ImageId) -> Result<&GpuImage> {
        self.images.get(&id.0).ok_or(Error::UnknownResource {
            kind: "image",
            id: id.0,
        })
    }

    fn storage_binding(&self, binding: Option<BoundBuffer>) -> Result<wgpu::BindingResource<'_>> {
        match binding {
            Some(bound) => {
                let buffer = self.buffers.get(&bound.id.0).ok_or(Error::UnknownResource {
                    kind: "buffer",
                    id: bound.id.0,
                })?;
                Ok(buffer.buffer.as_entire_binding())
            }
            None => Ok(self.placeholder.as_entire_binding()),
        }
    }

    fn ensure_display(&mut self, width: u32, height: u32) -> Result<()> {
        if self.display.as_ref().is_some_and(|d| (d.width, d.height) == (width, height)) {
            return Ok(());
        }
        let (texture, view) = self.oom_scope("display", width as u64 * height as u64 * 4, |device| {
            create_texture(
                device,
                "display",
                width,
                height,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            )
        })?;
        self.display = Some(DisplayTarget {
            view,
            texture,
            width,
            height,
        });
        self.display_generation += 1;
        Ok(())
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, label: &str, count: usize, stride: usize) -> Result<BufferId> {
        let bytes = (count * stride) as u64;
        if bytes == 0 || stride % 4 != 0 {
            return Err(Error::other(format!("{label}: cannot allocate {count} x {stride} bytes")));
        }
        let limits = self.device.limits();
        let max = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
        if bytes > max {
            tracing::warn!(label, bytes, max, "buffer exceeds device limits");
            return Err(Error::exhausted(label, bytes));
        }

        let buffer = self.oom_scope(label, bytes, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        let id = self.issue_id();
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                byte_len: bytes,
                label: label.to_string(),
            },
        );
        tracing::debug!(label, count, stride, id, "storage buffer allocated");
        Ok(BufferId(id))
    }

    fn write_buffer(&mut self, id: BufferId, bytes: &[u8]) -> Result<()> {
        let buffer = self.buffers.get(&id.0).ok_or(Error::UnknownResource {
            kind: "buffer",
            id: id.0,
        })?;
        if bytes.len() as u64 != buffer.byte_len {
            return Err(Error::StrideMismatch {
                slot: buffer.label.clone(),
                expected: buffer.byte_len,
                actual: bytes.len() as u64,
            });
        }
        self.queue.write_buffer(&buffer.buffer, 0, bytes);
        Ok(())
    }

    fn release_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id.0) {
            buffer.buffer.destroy();
        }
    }

    fn create_image(&mut self, label: &str, width: u32, height: u32) -> Result<ImageId> {
        self.check_texture_size(label, width, height)?;
        let (texture, view) = self.oom_scope(label, width as u64 * height as u64 * 16, |device| {
            create_texture(
                device,
                label,
                width,
                height,
                wgpu::TextureFormat::Rgba32Float,
                wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            )
        })?;
        let id = self.issue_id();
        self.images.insert(
            id,
            GpuImage {
                texture,
                view,
                width,
                height,
            },
        );
        Ok(ImageId(id))
    }

    fn release_image(&mut self, id: ImageId) {
        if let Some(image) = self.images.remove(&id.0) {
            image.texture.destroy();
        }
        if self.presented == Some(id) {
            self.presented = None;
        }
    }

    fn dispatch(&mut self, job: &DispatchJob<'_>) -> Result<()> {
        let output = self.image(job.output)?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("trace_bind_group"),
            layout: &self.trace_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: bindings::RESULT_BINDING,
                    resource: wgpu::BindingResource::TextureView(&output.view),
                },
                wgpu::BindGroupEntry {
                    binding: bindings::SKYBOX_BINDING,
                    resource: wgpu::BindingResource::TextureView(&self.skybox.view),
                },
                wgpu::BindGroupEntry {
                    binding: bindings::SPHERES_BINDING,
                    resource: self.storage_binding(job.bindings.spheres)?,
                },
                wgpu::BindGroupEntry {
                    binding: bindings::MESH_OBJECTS_BINDING,
                    resource: self.storage_binding(job.bindings.mesh_objects)?,
                },
                wgpu::BindGroupEntry {
                    binding: bindings::VERTICES_BINDING,
                    resource: self.storage_binding(job.bindings.vertices)?,
                },
                wgpu::BindGroupEntry {
                    binding: bindings::INDICES_BINDING,
                    resource: self.storage_binding(job.bindings.indices)?,
                },
                wgpu::BindGroupEntry {
                    binding: bindings::UNIFORMS_BINDING,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        self.validation_scope(|this| {
            this.queue.write_buffer(&this.uniform_buffer, 0, bytemuck::bytes_of(job.uniforms));
            let mut encoder = this.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("trace_encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("trace_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&this.trace_pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                let [x, y, z] = job.groups;
                pass.dispatch_workgroups(x, y, z);
            }
            this.queue.submit(Some(encoder.finish()));
        })
    }

    fn blend(&mut self, raw: ImageId, converged: ImageId, sample_count: u64) -> Result<()> {
        let (width, height) = {
            let target = self.image(converged)?;
            (target.width, target.height)
        };
        self.ensure_display(width, height)?;

        let raw_image = self.image(raw)?;
        let converged_image = self.image(converged)?;
        let Some(display) = self.display.as_ref() else {
            return Err(Error::TargetsNotReady);
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blend_bind_group"),
            layout: &self.blend_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&raw_image.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&converged_image.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&display.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.blend_uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let uniforms = BlendUniforms::new(sample_count);
        self.validation_scope(|this| {
            this.queue.write_buffer(&this.blend_uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
            let mut encoder = this.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("blend_encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("blend_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&this.blend_pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                let [x, y, z] = trace_kernel::dispatch_groups(width, height);
                pass.dispatch_workgroups(x, y, z);
            }
            this.queue.submit(Some(encoder.finish()));
        })
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        self.image(image)?;
        self.presented = Some(image);
        Ok(())
    }
}
