//! `GraphicsDevice` on top of wgpu.
//!
//! Draws issued inside a pass are buffered and encoded when the pass ends.
//! Every draw gets its own slot in a per-frame uniform ring, addressed with a
//! dynamic offset. All passes of a frame share one command encoder that is
//! submitted by `present`.

use super::context::GfxContext;
use super::device::*;
use crate::model::vertex::{AuxAttribute, GpuVertex, VertexLayout};
use glam::Mat4;
use std::collections::HashMap;
use std::num::NonZeroU64;
use wgpu::util::DeviceExt;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;

/// Uniform ring slots, i.e. draws per frame across both eyes.
const MAX_DRAWS_PER_FRAME: u64 = 256;

/// Maps OpenGL clip depth `[-1, 1]` onto wgpu's `[0, 1]`.
#[rustfmt::skip]
const OPENGL_TO_WGPU: Mat4 = Mat4::from_cols_array(&[
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
]);

/// Full-screen triangle vertices
const FS_TRI: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];

const MODEL_WGSL: &str = r#"
struct Uniforms {
    mvp: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tDiffuse: texture_2d<f32>;
@group(1) @binding(1) var samp: sampler;

struct VSOut {
    @builtin(position) clip: vec4<f32>,
    @location(0)         uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec4<f32>, @location(1) uv: vec2<f32>) -> VSOut {
    var out: VSOut;
    out.clip = u.mvp * position;
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VSOut) -> @location(0) vec4<f32> {
    return textureSample(tDiffuse, samp, in.uv);
}
"#;

/// WGSL shader for a simple texture blit/passthrough.
const BLIT_WGSL: &str = r#"
struct VSOut {
    @builtin(position) clip: vec4<f32>,
    @location(0)         uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) pos: vec2<f32>) -> VSOut {
    var out: VSOut;
    out.clip = vec4<f32>(pos, 0.0, 1.0);
    out.uv = vec2<f32>(0.5 * (pos.x + 1.0), 0.5 * (-pos.y + 1.0));
    return out;
}

@group(0) @binding(0) var tSrc: texture_2d<f32>;
@group(0) @binding(1) var samp: sampler;

@fragment
fn fs_main(in: VSOut) -> @location(0) vec4<f32> {
    return textureSampleLevel(tSrc, samp, in.uv, 0.0);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct UboModel {
    mvp: [[f32; 4]; 4],
}

const UBO_SIZE: u64 = std::mem::size_of::<UboModel>() as u64;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    size: u64,
}

#[derive(Clone, Copy)]
struct GpuMesh {
    vertex_buffer: BufferId,
    index_buffer: BufferId,
    layout: VertexLayout,
}

struct GpuTexture {
    texture: wgpu::Texture,
    bind: wgpu::BindGroup,
}

struct GpuTarget {
    color: wgpu::Texture,
    view: wgpu::TextureView,
    depth: Option<(wgpu::Texture, wgpu::TextureView)>,
    width: u32,
    height: u32,
    samples: u32,
    /// Sampling bind group for blits; single-sample targets only.
    blit_bind: Option<wgpu::BindGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    layout: VertexLayout,
    samples: u32,
    depth: bool,
}

struct PendingDraw {
    key: PipelineKey,
    mesh: GpuMesh,
    texture: TextureId,
    uniform_offset: u32,
    first_index: u32,
    index_count: u32,
}

struct PendingPass {
    target: RenderTargetId,
    clear: [f32; 4],
    draws: Vec<PendingDraw>,
}

struct Frame {
    surface: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
    encoder: wgpu::CommandEncoder,
    draws: u64,
    surface_cleared: bool,
}

struct BlitPass {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    fs_vbo: wgpu::Buffer,
}

pub struct WgpuDevice {
    ctx: GfxContext,
    shader: wgpu::ShaderModule,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_ring: wgpu::Buffer,
    uniform_bind: wgpu::BindGroup,
    uniform_stride: u64,
    blit: BlitPass,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    buffers: HashMap<BufferId, GpuBuffer>,
    meshes: HashMap<MeshId, GpuMesh>,
    textures: HashMap<TextureId, GpuTexture>,
    targets: HashMap<RenderTargetId, GpuTarget>,
    frame: Option<Frame>,
    pass: Option<PendingPass>,
    next_id: u32,
}

impl WgpuDevice {
    pub fn new(ctx: GfxContext) -> Result<Self, DeviceError> {
        let device = &ctx.device;

        let shader = scoped(device, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("render_model.wgsl"),
                source: wgpu::ShaderSource::Wgsl(MODEL_WGSL.into()),
            })
        })
        .map_err(|e| shader_error("render_model", e))?;

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("RenderModel Uniform Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(UBO_SIZE),
                },
                count: None,
            }],
        });

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("RenderModel Texture Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("RenderModel PipelineLayout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let align = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let uniform_stride = UBO_SIZE.div_ceil(align) * align;
        let uniform_ring = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("RenderModel Uniform Ring"),
            size: uniform_stride * MAX_DRAWS_PER_FRAME,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("RenderModel Uniform Bind"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_ring,
                    offset: 0,
                    size: NonZeroU64::new(UBO_SIZE),
                }),
            }],
        });

        let blit = BlitPass::new(device, ctx.config.format)?;

        Ok(Self {
            ctx,
            shader,
            texture_layout,
            pipeline_layout,
            uniform_ring,
            uniform_bind,
            uniform_stride,
            blit,
            pipelines: HashMap::new(),
            buffers: HashMap::new(),
            meshes: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            frame: None,
            pass: None,
            next_id: 1,
        })
    }

    pub fn context(&self) -> &GfxContext {
        &self.ctx
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn pipeline(&mut self, key: PipelineKey) -> Result<(), DeviceError> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let device = &self.ctx.device;
        let mut attributes = vec![
            wgpu::VertexAttribute {
                shader_location: 0,
                offset: 0,
                format: wgpu::VertexFormat::Float32x4,
            },
            wgpu::VertexAttribute {
                shader_location: 1,
                offset: GpuVertex::TEX_COORD_OFFSET,
                format: wgpu::VertexFormat::Float32x2,
            },
        ];
        // wgpu has no single-component 16-bit format; the single variant
        // leaves the attribute undeclared.
        if key.layout.aux == AuxAttribute::Padded {
            attributes.push(wgpu::VertexAttribute {
                shader_location: 2,
                offset: GpuVertex::AUX_OFFSET,
                format: wgpu::VertexFormat::Uint16x2,
            });
        }

        let pipeline = scoped(device, || {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("RenderModel Pipeline"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader,
                    entry_point: "vs_main",
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: GpuVertex::STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multisample: wgpu::MultisampleState {
                    count: key.samples,
                    ..Default::default()
                },
                multiview: None,
            })
        })
        .map_err(|e| shader_error("render_model", e))?;

        log::debug!("created render model pipeline for {key:?}");
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    fn sample_count_supported(&self, samples: u32, depth: bool) -> bool {
        let adapter = &self.ctx.adapter;
        let color = adapter
            .get_texture_format_features(COLOR_FORMAT)
            .flags
            .sample_count_supported(samples);
        let depth_ok = !depth
            || adapter
                .get_texture_format_features(DEPTH_FORMAT)
                .flags
                .sample_count_supported(samples);
        color && depth_ok
    }

    fn frame_mut(&mut self, call: &str) -> Result<&mut Frame, DeviceError> {
        if self.pass.is_some() {
            return Err(DeviceError::InvalidState(format!("{call} inside a pass")));
        }
        self.frame
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState(format!("{call} outside a frame")))
    }
}

impl GraphicsDevice for WgpuDevice {
    fn limits(&self) -> DeviceLimits {
        let limits = self.ctx.device.limits();
        DeviceLimits {
            max_buffer_size: limits.max_buffer_size,
            max_texture_dimension: limits.max_texture_dimension_2d,
        }
    }

    fn max_anisotropy(&self) -> Result<f32, DeviceError> {
        let caps = self.ctx.adapter.get_downlevel_capabilities();
        if caps.flags.contains(wgpu::DownlevelFlags::ANISOTROPIC_FILTERING) {
            Ok(16.0)
        } else {
            Err(DeviceError::CapabilityQuery(
                "adapter does not support anisotropic filtering".into(),
            ))
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.ctx.config.width, self.ctx.config.height)
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError> {
        let max = self.limits().max_buffer_size;
        if desc.size > max {
            return Err(DeviceError::Allocation {
                what: desc.label.to_string(),
                reason: format!("{} bytes exceeds device limit of {max}", desc.size),
            });
        }
        let usage = match desc.kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;

        let device = &self.ctx.device;
        let buffer = scoped(device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size: desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            })
        })
        .map_err(|e| DeviceError::Allocation {
            what: desc.label.to_string(),
            reason: e.to_string(),
        })?;

        let id = BufferId(self.next());
        self.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                kind: desc.kind,
                size: desc.size,
            },
        );
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let buf = self.buffers.get(&buffer).ok_or(DeviceError::UnknownHandle("buffer"))?;
        let len = data.len() as u64;
        if offset + len > buf.size {
            return Err(DeviceError::WriteOutOfBounds {
                offset,
                len,
                capacity: buf.size,
            });
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(DeviceError::InvalidState(format!(
                "buffer write at {offset} of {len} bytes is not 4-byte aligned"
            )));
        }
        self.ctx.queue.write_buffer(&buf.buffer, offset, data);
        Ok(())
    }

    fn create_mesh(&mut self, desc: &MeshDesc<'_>) -> Result<MeshId, DeviceError> {
        match (self.buffers.get(&desc.vertex_buffer), self.buffers.get(&desc.index_buffer)) {
            (Some(v), Some(i)) if v.kind == BufferKind::Vertex && i.kind == BufferKind::Index => {}
            _ => return Err(DeviceError::UnknownHandle("mesh buffer")),
        }
        let id = MeshId(self.next());
        self.meshes.insert(
            id,
            GpuMesh {
                vertex_buffer: desc.vertex_buffer,
                index_buffer: desc.index_buffer,
                layout: desc.layout,
            },
        );
        Ok(id)
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError> {
        let alloc_err = |reason: String| DeviceError::Allocation {
            what: desc.label.to_string(),
            reason,
        };
        let max = self.limits().max_texture_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(alloc_err(format!("{}x{} outside 1..={max}", desc.width, desc.height)));
        }
        let base = image::RgbaImage::from_raw(desc.width, desc.height, desc.rgba.to_vec())
            .ok_or_else(|| alloc_err(format!("{} bytes for {}x{}", desc.rgba.len(), desc.width, desc.height)))?;

        let mip_level_count = if desc.mipmaps {
            32 - desc.width.max(desc.height).leading_zeros()
        } else {
            1
        };

        let device = &self.ctx.device;
        let texture = scoped(device, || {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: COLOR_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })
        .map_err(|e| alloc_err(e.to_string()))?;

        for level in 0..mip_level_count {
            let (w, h) = ((desc.width >> level).max(1), (desc.height >> level).max(1));
            let resized;
            let pixels = if level == 0 {
                &base
            } else {
                resized = image::imageops::resize(&base, w, h, image::imageops::FilterType::Triangle);
                &resized
            };
            self.ctx.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels.as_raw(),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * w),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
        }

        // Anisotropic filtering requires linear filtering everywhere.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(desc.label),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            anisotropy_clamp: (desc.anisotropy as u16).clamp(1, 16),
            ..Default::default()
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(desc.label),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let id = TextureId(self.next());
        self.textures.insert(id, GpuTexture { texture, bind });
        Ok(id)
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> Result<RenderTargetId, DeviceError> {
        let incomplete = |reason: String| DeviceError::FramebufferIncomplete {
            label: desc.label.to_string(),
            width: desc.width,
            height: desc.height,
            samples: desc.samples,
            reason,
        };
        let max = self.limits().max_texture_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(incomplete(format!("extent outside 1..={max}")));
        }
        if !self.sample_count_supported(desc.samples, desc.depth) {
            return Err(incomplete("sample count not supported by the adapter".into()));
        }

        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let device = &self.ctx.device;
        let create_tex = |label: &str, format, usage| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: desc.samples,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        };

        let mut color_usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if desc.samples == 1 {
            color_usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        let (color, depth) = scoped(device, || {
            let color = create_tex(desc.label, COLOR_FORMAT, color_usage);
            let depth = desc
                .depth
                .then(|| create_tex(desc.label, DEPTH_FORMAT, wgpu::TextureUsages::RENDER_ATTACHMENT));
            (color, depth)
        })
        .map_err(|e| incomplete(e.to_string()))?;

        let view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let blit_bind = (desc.samples == 1).then(|| self.blit.bind(device, &view));
        let depth = depth.map(|t| {
            let v = t.create_view(&wgpu::TextureViewDescriptor::default());
            (t, v)
        });

        let id = RenderTargetId(self.next());
        self.targets.insert(
            id,
            GpuTarget {
                color,
                view,
                depth,
                width: desc.width,
                height: desc.height,
                samples: desc.samples,
                blit_bind,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(b) = self.buffers.remove(&buffer) {
            b.buffer.destroy();
        }
    }

    fn destroy_mesh(&mut self, mesh: MeshId) {
        self.meshes.remove(&mesh);
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(t) = self.textures.remove(&texture) {
            t.texture.destroy();
        }
    }

    fn destroy_render_target(&mut self, target: RenderTargetId) {
        if let Some(t) = self.targets.remove(&target) {
            t.color.destroy();
            if let Some((depth, _)) = t.depth {
                depth.destroy();
            }
        }
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        if self.frame.is_some() {
            return Err(DeviceError::InvalidState("frame already begun".into()));
        }
        let surface = match self.ctx.surface.get_current_texture() {
            Ok(t) => t,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => return Err(DeviceError::SurfaceLost),
            Err(e) => return Err(DeviceError::Surface(e.to_string())),
        };
        let view = surface.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame") });
        self.frame = Some(Frame {
            surface,
            view,
            encoder,
            draws: 0,
            surface_cleared: false,
        });
        Ok(())
    }

    fn begin_pass(&mut self, target: RenderTargetId, clear: [f32; 4]) -> Result<(), DeviceError> {
        self.frame_mut("begin_pass")?;
        if !self.targets.contains_key(&target) {
            return Err(DeviceError::UnknownHandle("render target"));
        }
        self.pass = Some(PendingPass {
            target,
            clear,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn draw_indexed(&mut self, draw: &DrawIndexed) -> Result<(), DeviceError> {
        let (samples, depth) = {
            let pass = self
                .pass
                .as_ref()
                .ok_or_else(|| DeviceError::InvalidState("draw outside pass".into()))?;
            let t = self
                .targets
                .get(&pass.target)
                .ok_or(DeviceError::UnknownHandle("render target"))?;
            (t.samples, t.depth.is_some())
        };
        let mesh = *self.meshes.get(&draw.mesh).ok_or(DeviceError::UnknownHandle("mesh"))?;
        if !self.textures.contains_key(&draw.texture) {
            return Err(DeviceError::UnknownHandle("texture"));
        }
        let index_bytes = self
            .buffers
            .get(&mesh.index_buffer)
            .ok_or(DeviceError::UnknownHandle("index buffer"))?
            .size;
        if (u64::from(draw.first_index) + u64::from(draw.index_count)) * 4 > index_bytes {
            return Err(DeviceError::InvalidState("draw reads past index buffer".into()));
        }

        let key = PipelineKey {
            layout: mesh.layout,
            samples,
            depth,
        };
        self.pipeline(key)?;

        let slot = self.frame.as_ref().map_or(0, |f| f.draws);
        if slot >= MAX_DRAWS_PER_FRAME {
            return Err(DeviceError::InvalidState(format!(
                "more than {MAX_DRAWS_PER_FRAME} draws in one frame"
            )));
        }
        let offset = slot * self.uniform_stride;
        let ubo = UboModel {
            mvp: (OPENGL_TO_WGPU * draw.mvp).to_cols_array_2d(),
        };
        self.ctx.queue.write_buffer(&self.uniform_ring, offset, bytemuck::bytes_of(&ubo));
        if let Some(frame) = self.frame.as_mut() {
            frame.draws += 1;
        }

        if let Some(pass) = self.pass.as_mut() {
            pass.draws.push(PendingDraw {
                key,
                mesh,
                texture: draw.texture,
                uniform_offset: offset as u32,
                first_index: draw.first_index,
                index_count: draw.index_count,
            });
        }
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        let pass = self
            .pass
            .take()
            .ok_or_else(|| DeviceError::InvalidState("end_pass without pass".into()))?;
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState("end_pass outside a frame".into()))?;
        let target = self
            .targets
            .get(&pass.target)
            .ok_or(DeviceError::UnknownHandle("render target"))?;

        let [r, g, b, a] = pass.clear.map(f64::from);
        let mut rpass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Eye Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: target.depth.as_ref().map(|(_, view)| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for d in &pass.draws {
            let (Some(pipeline), Some(texture), Some(vb), Some(ib)) = (
                self.pipelines.get(&d.key),
                self.textures.get(&d.texture),
                self.buffers.get(&d.mesh.vertex_buffer),
                self.buffers.get(&d.mesh.index_buffer),
            ) else {
                log::warn!("skipping draw whose resources were destroyed mid-pass");
                continue;
            };
            rpass.set_pipeline(pipeline);
            rpass.set_bind_group(0, &self.uniform_bind, &[d.uniform_offset]);
            rpass.set_bind_group(1, &texture.bind, &[]);
            rpass.set_vertex_buffer(0, vb.buffer.slice(..));
            rpass.set_index_buffer(ib.buffer.slice(..), wgpu::IndexFormat::Uint32);
            rpass.draw_indexed(d.first_index..d.first_index + d.index_count, 0, 0..1);
        }
        Ok(())
    }

    fn resolve(&mut self, src: RenderTargetId, dst: RenderTargetId) -> Result<(), DeviceError> {
        self.frame_mut("resolve")?;
        let s = self.targets.get(&src).ok_or(DeviceError::UnknownHandle("render target"))?;
        let d = self.targets.get(&dst).ok_or(DeviceError::UnknownHandle("render target"))?;
        if s.samples <= 1 || d.samples != 1 || (s.width, s.height) != (d.width, d.height) {
            return Err(DeviceError::InvalidState(
                "resolve needs msaa source and matching single-sample destination".into(),
            ));
        }
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        // An empty pass that loads the samples and stores them resolved.
        frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Eye Resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &s.view,
                resolve_target: Some(&d.view),
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        Ok(())
    }

    fn blit_to_surface(&mut self, src: RenderTargetId, dst: Viewport) -> Result<(), DeviceError> {
        self.frame_mut("blit_to_surface")?;
        let (surface_w, surface_h) = self.surface_size();
        if dst.x + dst.width > surface_w || dst.y + dst.height > surface_h {
            return Err(DeviceError::InvalidState(format!("blit {dst:?} outside {surface_w}x{surface_h} surface")));
        }
        let s = self.targets.get(&src).ok_or(DeviceError::UnknownHandle("render target"))?;
        let bind = s
            .blit_bind
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidState("blit source must be single-sample".into()))?;
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };

        let load = if frame.surface_cleared {
            wgpu::LoadOp::Load
        } else {
            wgpu::LoadOp::Clear(wgpu::Color::BLACK)
        };
        frame.surface_cleared = true;
        let mut rpass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Eye Blit"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &frame.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        rpass.set_viewport(dst.x as f32, dst.y as f32, dst.width as f32, dst.height as f32, 0.0, 1.0);
        rpass.set_pipeline(&self.blit.pipeline);
        rpass.set_bind_group(0, bind, &[]);
        rpass.set_vertex_buffer(0, self.blit.fs_vbo.slice(..));
        rpass.draw(0..3, 0..1);
        Ok(())
    }

    fn present(&mut self) -> Result<(), DeviceError> {
        self.frame_mut("present")?;
        let Some(frame) = self.frame.take() else {
            return Ok(());
        };
        self.ctx.queue.submit(std::iter::once(frame.encoder.finish()));
        frame.surface.present();
        Ok(())
    }

    fn wait_idle(&mut self) {
        self.ctx.device.poll(wgpu::Maintain::Wait);
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.ctx.resize(winit::dpi::PhysicalSize::new(width, height));
    }
}

impl BlitPass {
    fn new(device: &wgpu::Device, out_fmt: wgpu::TextureFormat) -> Result<Self, DeviceError> {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("BlitPass Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });

        let pipe_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("BlitPass PipelineLayout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = scoped(device, || {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("blit.wgsl"),
                source: wgpu::ShaderSource::Wgsl(BLIT_WGSL.into()),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("BlitPass Pipeline"),
                layout: Some(&pipe_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            shader_location: 0,
                            offset: 0,
                            format: wgpu::VertexFormat::Float32x2,
                        }],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: out_fmt,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })
        .map_err(|e| shader_error("blit", e))?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("BlitPass Sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let fs_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("BlitPass FS VBO"),
            contents: bytemuck::cast_slice(&FS_TRI),
            usage: wgpu::BufferUsages::VERTEX,
        });

        Ok(Self {
            pipeline,
            layout,
            sampler,
            fs_vbo,
        })
    }

    fn bind(&self, device: &wgpu::Device, src: &wgpu::TextureView) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("BlitPass Bind"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(src),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }
}

/// Runs `f` inside validation and out-of-memory error scopes.
fn scoped<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T, wgpu::Error> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());
    match validation.or(oom) {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

fn shader_error(name: &str, e: wgpu::Error) -> DeviceError {
    DeviceError::Shader {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn clip_remap_moves_gl_depth_range_to_zero_one() {
        let near = OPENGL_TO_WGPU * Vec4::new(0.0, 0.0, -1.0, 1.0);
        let far = OPENGL_TO_WGPU * Vec4::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(near.z / near.w, 0.0);
        assert_eq!(far.z / far.w, 1.0);
    }

    #[test]
    fn uniform_block_is_one_matrix() {
        assert_eq!(UBO_SIZE, 64);
    }
}
