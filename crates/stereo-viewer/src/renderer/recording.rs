//! In-memory `GraphicsDevice` used by the unit tests.
//!
//! Buffers keep real bytes. Render targets keep the list of draws that landed
//! in them since their last clear, which stands in for pixel content: resolve
//! copies it and blits place it on the surface.

use super::device::*;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateBuffer(BufferId),
    WriteBuffer { buffer: BufferId, offset: u64, len: u64 },
    CreateMesh(MeshId),
    CreateTexture(TextureId),
    CreateRenderTarget(RenderTargetId),
    DestroyBuffer(BufferId),
    DestroyMesh(MeshId),
    DestroyTexture(TextureId),
    DestroyRenderTarget(RenderTargetId),
    BeginFrame,
    BeginPass { target: RenderTargetId, clear: [f32; 4] },
    Draw(DrawIndexed),
    EndPass,
    Resolve { src: RenderTargetId, dst: RenderTargetId },
    Blit { src: RenderTargetId, dst: Viewport },
    Present,
    WaitIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Buffer,
    Mesh,
    Texture,
    RenderTarget,
}

#[derive(Debug, Clone)]
pub struct RecordedBuffer {
    pub kind: BufferKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RecordedTexture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub mipmaps: bool,
    pub anisotropy: f32,
}

#[derive(Debug, Clone)]
pub struct RecordedTarget {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub depth: bool,
    pub clear: Option<[f32; 4]>,
    pub contents: Vec<DrawIndexed>,
}

/// Surface regions written during one frame, in blit order.
pub type SurfaceImage = Vec<(Viewport, Vec<DrawIndexed>)>;

pub struct RecordingDevice {
    pub commands: Vec<Command>,
    pub buffers: HashMap<BufferId, RecordedBuffer>,
    pub meshes: HashMap<MeshId, MeshDesc<'static>>,
    pub textures: HashMap<TextureId, RecordedTexture>,
    pub targets: HashMap<RenderTargetId, RecordedTarget>,
    pub presented: Vec<SurfaceImage>,
    pub limits: DeviceLimits,
    pub anisotropy: Option<f32>,
    pub supported_samples: Vec<u32>,
    pub fail_on: Option<FailPoint>,
    /// Render targets that may still be created before creation starts failing.
    pub render_target_budget: Option<usize>,
    surface: SurfaceImage,
    surface_size: (u32, u32),
    in_frame: bool,
    pass: Option<RenderTargetId>,
    next_id: u32,
}

impl RecordingDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            commands: Vec::new(),
            buffers: HashMap::new(),
            meshes: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            presented: Vec::new(),
            limits: DeviceLimits {
                max_buffer_size: 256 << 20,
                max_texture_dimension: 8192,
            },
            anisotropy: Some(16.0),
            supported_samples: vec![1, 4],
            fail_on: None,
            render_target_budget: None,
            surface: Vec::new(),
            surface_size: (width, height),
            in_frame: false,
            pass: None,
            next_id: 1,
        }
    }

    /// Number of objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.buffers.len() + self.meshes.len() + self.textures.len() + self.targets.len()
    }

    pub fn draws(&self) -> Vec<DrawIndexed> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Draw(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    pub fn buffer_bytes(&self, id: BufferId) -> &[u8] {
        &self.buffers[&id].bytes
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_fail(&self, point: FailPoint, what: &str) -> Result<(), DeviceError> {
        if self.fail_on == Some(point) {
            return Err(DeviceError::Allocation {
                what: what.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn target(&self, id: RenderTargetId) -> Result<&RecordedTarget, DeviceError> {
        self.targets.get(&id).ok_or(DeviceError::UnknownHandle("render target"))
    }
}

impl GraphicsDevice for RecordingDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn max_anisotropy(&self) -> Result<f32, DeviceError> {
        self.anisotropy
            .ok_or_else(|| DeviceError::CapabilityQuery("anisotropy not reported".into()))
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError> {
        self.check_fail(FailPoint::Buffer, desc.label)?;
        if desc.size > self.limits.max_buffer_size {
            return Err(DeviceError::Allocation {
                what: desc.label.to_string(),
                reason: format!("{} bytes exceeds device limit", desc.size),
            });
        }
        let id = BufferId(self.next());
        self.buffers.insert(
            id,
            RecordedBuffer {
                kind: desc.kind,
                bytes: vec![0; desc.size as usize],
            },
        );
        self.commands.push(Command::CreateBuffer(id));
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownHandle("buffer"))?;
        let capacity = buf.bytes.len() as u64;
        let len = data.len() as u64;
        if offset + len > capacity {
            return Err(DeviceError::WriteOutOfBounds { offset, len, capacity });
        }
        buf.bytes[offset as usize..(offset + len) as usize].copy_from_slice(data);
        self.commands.push(Command::WriteBuffer { buffer, offset, len });
        Ok(())
    }

    fn create_mesh(&mut self, desc: &MeshDesc<'_>) -> Result<MeshId, DeviceError> {
        self.check_fail(FailPoint::Mesh, desc.label)?;
        match (self.buffers.get(&desc.vertex_buffer), self.buffers.get(&desc.index_buffer)) {
            (Some(v), Some(i)) if v.kind == BufferKind::Vertex && i.kind == BufferKind::Index => {}
            _ => return Err(DeviceError::UnknownHandle("mesh buffer")),
        }
        let id = MeshId(self.next());
        self.meshes.insert(
            id,
            MeshDesc {
                label: "mesh",
                vertex_buffer: desc.vertex_buffer,
                index_buffer: desc.index_buffer,
                layout: desc.layout,
            },
        );
        self.commands.push(Command::CreateMesh(id));
        Ok(id)
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError> {
        self.check_fail(FailPoint::Texture, desc.label)?;
        if desc.width == 0
            || desc.height == 0
            || desc.rgba.len() != (desc.width * desc.height * 4) as usize
        {
            return Err(DeviceError::Allocation {
                what: desc.label.to_string(),
                reason: "bad texture extent".into(),
            });
        }
        let id = TextureId(self.next());
        self.textures.insert(
            id,
            RecordedTexture {
                width: desc.width,
                height: desc.height,
                rgba: desc.rgba.to_vec(),
                mipmaps: desc.mipmaps,
                anisotropy: desc.anisotropy,
            },
        );
        self.commands.push(Command::CreateTexture(id));
        Ok(id)
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> Result<RenderTargetId, DeviceError> {
        self.check_fail(FailPoint::RenderTarget, desc.label)?;
        if let Some(budget) = self.render_target_budget.as_mut() {
            if *budget == 0 {
                return Err(DeviceError::Allocation {
                    what: desc.label.to_string(),
                    reason: "render target budget exhausted".into(),
                });
            }
            *budget -= 1;
        }
        let dim = self.limits.max_texture_dimension;
        let reason = if !self.supported_samples.contains(&desc.samples) {
            Some("unsupported sample count")
        } else if desc.width == 0 || desc.height == 0 || desc.width > dim || desc.height > dim {
            Some("unsupported extent")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(DeviceError::FramebufferIncomplete {
                label: desc.label.to_string(),
                width: desc.width,
                height: desc.height,
                samples: desc.samples,
                reason: reason.into(),
            });
        }
        let id = RenderTargetId(self.next());
        self.targets.insert(
            id,
            RecordedTarget {
                width: desc.width,
                height: desc.height,
                samples: desc.samples,
                depth: desc.depth,
                clear: None,
                contents: Vec::new(),
            },
        );
        self.commands.push(Command::CreateRenderTarget(id));
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.commands.push(Command::DestroyBuffer(buffer));
    }

    fn destroy_mesh(&mut self, mesh: MeshId) {
        self.meshes.remove(&mesh);
        self.commands.push(Command::DestroyMesh(mesh));
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.commands.push(Command::DestroyTexture(texture));
    }

    fn destroy_render_target(&mut self, target: RenderTargetId) {
        self.targets.remove(&target);
        self.commands.push(Command::DestroyRenderTarget(target));
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        if self.in_frame {
            return Err(DeviceError::InvalidState("frame already begun".into()));
        }
        self.in_frame = true;
        self.surface.clear();
        self.commands.push(Command::BeginFrame);
        Ok(())
    }

    fn begin_pass(&mut self, target: RenderTargetId, clear: [f32; 4]) -> Result<(), DeviceError> {
        if !self.in_frame || self.pass.is_some() {
            return Err(DeviceError::InvalidState("begin_pass outside frame or inside pass".into()));
        }
        let t = self
            .targets
            .get_mut(&target)
            .ok_or(DeviceError::UnknownHandle("render target"))?;
        t.clear = Some(clear);
        t.contents.clear();
        self.pass = Some(target);
        self.commands.push(Command::BeginPass { target, clear });
        Ok(())
    }

    fn draw_indexed(&mut self, draw: &DrawIndexed) -> Result<(), DeviceError> {
        let target = self
            .pass
            .ok_or_else(|| DeviceError::InvalidState("draw outside pass".into()))?;
        let mesh = self.meshes.get(&draw.mesh).ok_or(DeviceError::UnknownHandle("mesh"))?;
        if !self.textures.contains_key(&draw.texture) {
            return Err(DeviceError::UnknownHandle("texture"));
        }
        let index_bytes = self.buffers[&mesh.index_buffer].bytes.len() as u64;
        if (u64::from(draw.first_index) + u64::from(draw.index_count)) * 4 > index_bytes {
            return Err(DeviceError::InvalidState("draw reads past index buffer".into()));
        }
        if let Some(t) = self.targets.get_mut(&target) {
            t.contents.push(*draw);
        }
        self.commands.push(Command::Draw(*draw));
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        self.pass
            .take()
            .ok_or_else(|| DeviceError::InvalidState("end_pass without pass".into()))?;
        self.commands.push(Command::EndPass);
        Ok(())
    }

    fn resolve(&mut self, src: RenderTargetId, dst: RenderTargetId) -> Result<(), DeviceError> {
        let (s, d) = (self.target(src)?, self.target(dst)?);
        if s.samples <= 1 || d.samples != 1 || (s.width, s.height) != (d.width, d.height) {
            return Err(DeviceError::InvalidState("resolve needs msaa source and matching single-sample destination".into()));
        }
        let contents = s.contents.clone();
        if let Some(d) = self.targets.get_mut(&dst) {
            d.contents = contents;
        }
        self.commands.push(Command::Resolve { src, dst });
        Ok(())
    }

    fn blit_to_surface(&mut self, src: RenderTargetId, dst: Viewport) -> Result<(), DeviceError> {
        let s = self.target(src)?;
        if s.samples != 1 {
            return Err(DeviceError::InvalidState("blit source must be single-sample".into()));
        }
        let contents = s.contents.clone();
        self.surface.push((dst, contents));
        self.commands.push(Command::Blit { src, dst });
        Ok(())
    }

    fn present(&mut self) -> Result<(), DeviceError> {
        if !self.in_frame || self.pass.is_some() {
            return Err(DeviceError::InvalidState("present outside frame or inside pass".into()));
        }
        self.in_frame = false;
        self.presented.push(std::mem::take(&mut self.surface));
        self.commands.push(Command::Present);
        Ok(())
    }

    fn wait_idle(&mut self) {
        self.commands.push(Command::WaitIdle);
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface_size = (width, height);
    }
}
