//! GPU-resident render model: vertex/index buffers, mesh binding and texture.

use crate::config::LoaderConfig;
use crate::model::packer::{pack_indices, pack_vertices, PackError, TilePlan};
use crate::model::vertex::GpuVertex;
use crate::renderer::device::{
    BufferDesc, BufferId, BufferKind, DeviceError, DrawIndexed, GraphicsDevice, MeshDesc, MeshId,
    TextureDesc, TextureId,
};
use glam::Mat4;
use rmdl::{RawRenderModel, RenderModelData};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderModelError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: rmdl::Error,
    },

    #[error("malformed render model {name}: {reason}")]
    Format { name: String, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RenderModelError {
    fn format(name: &str, reason: impl ToString) -> Self {
        RenderModelError::Format {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    fn from_pack(name: &str, err: PackError) -> Self {
        match err {
            PackError::Device(e) => RenderModelError::Device(e),
            other => RenderModelError::format(name, other),
        }
    }
}

#[derive(Debug, Default)]
struct Handles {
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    mesh: Option<MeshId>,
    texture: Option<TextureId>,
}

impl Handles {
    fn release<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) {
        if let Some(texture) = self.texture.take() {
            gpu.destroy_texture(texture);
        }
        if let Some(mesh) = self.mesh.take() {
            gpu.destroy_mesh(mesh);
        }
        if let Some(buffer) = self.index_buffer.take() {
            gpu.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.vertex_buffer.take() {
            gpu.destroy_buffer(buffer);
        }
    }

    fn is_empty(&self) -> bool {
        self.vertex_buffer.is_none()
            && self.index_buffer.is_none()
            && self.mesh.is_none()
            && self.texture.is_none()
    }
}

/// A loaded render model. Owned by exactly one device slot and released
/// explicitly with [`RenderModelResource::release`].
#[derive(Debug)]
pub struct RenderModelResource {
    name: String,
    handles: Handles,
    index_count: u32,
    vertex_tiles: TilePlan,
    index_tiles: TilePlan,
}

impl RenderModelResource {
    /// Reads a model file and uploads it.
    pub fn load_from_file<D: GraphicsDevice + ?Sized>(
        gpu: &mut D,
        name: &str,
        path: &Path,
        loader: &LoaderConfig,
    ) -> Result<Self, RenderModelError> {
        let data = rmdl::read_file(path).map_err(|e| {
            if e.is_io() {
                RenderModelError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            } else {
                RenderModelError::format(name, e)
            }
        })?;
        log::debug!(
            "read {}: {} vertices, {} triangles, {}x{} texture",
            path.display(),
            data.vertices.len(),
            data.triangle_count(),
            data.texture.width,
            data.texture.height
        );
        Self::upload(gpu, name, &data, loader)
    }

    /// Uploads a model reported by the tracking runtime.
    pub fn load_from_device_model<D: GraphicsDevice + ?Sized>(
        gpu: &mut D,
        name: &str,
        raw: &RawRenderModel,
        loader: &LoaderConfig,
    ) -> Result<Self, RenderModelError> {
        Self::upload(gpu, name, &raw.widen(), loader)
    }

    fn upload<D: GraphicsDevice + ?Sized>(
        gpu: &mut D,
        name: &str,
        data: &RenderModelData,
        loader: &LoaderConfig,
    ) -> Result<Self, RenderModelError> {
        validate(name, data)?;
        let index_count = u32::try_from(data.indices.len())
            .map_err(|_| RenderModelError::format(name, "index count exceeds u32"))?;

        let mut handles = Handles::default();
        match create(gpu, name, data, loader, &mut handles) {
            Ok((vertex_tiles, index_tiles)) => {
                log::info!(
                    "loaded render model {name}: {index_count} indices, {} vertex tiles, {} index tiles",
                    vertex_tiles.tile_count,
                    index_tiles.tile_count
                );
                Ok(Self {
                    name: name.to_string(),
                    handles,
                    index_count,
                    vertex_tiles,
                    index_tiles,
                })
            }
            Err(e) => {
                handles.release(gpu);
                Err(e)
            }
        }
    }

    /// Issues one indexed draw of the recorded index count with this model's
    /// mesh and texture bound to unit 0.
    pub fn draw<D: GraphicsDevice + ?Sized>(&self, gpu: &mut D, mvp: Mat4) -> Result<(), DeviceError> {
        let (Some(mesh), Some(texture)) = (self.handles.mesh, self.handles.texture) else {
            return Err(DeviceError::InvalidState(format!(
                "render model {} drawn after release",
                self.name
            )));
        };
        gpu.draw_indexed(&DrawIndexed {
            mesh,
            texture,
            mvp,
            first_index: 0,
            index_count: self.index_count,
        })
    }

    /// Frees every GPU handle. Calling it again is a no-op.
    pub fn release<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) {
        if !self.handles.is_empty() {
            log::debug!("releasing render model {}", self.name);
        }
        self.handles.release(gpu);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_tiles(&self) -> TilePlan {
        self.vertex_tiles
    }

    pub fn index_tiles(&self) -> TilePlan {
        self.index_tiles
    }

    pub fn is_released(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.handles.texture
    }

    pub fn mesh(&self) -> Option<MeshId> {
        self.handles.mesh
    }
}

impl Drop for RenderModelResource {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            log::warn!("render model {} dropped without release; GPU handles leaked", self.name);
        }
    }
}

fn validate(name: &str, data: &RenderModelData) -> Result<(), RenderModelError> {
    if data.vertices.is_empty() || data.indices.is_empty() {
        return Err(RenderModelError::format(name, "empty geometry"));
    }
    if data.indices.len() % 3 != 0 {
        return Err(RenderModelError::format(
            name,
            format!("{} indices is not a triangle list", data.indices.len()),
        ));
    }
    if let Some((position, index)) = data
        .indices
        .iter()
        .enumerate()
        .find(|&(_, &i)| i as usize >= data.vertices.len())
    {
        return Err(RenderModelError::format(
            name,
            format!("index {index} at {position} out of range for {} vertices", data.vertices.len()),
        ));
    }
    let tex = &data.texture;
    if tex.width == 0 || tex.height == 0 {
        return Err(RenderModelError::format(name, "zero-sized texture"));
    }
    if tex.rgba.len() != rmdl::Texture::expected_len(tex.width, tex.height) {
        return Err(RenderModelError::format(
            name,
            format!("{} texture bytes for {}x{}", tex.rgba.len(), tex.width, tex.height),
        ));
    }
    Ok(())
}

fn create<D: GraphicsDevice + ?Sized>(
    gpu: &mut D,
    name: &str,
    data: &RenderModelData,
    loader: &LoaderConfig,
    handles: &mut Handles,
) -> Result<(TilePlan, TilePlan), RenderModelError> {
    let strategy = loader.buffer_strategy;
    let vertices: Vec<GpuVertex> = data.vertices.iter().map(GpuVertex::from).collect();

    let vertex_bytes = vertices.len() as u64 * GpuVertex::STRIDE;
    let vertex_capacity = strategy.vertex_capacity(vertex_bytes);
    let vertex_buffer = gpu.create_buffer(&BufferDesc {
        label: &format!("{name} vertices"),
        kind: BufferKind::Vertex,
        size: vertex_capacity,
    })?;
    handles.vertex_buffer = Some(vertex_buffer);
    let vertex_tiles = pack_vertices(gpu, vertex_buffer, vertex_capacity, &vertices)
        .map_err(|e| RenderModelError::from_pack(name, e))?;

    let index_bytes = std::mem::size_of_val(data.indices.as_slice()) as u64;
    let index_capacity = strategy.index_capacity(index_bytes, vertex_tiles.tile_count);
    let stride = u32::try_from(vertices.len())
        .ok()
        .and_then(|n| n.checked_mul(strategy.index_stride_tiles()))
        .ok_or_else(|| RenderModelError::format(name, "index stride overflows u32"))?;
    let index_buffer = gpu.create_buffer(&BufferDesc {
        label: &format!("{name} indices"),
        kind: BufferKind::Index,
        size: index_capacity,
    })?;
    handles.index_buffer = Some(index_buffer);
    let index_tiles = pack_indices(gpu, index_buffer, index_capacity, &data.indices, stride)
        .map_err(|e| RenderModelError::from_pack(name, e))?;

    handles.mesh = Some(gpu.create_mesh(&MeshDesc {
        label: name,
        vertex_buffer,
        index_buffer,
        layout: loader.vertex_layout,
    })?);

    let anisotropy = gpu.max_anisotropy().unwrap_or_else(|e| {
        log::warn!("{e}; using anisotropy 1.0 for {name}");
        1.0
    });
    handles.texture = Some(gpu.create_texture(&TextureDesc {
        label: name,
        width: u32::from(data.texture.width),
        height: u32::from(data.texture.height),
        rgba: &data.texture.rgba,
        mipmaps: true,
        anisotropy,
    })?);

    Ok((vertex_tiles, index_tiles))
}
