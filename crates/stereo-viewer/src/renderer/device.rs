//! The graphics collaborator seen by the render-model and stereo pipelines.
//!
//! Handles are plain ids into the device's own tables. Commands are applied
//! in issue order; draws between `begin_pass` and `end_pass` land in the
//! pass's render target.

use crate::model::vertex::VertexLayout;
use glam::Mat4;
use thiserror::Error;

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);
    };
}

handle!(BufferId);
handle!(MeshId);
handle!(TextureId);
handle!(RenderTargetId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub kind: BufferKind,
    /// Capacity in bytes. Contents start zeroed.
    pub size: u64,
}

/// Binds one vertex buffer and one u32 index buffer under a vertex layout.
#[derive(Debug, Clone, Copy)]
pub struct MeshDesc<'a> {
    pub label: &'a str,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub layout: VertexLayout,
}

/// RGBA8 texture upload.
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub rgba: &'a [u8],
    /// Build and upload the full mip chain.
    pub mipmaps: bool,
    /// Anisotropy level for the texture's sampler; 1.0 disables it.
    pub anisotropy: f32,
}

/// Offscreen color target, optionally multisampled and with a depth attachment.
#[derive(Debug, Clone, Copy)]
pub struct RenderTargetDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub depth: bool,
}

/// Pixel rectangle on the presented surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawIndexed {
    pub mesh: MeshId,
    /// Bound to texture unit 0.
    pub texture: TextureId,
    /// Model-view-projection in OpenGL clip conventions.
    pub mvp: Mat4,
    pub first_index: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_texture_dimension: u32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("allocation of {what} failed: {reason}")]
    Allocation { what: String, reason: String },

    #[error("framebuffer {label} incomplete ({width}x{height}, {samples} samples): {reason}")]
    FramebufferIncomplete {
        label: String,
        width: u32,
        height: u32,
        samples: u32,
        reason: String,
    },

    #[error("{size} byte payload exceeds {capacity} byte buffer capacity")]
    CapacityExceeded { size: u64, capacity: u64 },

    #[error("write of {len} bytes at offset {offset} overruns {capacity} byte buffer")]
    WriteOutOfBounds { offset: u64, len: u64, capacity: u64 },

    #[error("unknown {0} handle")]
    UnknownHandle(&'static str),

    #[error("invalid command order: {0}")]
    InvalidState(String),

    #[error("shader program {name} failed: {reason}")]
    Shader { name: String, reason: String },

    #[error("surface error: {0}")]
    Surface(String),

    #[error("surface lost")]
    SurfaceLost,

    #[error("capability query failed: {0}")]
    CapabilityQuery(String),
}

/// Everything the harness needs from a graphics context.
pub trait GraphicsDevice {
    fn limits(&self) -> DeviceLimits;

    /// Largest anisotropy level the device supports.
    fn max_anisotropy(&self) -> Result<f32, DeviceError>;

    /// Current presentable surface size in pixels.
    fn surface_size(&self) -> (u32, u32);

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError>;

    /// Writes `data` at `offset`. Writing past the buffer's capacity is an error
    /// and leaves the buffer untouched.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn create_mesh(&mut self, desc: &MeshDesc<'_>) -> Result<MeshId, DeviceError>;

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, DeviceError>;

    /// Fails with [`DeviceError::FramebufferIncomplete`] when the attachment
    /// combination is unsupported.
    fn create_render_target(&mut self, desc: &RenderTargetDesc<'_>) -> Result<RenderTargetId, DeviceError>;

    fn destroy_buffer(&mut self, buffer: BufferId);
    fn destroy_mesh(&mut self, mesh: MeshId);
    fn destroy_texture(&mut self, texture: TextureId);
    fn destroy_render_target(&mut self, target: RenderTargetId);

    /// Acquires the surface image for this frame.
    fn begin_frame(&mut self) -> Result<(), DeviceError>;

    /// Starts drawing into `target`, clearing color to `clear` and depth to far.
    fn begin_pass(&mut self, target: RenderTargetId, clear: [f32; 4]) -> Result<(), DeviceError>;

    fn draw_indexed(&mut self, draw: &DrawIndexed) -> Result<(), DeviceError>;

    fn end_pass(&mut self) -> Result<(), DeviceError>;

    /// Downsamples a multisampled target into a single-sample target of equal size.
    fn resolve(&mut self, src: RenderTargetId, dst: RenderTargetId) -> Result<(), DeviceError>;

    /// Copies a single-sample target into `dst` on the presented surface.
    fn blit_to_surface(&mut self, src: RenderTargetId, dst: Viewport) -> Result<(), DeviceError>;

    /// Submits the frame's commands and presents the surface.
    fn present(&mut self) -> Result<(), DeviceError>;

    /// Blocks until every submitted command has executed.
    fn wait_idle(&mut self);

    fn resize_surface(&mut self, width: u32, height: u32);
}
