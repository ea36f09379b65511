//! GPU-side vertex representation for render models.

use rmdl::RenderModelVertex;

/// Per-vertex data uploaded to the vertex buffer.
/// Must match the vertex inputs of the render-model shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuVertex {
    /// Position with w = 1.
    pub position: [f32; 4],
    pub tex_coord: [f32; 2],
    /// Auxiliary attribute value and its pad slot. Always zero for file models.
    pub aux: [u16; 2],
}

impl GpuVertex {
    pub const STRIDE: u64 = std::mem::size_of::<GpuVertex>() as u64;
    pub const TEX_COORD_OFFSET: u64 = 16;
    pub const AUX_OFFSET: u64 = 24;
}

impl From<&RenderModelVertex> for GpuVertex {
    fn from(v: &RenderModelVertex) -> Self {
        Self {
            position: [v.position[0], v.position[1], v.position[2], 1.0],
            tex_coord: v.tex_coord,
            aux: [0, 0],
        }
    }
}

/// How the auxiliary 16-bit attribute is declared to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuxAttribute {
    /// One 16-bit component.
    #[default]
    Single,
    /// Two components spanning the pad slot, so drivers that repack
    /// single-short attributes read it in place.
    Padded,
}

impl AuxAttribute {
    pub fn components(self) -> u8 {
        match self {
            AuxAttribute::Single => 1,
            AuxAttribute::Padded => 2,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            AuxAttribute::Single => AuxAttribute::Padded,
            AuxAttribute::Padded => AuxAttribute::Single,
        }
    }
}

/// Vertex attribute layout chosen at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    pub aux: AuxAttribute,
}
