//! RMDL: compact render-model files (mesh + diffuse texture) for tracked devices.
//!
//! - Vertices carry a position and a texture coordinate, nothing else.
//! - Indices are a 16-bit triangle list on disk and widened to u32 on load.
//! - The diffuse texture is tightly packed RGBA8.
//!
//! File layout (little-endian, no header, no magic, no version):
//!   u32     vertex_count
//!   ..      vertex_count x { f32 px, f32 py, f32 pz, f32 u, f32 v }
//!   u32     triangle_count
//!   ..      triangle_count * 3 x u16 index
//!   u16     texture_width
//!   u16     texture_height
//!   ..      texture_width * texture_height * 4 bytes RGBA8
//!
//! The format has no way to evolve: a reader cannot tell a future layout from
//! a corrupt file. Keep writers and readers in lockstep.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Bytes per serialized vertex (3 position floats + 2 texcoord floats).
pub const VERTEX_BYTES: usize = 20;

/// One render-model vertex exactly as stored on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RenderModelVertex {
    pub position: [f32; 3],
    pub tex_coord: [f32; 2],
}

/// Diffuse texture, RGBA8, rows tightly packed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Texture {
    pub width: u16,
    pub height: u16,
    pub rgba: Vec<u8>,
}

impl Texture {
    /// Number of bytes a `width x height` RGBA8 image occupies.
    #[inline]
    pub fn expected_len(width: u16, height: u16) -> usize {
        width as usize * height as usize * 4
    }
}

/// A model as a device (or `encode`) sees it: 16-bit triangle-list indices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRenderModel {
    pub vertices: Vec<RenderModelVertex>,
    pub indices: Vec<u16>,
    pub texture: Texture,
}

impl RawRenderModel {
    /// Same model with indices widened to u32, values untouched.
    pub fn widen(&self) -> RenderModelData {
        RenderModelData {
            vertices: self.vertices.clone(),
            indices: self.indices.iter().map(|&i| u32::from(i)).collect(),
            texture: self.texture.clone(),
        }
    }
}

/// A decoded model ready for upload: indices are 32-bit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderModelData {
    pub vertices: Vec<RenderModelVertex>,
    pub indices: Vec<u32>,
    pub texture: Texture,
}

impl RenderModelData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("truncated model: {section} needs {needed} bytes but only {available} remain")]
    Truncated {
        section: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("texture {width}x{height} needs {expected} bytes, found {actual}")]
    TextureSizeMismatch {
        width: u16,
        height: u16,
        expected: usize,
        actual: usize,
    },

    #[error("index {index} at position {position} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        position: usize,
        index: u16,
        vertex_count: usize,
    },

    #[error("{0} indices do not form a triangle list")]
    NotTriangleList(usize),

    #[error("{what} count {count} does not fit in the file format")]
    CountOverflow { what: &'static str, count: usize },
}

impl Error {
    /// True when the failure came from the filesystem rather than the bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize, section: &'static str) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::Truncated {
            section,
            needed: n,
            available: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u16(buf: &mut &[u8], section: &'static str) -> Result<u16> {
    let b = take(buf, 2, section)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8], section: &'static str) -> Result<u32> {
    let b = take(buf, 4, section)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn f32_at(chunk: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
}

fn checked_len(section: &'static str, count: usize, stride: usize) -> Result<usize> {
    count
        .checked_mul(stride)
        .ok_or(Error::CountOverflow { what: section, count })
}

/// Parse a model from a contiguous byte slice. Single source of truth for parsing.
pub fn decode(mut p: &[u8]) -> Result<RenderModelData> {
    let vertex_count = le_u32(&mut p, "vertex count")? as usize;
    let raw = take(
        &mut p,
        checked_len("vertices", vertex_count, VERTEX_BYTES)?,
        "vertices",
    )?;

    let vertices: Vec<RenderModelVertex> = raw
        .chunks_exact(VERTEX_BYTES)
        .map(|c| RenderModelVertex {
            position: [f32_at(c, 0), f32_at(c, 4), f32_at(c, 8)],
            tex_coord: [f32_at(c, 12), f32_at(c, 16)],
        })
        .collect();

    let triangle_count = le_u32(&mut p, "triangle count")? as usize;
    let index_count = checked_len("indices", triangle_count, 3)?;
    let raw = take(&mut p, checked_len("indices", index_count, 2)?, "indices")?;

    let mut indices = Vec::<u32>::with_capacity(index_count);
    for (position, c) in raw.chunks_exact(2).enumerate() {
        let index = u16::from_le_bytes([c[0], c[1]]);
        if index as usize >= vertex_count {
            return Err(Error::IndexOutOfRange {
                position,
                index,
                vertex_count,
            });
        }
        indices.push(u32::from(index));
    }

    let width = le_u16(&mut p, "texture width")?;
    let height = le_u16(&mut p, "texture height")?;
    let expected = Texture::expected_len(width, height);

    // The texture must consume the rest of the stream exactly.
    if p.len() != expected {
        return Err(Error::TextureSizeMismatch {
            width,
            height,
            expected,
            actual: p.len(),
        });
    }

    Ok(RenderModelData {
        vertices,
        indices,
        texture: Texture {
            width,
            height,
            rgba: p.to_vec(),
        },
    })
}

/// Serialize a model into the on-disk layout.
pub fn encode(model: &RawRenderModel) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(model));
    write_to(&mut out, model)?;
    Ok(out)
}

/// Exact byte size `encode` produces for `model`.
pub fn encoded_len(model: &RawRenderModel) -> usize {
    4 + model.vertices.len() * VERTEX_BYTES + 4 + model.indices.len() * 2 + 4 + model.texture.rgba.len()
}

/// Stream a model into any writer.
pub fn write_to<W: Write>(w: &mut W, model: &RawRenderModel) -> Result<()> {
    if model.indices.len() % 3 != 0 {
        return Err(Error::NotTriangleList(model.indices.len()));
    }

    let tex = &model.texture;
    let expected = Texture::expected_len(tex.width, tex.height);
    if tex.rgba.len() != expected {
        return Err(Error::TextureSizeMismatch {
            width: tex.width,
            height: tex.height,
            expected,
            actual: tex.rgba.len(),
        });
    }

    let vertex_count = u32::try_from(model.vertices.len()).map_err(|_| Error::CountOverflow {
        what: "vertices",
        count: model.vertices.len(),
    })?;
    let triangle_count =
        u32::try_from(model.indices.len() / 3).map_err(|_| Error::CountOverflow {
            what: "triangles",
            count: model.indices.len() / 3,
        })?;

    write_u32(w, vertex_count)?;
    write_vertices(w, &model.vertices)?;

    write_u32(w, triangle_count)?;
    for &index in &model.indices {
        write_u16(w, index)?;
    }

    write_u16(w, tex.width)?;
    write_u16(w, tex.height)?;
    w.write_all(&tex.rgba)?;

    Ok(())
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<RenderModelData> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    decode(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<RenderModelData> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

pub fn write_file<P: AsRef<Path>>(path: P, model: &RawRenderModel) -> Result<()> {
    // Encode first so a bad model never leaves a half-written file behind.
    let bytes = encode(model)?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

// The in-memory vertex is the on-disk vertex, so little-endian hosts write the block as is.
const _: () = assert!(std::mem::size_of::<RenderModelVertex>() == VERTEX_BYTES);

#[cfg(target_endian = "little")]
fn write_vertices<W: Write>(w: &mut W, vertices: &[RenderModelVertex]) -> io::Result<()> {
    w.write_all(bytemuck::cast_slice(vertices))
}

#[cfg(not(target_endian = "little"))]
fn write_vertices<W: Write>(w: &mut W, vertices: &[RenderModelVertex]) -> io::Result<()> {
    for v in vertices {
        for f in v.position.iter().chain(v.tex_coord.iter()) {
            w.write_all(&f.to_le_bytes())?;
        }
    }
    Ok(())
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
