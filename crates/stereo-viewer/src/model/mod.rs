//! Render models: vertex layout, buffer packing, GPU resources and per-device slots.

pub mod library;
pub mod packer;
pub mod resource;
pub mod vertex;

pub use library::RenderModelSlots;
pub use packer::BufferStrategy;
pub use resource::{RenderModelError, RenderModelResource};
