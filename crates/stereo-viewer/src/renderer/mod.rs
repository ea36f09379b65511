pub mod context;
pub mod device;
pub mod stereo;
pub mod wgpu_device;

#[cfg(test)]
pub(crate) mod recording;

pub use device::{DeviceError, GraphicsDevice};
pub use stereo::StereoFramebufferPipeline;
pub use wgpu_device::WgpuDevice;
