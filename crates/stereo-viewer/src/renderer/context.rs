use anyhow::{anyhow, Result};
use std::sync::Arc;
use winit::window::Window;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions {
    /// Turn on backend validation and debug labels.
    pub debug: bool,
    /// Present on vertical blank.
    pub vblank: bool,
}

/// Window surface, adapter, device and queue.
pub struct GfxContext {
    pub surface: wgpu::Surface<'static>,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
    pub size: winit::dpi::PhysicalSize<u32>,
}

impl GfxContext {
    /// Creates a new graphics context bound to the given window.
    pub async fn new(window: Arc<Window>, options: ContextOptions) -> Result<Self> {
        let size = window.inner_size();
        let flags = if options.debug {
            wgpu::InstanceFlags::debugging()
        } else {
            wgpu::InstanceFlags::from_build_config()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            flags,
            ..Default::default()
        });

        // The surface must outlive the window; `Arc` guarantees this.
        let surface = instance.create_surface(window.clone())?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| anyhow!("Failed to find a suitable GPU adapter."))?;
        let info = adapter.get_info();
        log::info!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: required_limits(&adapter.limits()),
                },
                None,
            )
            .await?;
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| log::error!("uncaptured GPU error: {e}")));

        // The eye images are plain RGBA8; avoid an sRGB re-encode on the way out.
        let caps = surface.get_capabilities(&adapter);
        let surface_format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no formats"))?;

        let present_mode = if options.vblank {
            wgpu::PresentMode::Fifo
        } else if caps.present_modes.contains(&wgpu::PresentMode::Immediate) {
            wgpu::PresentMode::Immediate
        } else {
            wgpu::PresentMode::AutoNoVsync
        };
        log::info!("surface {surface_format:?}, {present_mode:?}");

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            surface,
            adapter,
            device,
            queue,
            config,
            size,
        })
    }

    /// Resizes the swap chain when the window size changes.
    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }
}

/// Default limits raised to the adapter's texture and buffer sizes.
/// Tiled model buffers need the adapter's real buffer size limit.
fn required_limits(adapter: &wgpu::Limits) -> wgpu::Limits {
    wgpu::Limits {
        max_buffer_size: adapter.max_buffer_size,
        ..wgpu::Limits::default().using_resolution(adapter.clone())
    }
}
