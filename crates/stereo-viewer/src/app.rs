use crate::{
    camera::StereoCamera,
    config::{FramePacing, LoaderConfig},
    model::RenderModelSlots,
    renderer::{DeviceError, GraphicsDevice, StereoFramebufferPipeline},
    tracking::{DevicePoseTable, TrackingProvider},
};
use anyhow::{Context, Result};

/// Ties the tracking runtime, render models and stereo pipeline to one device.
pub struct App<D: GraphicsDevice> {
    gpu: D,
    tracking: Box<dyn TrackingProvider>,
    poses: DevicePoseTable,
    models: RenderModelSlots,
    stereo: StereoFramebufferPipeline,
    camera: StereoCamera,
    loader: LoaderConfig,
    pacing: FramePacing,
    shut_down: bool,
}

impl<D: GraphicsDevice> App<D> {
    /// Creates the eye framebuffers and loads the initial render models.
    /// Framebuffer failure aborts startup.
    pub fn new(
        mut gpu: D,
        tracking: Box<dyn TrackingProvider>,
        loader: LoaderConfig,
        pacing: FramePacing,
        msaa_samples: u32,
    ) -> Result<Self> {
        let mut stereo = StereoFramebufferPipeline::new(msaa_samples);
        stereo
            .setup(&mut gpu)
            .context("creating stereo render targets")?;

        let mut app = Self {
            gpu,
            tracking,
            poses: DevicePoseTable::new(),
            models: RenderModelSlots::new(),
            stereo,
            camera: StereoCamera::sample(),
            loader,
            pacing,
            shut_down: false,
        };
        app.setup_render_models();
        Ok(app)
    }

    pub fn gpu(&self) -> &D {
        &self.gpu
    }

    pub fn poses(&self) -> &DevicePoseTable {
        &self.poses
    }

    pub fn models(&self) -> &RenderModelSlots {
        &self.models
    }

    pub fn loader(&self) -> &LoaderConfig {
        &self.loader
    }

    /// Discards every render model and loads them again with the current loader config.
    pub fn setup_render_models(&mut self) -> usize {
        self.models
            .setup_render_models(&mut self.gpu, self.tracking.as_ref(), &self.loader)
    }

    /// Flips how the auxiliary vertex attribute is declared and reloads the models.
    pub fn toggle_vertex_workaround(&mut self) {
        self.loader = self.loader.with_toggled_aux();
        log::info!("auxiliary vertex attribute: {:?}", self.loader.aux());
        self.setup_render_models();
    }

    /// Polls poses, renders and composites both eyes, then presents.
    ///
    /// Stereo failures are logged and the frame is still presented. Surface
    /// errors are returned so the caller can resize or exit.
    pub fn render_frame(&mut self) -> Result<(), DeviceError> {
        if self.shut_down {
            return Err(DeviceError::InvalidState("render_frame after shutdown".into()));
        }
        let input = self.tracking.poll_poses();
        self.poses.update(&input);

        self.gpu.begin_frame()?;
        if let Err(e) = self
            .stereo
            .render_frame(&mut self.gpu, &self.poses, &self.models, &self.camera)
        {
            log::error!("stereo frame failed: {e}");
        }

        if self.pacing.wait_before_present() {
            self.gpu.wait_idle();
        }
        self.gpu.present()?;
        if self.pacing.wait_after_present() {
            self.gpu.wait_idle();
        }
        Ok(())
    }

    /// Resizes the surface and recreates the eye framebuffers. A zero size
    /// (minimised window) is ignored, and an unchanged size only
    /// reconfigures the surface.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 || self.shut_down {
            return Ok(());
        }
        let unchanged = self.gpu.surface_size() == (width, height);
        self.gpu.resize_surface(width, height);
        if unchanged {
            return Ok(());
        }
        log::debug!("resize to {width}x{height}");
        self.stereo.resize(&mut self.gpu)
    }

    /// Reconfigures a lost or outdated surface at its current size. The eye
    /// framebuffers are kept.
    pub fn recover_surface(&mut self) -> Result<(), DeviceError> {
        let (width, height) = self.gpu.surface_size();
        self.resize(width, height)
    }

    /// Releases every GPU resource. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.gpu.wait_idle();
        self.models.release_all(&mut self.gpu);
        self.stereo.release(&mut self.gpu);
        self.shut_down = true;
        log::info!("shut down");
    }
}
