//! Dual-eye offscreen rendering and side-by-side composition.
//!
//! Per frame the pipeline moves through
//! `Ready -> RenderingLeft -> ResolvedLeft -> RenderingRight -> ResolvedRight
//! -> Composited -> Ready`. A call made in the wrong state fails with
//! [`DeviceError::InvalidState`] and leaves the state alone.

use crate::camera::{Eye, StereoCamera};
use crate::model::RenderModelSlots;
use crate::renderer::device::{DeviceError, GraphicsDevice, RenderTargetDesc, RenderTargetId, Viewport};
use crate::tracking::DevicePoseTable;

/// Background of both eye views.
pub const CLEAR_COLOR: [f32; 4] = [0.15, 0.15, 0.18, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    RenderingLeft,
    ResolvedLeft,
    RenderingRight,
    ResolvedRight,
    Composited,
    Released,
}

/// Render target with depth plus the single-sample target it resolves into.
/// With one sample both are the same target and no resolve happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeFramebuffer {
    pub render_target: RenderTargetId,
    pub resolve_target: RenderTargetId,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
}

impl EyeFramebuffer {
    pub fn is_multisampled(&self) -> bool {
        self.render_target != self.resolve_target
    }

    fn destroy<D: GraphicsDevice + ?Sized>(self, gpu: &mut D) {
        if self.is_multisampled() {
            gpu.destroy_render_target(self.resolve_target);
        }
        gpu.destroy_render_target(self.render_target);
    }
}

/// Creates one eye's framebuffer. Nothing is left allocated on failure.
pub fn create_eye_framebuffer<D: GraphicsDevice + ?Sized>(
    gpu: &mut D,
    label: &str,
    width: u32,
    height: u32,
    samples: u32,
) -> Result<EyeFramebuffer, DeviceError> {
    let render_target = gpu.create_render_target(&RenderTargetDesc {
        label: &format!("{label} render"),
        width,
        height,
        samples,
        depth: true,
    })?;

    let resolve_target = if samples > 1 {
        let resolve = gpu.create_render_target(&RenderTargetDesc {
            label: &format!("{label} resolve"),
            width,
            height,
            samples: 1,
            depth: false,
        });
        match resolve {
            Ok(id) => id,
            Err(e) => {
                gpu.destroy_render_target(render_target);
                return Err(e);
            }
        }
    } else {
        render_target
    };

    log::debug!("{label} framebuffer {width}x{height}, {samples} samples");
    Ok(EyeFramebuffer {
        render_target,
        resolve_target,
        width,
        height,
        samples,
    })
}

#[derive(Debug)]
pub struct StereoFramebufferPipeline {
    state: PipelineState,
    samples: u32,
    eyes: Option<[EyeFramebuffer; 2]>,
}

impl StereoFramebufferPipeline {
    pub fn new(samples: u32) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            samples,
            eyes: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn eye(&self, eye: Eye) -> Option<&EyeFramebuffer> {
        self.eyes.as_ref().map(|e| &e[eye.index()])
    }

    fn require(&self, wanted: PipelineState, call: &str) -> Result<(), DeviceError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(DeviceError::InvalidState(format!(
                "{call} needs state {wanted:?}, pipeline is {:?}",
                self.state
            )))
        }
    }

    fn framebuffer(&self, eye: Eye) -> Result<EyeFramebuffer, DeviceError> {
        self.eye(eye)
            .copied()
            .ok_or_else(|| DeviceError::InvalidState("eye framebuffers not created".into()))
    }

    /// Creates both eye framebuffers at half the surface width.
    pub fn setup<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) -> Result<(), DeviceError> {
        self.require(PipelineState::Uninitialized, "setup")?;
        self.eyes = Some(self.create_eyes(gpu)?);
        self.state = PipelineState::Ready;
        Ok(())
    }

    fn create_eyes<D: GraphicsDevice + ?Sized>(&self, gpu: &mut D) -> Result<[EyeFramebuffer; 2], DeviceError> {
        let (width, height) = gpu.surface_size();
        let (eye_width, eye_height) = ((width / 2).max(1), height.max(1));

        let left = create_eye_framebuffer(gpu, "left eye", eye_width, eye_height, self.samples)?;
        match create_eye_framebuffer(gpu, "right eye", eye_width, eye_height, self.samples) {
            Ok(right) => Ok([left, right]),
            Err(e) => {
                left.destroy(gpu);
                Err(e)
            }
        }
    }

    /// Draws every visible device that has a render model into the eye's
    /// render target. Individual draw failures are logged and skipped.
    pub fn render_eye<D: GraphicsDevice + ?Sized>(
        &mut self,
        gpu: &mut D,
        eye: Eye,
        poses: &DevicePoseTable,
        models: &RenderModelSlots,
        camera: &StereoCamera,
    ) -> Result<(), DeviceError> {
        let (from, to) = match eye {
            Eye::Left => (PipelineState::Ready, PipelineState::RenderingLeft),
            Eye::Right => (PipelineState::ResolvedLeft, PipelineState::RenderingRight),
        };
        self.require(from, "render_eye")?;
        let fb = self.framebuffer(eye)?;

        gpu.begin_pass(fb.render_target, CLEAR_COLOR)?;
        let view_projection = camera.view_projection(eye, poses.hmd_pose());
        for pose in poses.visible_devices() {
            let Some(model) = models.get(pose.device_index) else {
                continue;
            };
            if let Err(e) = model.draw(gpu, view_projection * pose.transform) {
                log::warn!("{eye:?} eye: draw of {} for device {} failed: {e}", model.name(), pose.device_index);
            }
        }
        gpu.end_pass()?;

        self.state = to;
        Ok(())
    }

    /// Resolves the eye's samples and copies the result into its half of the surface.
    pub fn resolve_and_composite<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D, eye: Eye) -> Result<(), DeviceError> {
        let (from, resolved, composited) = match eye {
            Eye::Left => (PipelineState::RenderingLeft, PipelineState::ResolvedLeft, PipelineState::ResolvedLeft),
            Eye::Right => (PipelineState::RenderingRight, PipelineState::ResolvedRight, PipelineState::Composited),
        };
        self.require(from, "resolve_and_composite")?;
        let fb = self.framebuffer(eye)?;

        if fb.is_multisampled() {
            gpu.resolve(fb.render_target, fb.resolve_target)?;
        }
        self.state = resolved;

        let x = match eye {
            Eye::Left => 0,
            Eye::Right => fb.width,
        };
        gpu.blit_to_surface(
            fb.resolve_target,
            Viewport {
                x,
                y: 0,
                width: fb.width,
                height: fb.height,
            },
        )?;
        self.state = composited;
        Ok(())
    }

    /// Left render, left composite, right render, right composite. Back to
    /// `Ready` afterwards, also when a step fails.
    pub fn render_frame<D: GraphicsDevice + ?Sized>(
        &mut self,
        gpu: &mut D,
        poses: &DevicePoseTable,
        models: &RenderModelSlots,
        camera: &StereoCamera,
    ) -> Result<(), DeviceError> {
        self.require(PipelineState::Ready, "render_frame")?;

        let result = Eye::BOTH.into_iter().try_for_each(|eye| {
            self.render_eye(gpu, eye, poses, models, camera)?;
            self.resolve_and_composite(gpu, eye)
        });
        self.state = PipelineState::Ready;
        result
    }

    /// Recreates both eye framebuffers for the current surface size.
    pub fn resize<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) -> Result<(), DeviceError> {
        self.require(PipelineState::Ready, "resize")?;
        if let Some(eyes) = self.eyes.take() {
            for fb in eyes {
                fb.destroy(gpu);
            }
        }
        self.state = PipelineState::Uninitialized;
        self.setup(gpu)
    }

    /// Destroys the framebuffers. Further calls are no-ops.
    pub fn release<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) {
        if let Some(eyes) = self.eyes.take() {
            for fb in eyes {
                fb.destroy(gpu);
            }
        }
        self.state = PipelineState::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::model::resource::tests::triangle_model;
    use crate::model::RenderModelResource;
    use crate::renderer::recording::{Command, RecordingDevice};
    use crate::tracking::{DeviceClass, DevicePose, FrameInput};
    use glam::Mat4;

    struct Scene {
        gpu: RecordingDevice,
        pipeline: StereoFramebufferPipeline,
        poses: DevicePoseTable,
        models: RenderModelSlots,
        camera: StereoCamera,
    }

    impl Scene {
        fn new(samples: u32) -> Self {
            let mut gpu = RecordingDevice::new(200, 100);
            let mut pipeline = StereoFramebufferPipeline::new(samples);
            pipeline.setup(&mut gpu).unwrap();

            let mut models = RenderModelSlots::new();
            let model =
                RenderModelResource::load_from_device_model(&mut gpu, "tri", &triangle_model(), &LoaderConfig::default())
                    .unwrap();
            models.assign(&mut gpu, 1, model);

            let mut poses = DevicePoseTable::new();
            poses.update(&FrameInput {
                poses: vec![DevicePose {
                    device_index: 1,
                    transform: Mat4::IDENTITY,
                    visible: true,
                    class: DeviceClass::Controller,
                }],
            });

            Self {
                gpu,
                pipeline,
                poses,
                models,
                camera: StereoCamera::sample(),
            }
        }

        fn frame(&mut self) -> Result<(), DeviceError> {
            self.gpu.begin_frame()?;
            let result = self
                .pipeline
                .render_frame(&mut self.gpu, &self.poses, &self.models, &self.camera);
            self.gpu.present()?;
            result
        }

        fn teardown(mut self) {
            self.models.release_all(&mut self.gpu);
            self.pipeline.release(&mut self.gpu);
            assert_eq!(self.gpu.live_objects(), 0);
        }
    }

    #[test]
    fn setup_creates_half_width_multisampled_eyes() {
        let scene = Scene::new(4);
        for eye in Eye::BOTH {
            let fb = scene.pipeline.eye(eye).unwrap();
            assert_eq!((fb.width, fb.height), (100, 100));
            let render = &scene.gpu.targets[&fb.render_target];
            let resolve = &scene.gpu.targets[&fb.resolve_target];
            assert_eq!((render.samples, render.depth), (4, true));
            assert_eq!((resolve.samples, resolve.depth), (1, false));
        }
        assert_eq!(scene.pipeline.state(), PipelineState::Ready);
        scene.teardown();
    }

    #[test]
    fn both_eyes_resolve_the_same_draw_into_their_halves() {
        let mut scene = Scene::new(4);
        scene.frame().unwrap();

        let left = scene.pipeline.eye(Eye::Left).copied().unwrap();
        let right = scene.pipeline.eye(Eye::Right).copied().unwrap();
        let l = &scene.gpu.targets[&left.resolve_target].contents;
        let r = &scene.gpu.targets[&right.resolve_target].contents;
        assert_eq!(l.len(), 1);
        assert_eq!(r.len(), 1);
        assert_eq!(l[0].mesh, r[0].mesh);
        assert_eq!(l[0].index_count, 3);
        assert_eq!(l[0].mvp, scene.camera.view_projection(Eye::Left, Mat4::IDENTITY));
        assert_eq!(r[0].mvp, scene.camera.view_projection(Eye::Right, Mat4::IDENTITY));

        let surface = &scene.gpu.presented[0];
        assert_eq!(surface.len(), 2);
        assert_eq!(surface[0].0, Viewport { x: 0, y: 0, width: 100, height: 100 });
        assert_eq!(surface[1].0, Viewport { x: 100, y: 0, width: 100, height: 100 });
        assert_eq!(scene.pipeline.state(), PipelineState::Ready);
        scene.teardown();
    }

    #[test]
    fn frame_runs_left_then_right() {
        let mut scene = Scene::new(4);
        let start = scene.gpu.commands.len();
        scene.frame().unwrap();

        let left = scene.pipeline.eye(Eye::Left).copied().unwrap();
        let right = scene.pipeline.eye(Eye::Right).copied().unwrap();
        let kinds: Vec<&Command> = scene.gpu.commands[start..]
            .iter()
            .filter(|c| !matches!(c, Command::Draw(_)))
            .collect();
        assert_eq!(
            kinds,
            vec![
                &Command::BeginFrame,
                &Command::BeginPass { target: left.render_target, clear: CLEAR_COLOR },
                &Command::EndPass,
                &Command::Resolve { src: left.render_target, dst: left.resolve_target },
                &Command::Blit { src: left.resolve_target, dst: Viewport { x: 0, y: 0, width: 100, height: 100 } },
                &Command::BeginPass { target: right.render_target, clear: CLEAR_COLOR },
                &Command::EndPass,
                &Command::Resolve { src: right.render_target, dst: right.resolve_target },
                &Command::Blit { src: right.resolve_target, dst: Viewport { x: 100, y: 0, width: 100, height: 100 } },
                &Command::Present,
            ]
        );
        scene.teardown();
    }

    #[test]
    fn out_of_order_calls_leave_state_unchanged() {
        let mut scene = Scene::new(4);
        scene.gpu.begin_frame().unwrap();

        let err = scene.pipeline.resolve_and_composite(&mut scene.gpu, Eye::Left).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState(_)));
        let err = scene
            .pipeline
            .render_eye(&mut scene.gpu, Eye::Right, &scene.poses, &scene.models, &scene.camera)
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState(_)));
        assert_eq!(scene.pipeline.state(), PipelineState::Ready);

        scene
            .pipeline
            .render_eye(&mut scene.gpu, Eye::Left, &scene.poses, &scene.models, &scene.camera)
            .unwrap();
        assert_eq!(scene.pipeline.state(), PipelineState::RenderingLeft);
        assert!(scene.pipeline.render_eye(&mut scene.gpu, Eye::Left, &scene.poses, &scene.models, &scene.camera).is_err());
        assert_eq!(scene.pipeline.state(), PipelineState::RenderingLeft);
        scene.pipeline.resolve_and_composite(&mut scene.gpu, Eye::Left).unwrap();
        assert_eq!(scene.pipeline.state(), PipelineState::ResolvedLeft);
        scene
            .pipeline
            .render_eye(&mut scene.gpu, Eye::Right, &scene.poses, &scene.models, &scene.camera)
            .unwrap();
        scene.pipeline.resolve_and_composite(&mut scene.gpu, Eye::Right).unwrap();
        assert_eq!(scene.pipeline.state(), PipelineState::Composited);
        scene.gpu.present().unwrap();
        scene.teardown();
    }

    #[test]
    fn failed_draw_does_not_stop_the_frame() {
        let mut scene = Scene::new(4);
        let mut dead =
            RenderModelResource::load_from_device_model(&mut scene.gpu, "dead", &triangle_model(), &LoaderConfig::default())
                .unwrap();
        dead.release(&mut scene.gpu);
        scene.models.assign(&mut scene.gpu, 2, dead);
        scene.poses.update(&FrameInput {
            poses: [1, 2]
                .into_iter()
                .map(|device_index| DevicePose {
                    device_index,
                    transform: Mat4::IDENTITY,
                    visible: true,
                    class: DeviceClass::Controller,
                })
                .collect(),
        });

        scene.frame().unwrap();

        assert_eq!(scene.gpu.draws().len(), 2);
        assert_eq!(scene.gpu.presented[0].len(), 2);
        scene.teardown();
    }

    #[test]
    fn single_sample_eyes_skip_the_resolve() {
        let mut scene = Scene::new(1);
        scene.frame().unwrap();
        assert!(!scene.gpu.commands.iter().any(|c| matches!(c, Command::Resolve { .. })));
        assert_eq!(scene.gpu.presented[0][1].1.len(), 1);
        scene.teardown();
    }

    #[test]
    fn unsupported_sample_count_fails_without_leaking() {
        let mut gpu = RecordingDevice::new(200, 100);
        let mut pipeline = StereoFramebufferPipeline::new(8);

        let err = pipeline.setup(&mut gpu).unwrap_err();

        assert!(matches!(err, DeviceError::FramebufferIncomplete { samples: 8, .. }));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn oversized_eyes_fail_without_leaking() {
        let mut gpu = RecordingDevice::new(200, 100);
        gpu.limits.max_texture_dimension = 64;
        let mut pipeline = StereoFramebufferPipeline::new(4);

        assert!(pipeline.setup(&mut gpu).is_err());
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn failed_resolve_target_destroys_the_render_target() {
        let mut gpu = RecordingDevice::new(200, 100);
        gpu.supported_samples = vec![4];

        let err = create_eye_framebuffer(&mut gpu, "left eye", 100, 100, 4).unwrap_err();

        assert!(matches!(err, DeviceError::FramebufferIncomplete { samples: 1, .. }));
        assert!(gpu.commands.iter().any(|c| matches!(c, Command::DestroyRenderTarget(_))));
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn failed_right_eye_destroys_the_left_eye() {
        let mut gpu = RecordingDevice::new(200, 100);
        gpu.render_target_budget = Some(3);
        let mut pipeline = StereoFramebufferPipeline::new(4);

        let err = pipeline.setup(&mut gpu).unwrap_err();

        assert!(matches!(err, DeviceError::Allocation { ref what, .. } if what == "right eye resolve"));
        let destroyed = gpu
            .commands
            .iter()
            .filter(|c| matches!(c, Command::DestroyRenderTarget(_)))
            .count();
        assert_eq!(destroyed, 3);
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn injected_target_failure_aborts_setup() {
        let mut gpu = RecordingDevice::new(200, 100);
        gpu.fail_on = Some(crate::renderer::recording::FailPoint::RenderTarget);

        assert!(StereoFramebufferPipeline::new(4).setup(&mut gpu).is_err());
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn resize_recreates_framebuffers() {
        let mut scene = Scene::new(4);
        scene.gpu.resize_surface(640, 480);
        scene.pipeline.resize(&mut scene.gpu).unwrap();

        let fb = scene.pipeline.eye(Eye::Right).unwrap();
        assert_eq!((fb.width, fb.height), (320, 480));
        assert_eq!(scene.gpu.targets.len(), 4);
        scene.frame().unwrap();
        assert_eq!(scene.gpu.presented[0][1].0.x, 320);
        scene.teardown();
    }

    #[test]
    fn release_is_terminal() {
        let mut scene = Scene::new(4);
        scene.pipeline.release(&mut scene.gpu);
        scene.pipeline.release(&mut scene.gpu);
        assert_eq!(scene.pipeline.state(), PipelineState::Released);
        assert!(scene.frame().is_err());
        scene.teardown();
    }
}
