//! Entry point for the stereo render-model viewer.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use stereo_viewer::{
    app::App,
    config::Settings,
    renderer::{
        context::{ContextOptions, GfxContext},
        DeviceError, WgpuDevice,
    },
    tracking::SampleTracking,
};
use winit::{
    event::{ElementState, Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

fn main() -> Result<()> {
    let settings = Settings::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.default_log_filter()),
    )
    .init();

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("Stereo Render Models")
            .with_inner_size(winit::dpi::LogicalSize::new(settings.width, settings.height))
            .build(&event_loop)?,
    );

    let pacing = settings.pacing();
    let ctx = pollster::block_on(GfxContext::new(
        window.clone(),
        ContextOptions {
            debug: settings.gpu_debug,
            vblank: pacing.vblank,
        },
    ))?;
    let gpu = WgpuDevice::new(ctx)?;
    let mut app = App::new(
        gpu,
        Box::new(SampleTracking::new()),
        settings.loader(),
        pacing,
        settings.msaa_samples,
    )?;

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::KeyboardInput { event, .. } => match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape | KeyCode::KeyQ) => elwt.exit(),
                    PhysicalKey::Code(KeyCode::KeyR) if event.state == ElementState::Released => {
                        app.toggle_vertex_workaround();
                    }
                    _ => {}
                },
                WindowEvent::Resized(size) => {
                    if let Err(e) = app.resize(size.width, size.height) {
                        log::error!("resize failed: {e}");
                        elwt.exit();
                    }
                }
                WindowEvent::RedrawRequested => match app.render_frame() {
                    Ok(()) => {}
                    Err(DeviceError::SurfaceLost) => {
                        if let Err(e) = app.recover_surface() {
                            log::error!("surface recovery failed: {e}");
                            elwt.exit();
                        }
                    }
                    Err(e) => log::error!("render error: {e}"),
                },
                _ => {}
            },
            Event::AboutToWait => {
                window.request_redraw();
            }
            Event::LoopExiting => app.shutdown(),
            _ => {}
        }
    })?;

    Ok(())
}
