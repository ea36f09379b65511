use crate::model::packer::BufferStrategy;
use crate::model::vertex::{AuxAttribute, VertexLayout};
use clap::Parser;
use std::path::PathBuf;

/// `stereo-viewer` - renders tracked-device models into two eye views.
///
/// Each eye is drawn into its own multisampled framebuffer, resolved, and
/// composited side by side into the window.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Settings {
    /// Enable graphics API validation and debug labels.
    #[arg(long, env = "STEREO_GPU_DEBUG")]
    pub gpu_debug: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Log warnings and errors only.
    #[arg(long)]
    pub quiet: bool,

    /// Present without waiting for vertical blank.
    #[arg(long, env = "STEREO_NO_VBLANK")]
    pub no_vblank: bool,

    /// Skip the full device wait before presenting.
    ///
    /// With vsync on, the viewer normally blocks until all rendering has
    /// finished before it presents, which avoids two frames landing around
    /// one vblank.
    #[arg(long)]
    pub no_finish_hack: bool,

    /// Directory searched for `<name>.model` files.
    #[arg(long, env = "STEREO_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// Fill fixed-size vertex and index buffers with repeated model copies.
    #[arg(long)]
    pub tiled_buffers: bool,

    /// Sample count of the eye framebuffers.
    #[arg(long, default_value_t = 4)]
    pub msaa_samples: u32,

    /// Initial window width in pixels.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value_t = 720)]
    pub height: u32,
}

impl Settings {
    /// Log filter used when RUST_LOG is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig {
            buffer_strategy: if self.tiled_buffers {
                BufferStrategy::REFERENCE_TILED
            } else {
                BufferStrategy::Exact
            },
            vertex_layout: VertexLayout::default(),
            model_dir: self.model_dir.clone(),
        }
    }

    pub fn pacing(&self) -> FramePacing {
        FramePacing {
            vblank: !self.no_vblank,
            finish_hack: !self.no_finish_hack,
        }
    }
}

/// Immutable inputs of render-model loading. Changing any of them means
/// building a new config and re-running model setup.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub buffer_strategy: BufferStrategy,
    pub vertex_layout: VertexLayout,
    pub model_dir: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            buffer_strategy: BufferStrategy::Exact,
            vertex_layout: VertexLayout::default(),
            model_dir: PathBuf::from("models"),
        }
    }
}

impl LoaderConfig {
    /// Same config with the auxiliary attribute declared the other way.
    pub fn with_toggled_aux(&self) -> Self {
        Self {
            vertex_layout: VertexLayout {
                aux: self.vertex_layout.aux.toggled(),
            },
            ..self.clone()
        }
    }

    pub fn aux(&self) -> AuxAttribute {
        self.vertex_layout.aux
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{name}.model"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacing {
    pub vblank: bool,
    /// Wait for the device to go idle before presenting. Only applies with vblank.
    pub finish_hack: bool,
}

impl FramePacing {
    pub fn wait_before_present(&self) -> bool {
        self.vblank && self.finish_hack
    }

    pub fn wait_after_present(&self) -> bool {
        self.vblank
    }
}
