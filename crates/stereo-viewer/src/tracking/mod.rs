//! Tracked-device poses and the runtime that reports them.

pub mod pose_table;
pub mod provider;

pub use pose_table::{DevicePose, DevicePoseTable, FrameInput, PoseStats};
pub use provider::{SampleTracking, TrackingProvider};

pub const MAX_TRACKED_DEVICES: usize = 64;

/// Device index of the head-mounted display.
pub const HMD_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    #[default]
    Invalid,
    Hmd,
    Controller,
    GenericTracker,
    TrackingReference,
}

impl DeviceClass {
    /// One-character tag used in pose statistics.
    pub fn tag(self) -> char {
        match self {
            DeviceClass::Hmd => 'H',
            DeviceClass::Controller => 'C',
            DeviceClass::GenericTracker => 'G',
            DeviceClass::TrackingReference => 'T',
            DeviceClass::Invalid => '?',
        }
    }
}
