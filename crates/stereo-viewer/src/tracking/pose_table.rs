//! Per-frame table of tracked-device poses.

use super::{DeviceClass, HMD_INDEX, MAX_TRACKED_DEVICES};
use glam::Mat4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevicePose {
    pub device_index: usize,
    /// Device-to-tracking-space transform.
    pub transform: Mat4,
    pub visible: bool,
    pub class: DeviceClass,
}

/// Everything the tracking runtime reported for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInput {
    pub poses: Vec<DevicePose>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoseStats {
    pub valid_pose_count: usize,
    /// One class tag per valid pose, in device index order.
    pub classes: String,
    pub controller_count: usize,
}

impl std::fmt::Display for PoseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PoseCount:{}({}) Controllers:{}",
            self.valid_pose_count, self.classes, self.controller_count
        )
    }
}

#[derive(Debug, Clone)]
pub struct DevicePoseTable {
    poses: Vec<Option<DevicePose>>,
    hmd_pose: Mat4,
    stats: PoseStats,
}

impl Default for DevicePoseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePoseTable {
    pub fn new() -> Self {
        Self {
            poses: vec![None; MAX_TRACKED_DEVICES],
            hmd_pose: Mat4::IDENTITY,
            stats: PoseStats::default(),
        }
    }

    /// Replaces every pose with this frame's input. Nothing from earlier
    /// frames survives.
    pub fn update(&mut self, input: &FrameInput) {
        self.poses.iter_mut().for_each(|p| *p = None);

        for pose in &input.poses {
            let Some(slot) = self.poses.get_mut(pose.device_index) else {
                log::warn!("dropping pose for out-of-range device {}", pose.device_index);
                continue;
            };
            if slot.is_some() {
                log::warn!("duplicate pose for device {}; keeping the last one", pose.device_index);
            }
            *slot = Some(*pose);
        }

        self.hmd_pose = self.poses[HMD_INDEX]
            .map(|p| p.transform.inverse())
            .unwrap_or(Mat4::IDENTITY);

        let valid = self.poses.iter().flatten();
        let stats = PoseStats {
            valid_pose_count: valid.clone().count(),
            classes: valid.clone().map(|p| p.class.tag()).collect(),
            controller_count: valid.filter(|p| p.class == DeviceClass::Controller).count(),
        };
        if stats != self.stats {
            log::info!("{stats}");
        }
        self.stats = stats;
    }

    /// Device transform, if the device is in range and visible this frame.
    pub fn get_pose(&self, device_index: usize) -> Option<Mat4> {
        self.poses
            .get(device_index)
            .copied()
            .flatten()
            .filter(|p| p.visible)
            .map(|p| p.transform)
    }

    /// Visible poses in ascending device index order.
    pub fn visible_devices(&self) -> impl Iterator<Item = &DevicePose> + '_ {
        self.poses.iter().flatten().filter(|p| p.visible)
    }

    pub fn class_of(&self, device_index: usize) -> DeviceClass {
        self.poses
            .get(device_index)
            .copied()
            .flatten()
            .map(|p| p.class)
            .unwrap_or_default()
    }

    /// Tracking-space to head-space transform (inverse of the HMD pose).
    pub fn hmd_pose(&self) -> Mat4 {
        self.hmd_pose
    }

    pub fn stats(&self) -> &PoseStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::vec3;

    fn pose(device_index: usize, x: f32, class: DeviceClass) -> DevicePose {
        DevicePose {
            device_index,
            transform: Mat4::from_translation(vec3(x, 0.0, 0.0)),
            visible: true,
            class,
        }
    }

    #[test]
    fn second_update_leaves_no_residue() {
        let mut table = DevicePoseTable::new();
        table.update(&FrameInput {
            poses: vec![
                pose(0, 1.0, DeviceClass::Hmd),
                pose(1, 2.0, DeviceClass::Controller),
                pose(5, 3.0, DeviceClass::GenericTracker),
            ],
        });
        table.update(&FrameInput {
            poses: vec![pose(2, 4.0, DeviceClass::Controller)],
        });

        assert_eq!(table.get_pose(0), None);
        assert_eq!(table.get_pose(1), None);
        assert_eq!(table.get_pose(5), None);
        assert_eq!(table.class_of(5), DeviceClass::Invalid);
        assert_eq!(table.hmd_pose(), Mat4::IDENTITY);
        assert_eq!(table.stats().classes, "C");
        assert_eq!(table.visible_devices().count(), 1);
    }

    #[test]
    fn stats_follow_device_index_order() {
        let mut table = DevicePoseTable::new();
        table.update(&FrameInput {
            poses: vec![
                pose(2, 0.0, DeviceClass::Controller),
                pose(0, 0.0, DeviceClass::Hmd),
                pose(1, 0.0, DeviceClass::Controller),
            ],
        });

        assert_eq!(table.stats().to_string(), "PoseCount:3(HCC) Controllers:2");
        let order: Vec<usize> = table.visible_devices().map(|p| p.device_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn hmd_pose_is_inverse_of_device_zero() {
        let mut table = DevicePoseTable::new();
        table.update(&FrameInput {
            poses: vec![pose(0, 1.5, DeviceClass::Hmd)],
        });
        assert!(table
            .hmd_pose()
            .abs_diff_eq(Mat4::from_translation(vec3(-1.5, 0.0, 0.0)), 1e-6));
    }

    #[test]
    fn invisible_and_out_of_range_poses_are_not_returned() {
        let mut table = DevicePoseTable::new();
        let mut hidden = pose(3, 0.0, DeviceClass::GenericTracker);
        hidden.visible = false;
        table.update(&FrameInput {
            poses: vec![hidden, pose(MAX_TRACKED_DEVICES, 0.0, DeviceClass::Controller)],
        });

        assert_eq!(table.get_pose(3), None);
        assert_eq!(table.class_of(3), DeviceClass::GenericTracker);
        assert_eq!(table.get_pose(MAX_TRACKED_DEVICES), None);
        assert_eq!(table.stats().valid_pose_count, 1);
        assert_eq!(table.visible_devices().count(), 0);
    }

    #[test]
    fn duplicate_index_keeps_last_entry() {
        let mut table = DevicePoseTable::new();
        table.update(&FrameInput {
            poses: vec![pose(1, 1.0, DeviceClass::Controller), pose(1, 9.0, DeviceClass::Controller)],
        });
        assert_eq!(table.get_pose(1), Some(Mat4::from_translation(vec3(9.0, 0.0, 0.0))));
        assert_eq!(table.stats().valid_pose_count, 1);
    }
}
