use glam::Mat4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

/// Per-eye projection and head-to-eye transforms.
///
/// Matrices use OpenGL clip conventions (depth in `[-1, 1]`); the wgpu backend
/// remaps depth when it builds the shader uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoCamera {
    pub projection: [Mat4; 2],
    pub eye_from_head: [Mat4; 2],
}

impl StereoCamera {
    /// Fixed calibration of the sample headset.
    pub fn sample() -> Self {
        #[rustfmt::skip]
        let projection = [
            Mat4::from_cols_array(&[
                0.757_585_8, 0.0, 0.0, 0.0,
                0.0, 0.681_940_3, 0.0, 0.0,
                -0.056_814_91, 9.852_787e-5, -1.003_344_5, -1.0,
                0.0, 0.0, -0.100_334_45, 0.0,
            ]),
            Mat4::from_cols_array(&[
                0.758_769_3, 0.0, 0.0, 0.0,
                0.0, 0.682_856_5, 0.0, 0.0,
                0.057_051_42, -0.001_013_994_5, -1.003_344_5, -1.0,
                0.0, 0.0, -0.100_334_45, 0.0,
            ]),
        ];
        // Head-to-eye is the inverse of the eye's placement in head space.
        let eye_to_head = [
            Mat4::from_translation(glam::vec3(-0.0312, 0.0, 0.015)),
            Mat4::from_translation(glam::vec3(0.0312, 0.0, 0.015)),
        ];
        Self {
            projection,
            eye_from_head: [eye_to_head[0].inverse(), eye_to_head[1].inverse()],
        }
    }

    /// `projection[eye] * eye_from_head[eye] * hmd_pose`, where `hmd_pose`
    /// maps tracking space into head space.
    pub fn view_projection(&self, eye: Eye, hmd_pose: Mat4) -> Mat4 {
        self.projection[eye.index()] * self.eye_from_head[eye.index()] * hmd_pose
    }
}
