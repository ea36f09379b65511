use super::{DeviceClass, DevicePose, FrameInput, HMD_INDEX};
use glam::Mat4;
use rmdl::{RawRenderModel, RenderModelVertex, Texture};

/// Source of device poses and device-reported render models.
pub trait TrackingProvider {
    fn poll_poses(&mut self) -> FrameInput;

    /// Render model name for a device, if it has one.
    fn render_model_name(&self, device_index: usize) -> Option<String>;

    /// Model data the runtime itself holds for `name`.
    fn device_model(&self, name: &str) -> Option<RawRenderModel>;
}

/// Fixed headset and two controllers, standing in for a tracking runtime.
#[derive(Debug, Clone, Default)]
pub struct SampleTracking;

impl SampleTracking {
    pub const CONTROLLER_MODEL: &'static str = "vr_controller_vive_1_5";

    pub fn new() -> Self {
        Self
    }
}

#[rustfmt::skip]
const SAMPLE_POSES: [(DeviceClass, [f32; 16]); 3] = [
    (DeviceClass::Hmd, [
        0.660372, 0.005540, -0.750918, 0.0,
        0.124383, 0.985353, 0.116655, 0.0,
        0.740566, -0.170437, 0.650010, 0.0,
        -0.762210, 0.816847, 0.476603, 1.0,
    ]),
    (DeviceClass::Controller, [
        0.544623, -0.146795, 0.825734, 0.0,
        -0.116081, 0.961893, 0.247564, 0.0,
        -0.830609, -0.230681, 0.506829, 0.0,
        -0.935668, 0.832183, 0.417553, 1.0,
    ]),
    (DeviceClass::Controller, [
        0.869483, 0.196030, 0.453399, 0.0,
        -0.309990, 0.931179, 0.191867, 0.0,
        -0.384584, -0.307374, 0.870412, 0.0,
        -1.001555, 0.838425, 0.263718, 1.0,
    ]),
];

impl TrackingProvider for SampleTracking {
    fn poll_poses(&mut self) -> FrameInput {
        FrameInput {
            poses: SAMPLE_POSES
                .iter()
                .enumerate()
                .map(|(device_index, (class, cols))| DevicePose {
                    device_index,
                    transform: Mat4::from_cols_array(cols),
                    visible: true,
                    class: *class,
                })
                .collect(),
        }
    }

    fn render_model_name(&self, device_index: usize) -> Option<String> {
        (device_index > HMD_INDEX && device_index < SAMPLE_POSES.len())
            .then(|| Self::CONTROLLER_MODEL.to_string())
    }

    fn device_model(&self, name: &str) -> Option<RawRenderModel> {
        (name == Self::CONTROLLER_MODEL).then(|| textured_box([0.03, 0.02, 0.08]))
    }
}

/// Axis-aligned box centred on the origin, four vertices per face and a
/// checkerboard texture.
pub fn textured_box(half_extent: [f32; 3]) -> RawRenderModel {
    let [hx, hy, hz] = half_extent;
    // (normal axis, sign) for each face; the other two axes span the quad.
    let faces: [(usize, f32); 6] = [(0, 1.0), (0, -1.0), (1, 1.0), (1, -1.0), (2, 1.0), (2, -1.0)];
    let h = [hx, hy, hz];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (axis, sign) in faces {
        let u = (axis + 1) % 3;
        let v = (axis + 2) % 3;
        let base = vertices.len() as u16;
        for (du, dv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let mut p = [0.0; 3];
            p[axis] = sign * h[axis];
            p[u] = du * sign * h[u];
            p[v] = dv * h[v];
            vertices.push(RenderModelVertex {
                position: p,
                tex_coord: [(du + 1.0) * 0.5, (dv + 1.0) * 0.5],
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    const SIDE: u16 = 8;
    let rgba = (0..SIDE * SIDE)
        .flat_map(|i| {
            let dark = ((i % SIDE) + (i / SIDE)) % 2 == 0;
            if dark {
                [40, 40, 48, 255]
            } else {
                [200, 200, 210, 255]
            }
        })
        .collect();

    RawRenderModel {
        vertices,
        indices,
        texture: Texture {
            width: SIDE,
            height: SIDE,
            rgba,
        },
    }
}
