//! Uniform blocks shared between the host and the WGSL kernels.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};

/// Per-frame parameters of the trace kernel.
///
/// Maps directly to the WGSL `KernelUniforms` struct (160 bytes).
/// Matrices are column-major, as produced by `Mat4::to_cols_array_2d`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct KernelUniforms {
    /// `_CameraToWorld`
    pub camera_to_world: [[f32; 4]; 4],
    /// `_CameraInverseProjection`
    pub camera_inverse_projection: [[f32; 4]; 4],
    /// `_PixelOffset`, sub-pixel jitter in [0, 1)^2
    pub pixel_offset: [f32; 2],
    /// `_Seed`, per-frame random seed in [0, 1)
    pub seed: f32,
    /// `_SkyBrightness`
    pub sky_brightness: f32,
    /// `_Bounces`
    pub bounces: u32,
    /// Number of 56-byte records in `_Spheres` (0 when unbound)
    pub sphere_count: u32,
    /// Number of 104-byte records in `_MeshObjects` (0 when unbound)
    pub mesh_count: u32,
    pub _pad: u32,
}

impl Default for KernelUniforms {
    fn default() -> Self {
        Self {
            camera_to_world: Mat4::IDENTITY.to_cols_array_2d(),
            camera_inverse_projection: Mat4::IDENTITY.to_cols_array_2d(),
            pixel_offset: [0.5, 0.5],
            seed: 0.0,
            sky_brightness: 1.0,
            bounces: 8,
            sphere_count: 0,
            mesh_count: 0,
            _pad: 0,
        }
    }
}

impl KernelUniforms {
    /// Set camera matrices. `inverse_projection` is the inverse of the clip-from-view matrix.
    pub fn with_camera(mut self, camera_to_world: Mat4, inverse_projection: Mat4) -> Self {
        self.camera_to_world = camera_to_world.to_cols_array_2d();
        self.camera_inverse_projection = inverse_projection.to_cols_array_2d();
        self
    }

    /// Set jitter and seed for this frame.
    pub fn with_jitter(mut self, pixel_offset: Vec2, seed: f32) -> Self {
        self.pixel_offset = pixel_offset.to_array();
        self.seed = seed;
        self
    }

    pub fn camera_to_world(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.camera_to_world)
    }

    pub fn camera_inverse_projection(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.camera_inverse_projection)
    }
}

/// Parameters of the accumulation blend (16 bytes).
///
/// `weight` is the share of the new sample: `1 / (sample_count + 1)`.
/// When `sample_count` is 0 the shader copies the raw sample without reading
/// the previous converged value.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlendUniforms {
    pub weight: f32,
    pub sample_count: u32,
    pub _pad: [u32; 2],
}

impl BlendUniforms {
    pub fn new(sample_count: u64) -> Self {
        Self {
            weight: blend_weight(sample_count),
            // Saturates; the weight is already effectively zero long before this.
            sample_count: sample_count.min(u32::MAX as u64) as u32,
            _pad: [0; 2],
        }
    }
}

/// Weight of the newest sample in the running mean after `sample_count` earlier samples.
#[inline]
pub fn blend_weight(sample_count: u64) -> f32 {
    (1.0 / (sample_count as f64 + 1.0)) as f32
}
