//! Camera controls using dolly

use dolly::prelude::*;
use glam::{Mat4, Quat, Vec3};

use crate::camera::CameraState;

/// Orbit camera rig for the viewport
pub struct OrbitCamera {
    rig: CameraRig,
    /// Vertical FOV in degrees
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, distance: f32, yaw: f32, pitch: f32) -> Self {
        // No smoothing: every rig step is a real camera move and restarts accumulation.
        let rig = CameraRig::builder()
            .with(YawPitch::new().yaw_degrees(yaw).pitch_degrees(pitch))
            .with(Arm::new(mint::Vector3 { x: 0.0, y: 0.0, z: distance }))
            .with(LookAt::new(mint::Point3 { x: target.x, y: target.y, z: target.z }))
            .build();

        Self {
            rig,
            fov: CameraState::DEFAULT_FOV,
            near: 0.1,
            far: 5000.0,
        }
    }

    /// Orbit around target (drag)
    pub fn orbit(&mut self, delta_x: f32, delta_y: f32) {
        let sensitivity = 0.5;
        self.rig
            .driver_mut::<YawPitch>()
            .rotate_yaw_pitch(-delta_x * sensitivity, -delta_y * sensitivity);
    }

    /// Screen-space pan (middle drag)
    pub fn pan(&mut self, delta_x: f32, delta_y: f32) {
        let right: Vec3 = self.rig.final_transform.right();
        let up: Vec3 = self.rig.final_transform.up();
        let sensitivity = 0.002 * self.distance();
        let offset = right * (-delta_x * sensitivity) + up * (delta_y * sensitivity);

        let look_at = self.rig.driver_mut::<LookAt>();
        look_at.target.x += offset.x;
        look_at.target.y += offset.y;
        look_at.target.z += offset.z;
    }

    /// Zoom (scroll)
    pub fn zoom(&mut self, delta: f32) {
        let current = self.distance();
        let factor = 1.0 - delta * 0.0002 * current.max(1.0);
        self.set_distance(current * factor);
    }

    pub fn distance(&self) -> f32 {
        self.rig.driver::<Arm>().offset.z
    }

    pub fn set_distance(&mut self, dist: f32) {
        self.rig.driver_mut::<Arm>().offset.z = dist.clamp(0.1, 5000.0);
    }

    /// Yaw and pitch in degrees, from the final transform
    pub fn angles(&self) -> (f32, f32) {
        let (yaw, pitch, _) = self.rotation().to_euler(glam::EulerRot::YXZ);
        (yaw.to_degrees(), pitch.to_degrees())
    }

    pub fn update(&mut self, dt: f32) {
        self.rig.update(dt);
    }

    fn rotation(&self) -> Quat {
        let rot = self.rig.final_transform.rotation;
        Quat::from_xyzw(rot.v.x, rot.v.y, rot.v.z, rot.s)
    }

    pub fn position(&self) -> Vec3 {
        let p = self.rig.final_transform.position;
        Vec3::new(p.x, p.y, p.z)
    }

    /// Matrices for the trace kernel at the given aspect ratio.
    pub fn state(&self, aspect: f32) -> CameraState {
        CameraState::new(
            Mat4::from_rotation_translation(self.rotation(), self.position()),
            Mat4::perspective_rh(self.fov.to_radians(), aspect, self.near, self.far),
        )
    }
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, 5.0, 45.0, -30.0)
    }
}
