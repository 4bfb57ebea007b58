//! Camera matrices handed to the kernel, and per-frame change detection.

use glam::{Mat4, Vec3};

/// Camera as the trace kernel sees it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    pub camera_to_world: Mat4,
    /// Clip-from-view, depth in [0, 1].
    pub projection: Mat4,
}

impl Default for CameraState {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0)
    }
}

impl CameraState {
    /// Field of view used by [`CameraState::look_at`], degrees.
    pub const DEFAULT_FOV: f32 = 60.0;

    pub fn new(camera_to_world: Mat4, projection: Mat4) -> Self {
        Self {
            camera_to_world,
            projection,
        }
    }

    /// Perspective camera at `eye` looking at `target`, Y up.
    pub fn look_at(eye: Vec3, target: Vec3, aspect: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        Self {
            camera_to_world: view.inverse(),
            projection: Mat4::perspective_rh(Self::DEFAULT_FOV.to_radians(), aspect, 0.1, 1000.0),
        }
    }

    /// Camera on a sphere around `target`. Yaw 0 looks down -Z; negative pitch looks down.
    pub fn orbit(target: Vec3, distance: f32, yaw_deg: f32, pitch_deg: f32, aspect: f32) -> Self {
        let rotation = glam::Quat::from_euler(glam::EulerRot::YXZ, yaw_deg.to_radians(), pitch_deg.to_radians(), 0.0);
        let eye = target + rotation * Vec3::new(0.0, 0.0, distance);
        Self::look_at(eye, target, aspect)
    }

    pub fn inverse_projection(&self) -> Mat4 {
        self.projection.inverse()
    }

    pub fn position(&self) -> Vec3 {
        self.camera_to_world.w_axis.truncate()
    }
}

/// Remembers last frame's camera and reports whether it moved.
#[derive(Debug, Clone)]
pub struct CameraTracker {
    last: Option<CameraState>,
    epsilon: f32,
}

impl Default for CameraTracker {
    fn default() -> Self {
        Self::new(1e-6)
    }
}

impl CameraTracker {
    pub fn new(epsilon: f32) -> Self {
        Self { last: None, epsilon }
    }

    /// True on the first call and whenever either matrix moved by more than epsilon.
    pub fn update(&mut self, camera: &CameraState) -> bool {
        let changed = match &self.last {
            None => true,
            Some(last) => {
                !last.camera_to_world.abs_diff_eq(camera.camera_to_world, self.epsilon)
                    || !last.projection.abs_diff_eq(camera.projection, self.epsilon)
            }
        };
        if changed {
            self.last = Some(*camera);
        }
        changed
    }

    /// Forget the last camera so the next `update` reports a change.
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_reports_motion() {
        let mut tracker = CameraTracker::default();
        let camera = CameraState::look_at(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, 1.5);
        assert!(tracker.update(&camera));
        assert!(!tracker.update(&camera));

        let moved = CameraState::look_at(Vec3::new(0.1, 1.0, 5.0), Vec3::ZERO, 1.5);
        assert!(tracker.update(&moved));
        assert!(!tracker.update(&moved));

        let wider = CameraState::look_at(Vec3::new(0.1, 1.0, 5.0), Vec3::ZERO, 2.0);
        assert!(tracker.update(&wider));

        tracker.invalidate();
        assert!(tracker.update(&wider));
    }

    #[test]
    fn test_orbit_distance_and_height() {
        let camera = CameraState::orbit(Vec3::ZERO, 10.0, 45.0, -30.0, 1.0);
        assert!((camera.position().length() - 10.0).abs() < 1e-4);
        assert!(camera.position().y > 0.0, "negative pitch looks down from above");
    }

    #[test]
    fn test_look_at_position() {
        let camera = CameraState::look_at(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, 1.0);
        assert!(camera.position().abs_diff_eq(Vec3::new(1.0, 2.0, 3.0), 1e-5));
        let forward = camera.camera_to_world.transform_vector3(-Vec3::Z);
        assert!(forward.abs_diff_eq(-Vec3::new(1.0, 2.0, 3.0).normalize(), 1e-5));
    }
}
