//! Math type re-exports and small helpers shared by scene code and the host kernel.

pub use glam::{Mat3, Mat4, Quat, UVec2, Vec2, Vec3, Vec4};

/// Axis-aligned bounding box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox3f {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox3f {
    /// Empty bounding box (inverted, will expand on first point).
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline]
    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Expand to contain a sphere.
    #[inline]
    pub fn expand_by_sphere(&mut self, center: Vec3, radius: f32) {
        self.expand_by_point(center - Vec3::splat(radius));
        self.expand_by_point(center + Vec3::splat(radius));
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Radius of the bounding sphere.
    #[inline]
    pub fn radius(&self) -> f32 {
        (self.max - self.min).length() * 0.5
    }
}

impl Default for BBox3f {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// HSV (all components in [0, 1]) to linear RGB.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Vec3 {
    let h = (h.fract() + 1.0).fract() * 6.0;
    let c = v * s;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    Vec3::new(r + m, g + m, b + m)
}

/// Average of the three channels, used as a sampling probability.
#[inline]
pub fn energy(color: Vec3) -> f32 {
    color.dot(Vec3::splat(1.0 / 3.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_expand() {
        let mut b = BBox3f::EMPTY;
        assert!(b.is_empty());
        b.expand_by_sphere(Vec3::new(0.0, 1.0, 0.0), 1.0);
        assert!(!b.is_empty());
        assert_eq!(b.min, Vec3::new(-1.0, 0.0, -1.0));
        assert_eq!(b.max, Vec3::new(1.0, 2.0, 1.0));
        assert_eq!(b.center(), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_hsv_primaries() {
        assert!((hsv_to_rgb(0.0, 1.0, 1.0) - Vec3::X).length() < 1e-5);
        assert!((hsv_to_rgb(1.0 / 3.0, 1.0, 1.0) - Vec3::Y).length() < 1e-5);
        assert!((hsv_to_rgb(2.0 / 3.0, 1.0, 1.0) - Vec3::Z).length() < 1e-5);
        assert_eq!(hsv_to_rgb(0.5, 0.0, 0.25), Vec3::splat(0.25));
    }
}
