//! Scene authoring helpers: random sphere fields, the default light, simple meshes.
//!
//! These produce objects for the registry; they never touch the flat buffers.

use std::f32::consts::TAU;

use glam::{Mat4, Vec2, Vec3};
use rand::Rng;

use super::object::{MeshMaterial, MeshObject, SceneObjectHandle, SphereLight, SpherePrimitive};
use crate::settings::SceneSettings;
use crate::util::hsv_to_rgb;

/// Chance that a generated sphere is metallic.
const METAL_CHANCE: f32 = 0.3;
/// Chance that a generated sphere glows.
const EMISSIVE_CHANCE: f32 = 0.3;
const EMISSION_SCALE: f32 = 3.0;
/// Specular reflectance of non-metals.
const DIELECTRIC_SPECULAR: f32 = 0.04;

fn inside_unit_circle<R: Rng + ?Sized>(rng: &mut R) -> Vec2 {
    let r = rng.gen::<f32>().sqrt();
    let theta = rng.gen::<f32>() * TAU;
    Vec2::new(r * theta.cos(), r * theta.sin())
}

/// Scatter up to `num_spheres` non-overlapping spheres resting on the ground plane.
///
/// Each attempt that overlaps an accepted sphere is dropped, so the result can
/// hold fewer spheres than requested.
pub fn random_spheres<R: Rng + ?Sized>(rng: &mut R, scene: &SceneSettings) -> Vec<SpherePrimitive> {
    let [min_radius, max_radius] = scene.sphere_radius;
    let mut spheres: Vec<SpherePrimitive> = Vec::with_capacity(scene.num_spheres as usize);

    for _ in 0..scene.num_spheres {
        let radius = min_radius + rng.gen::<f32>() * (max_radius - min_radius);
        let p = inside_unit_circle(rng) * scene.placement_radius;
        let position = Vec3::new(p.x, radius, p.y);

        let overlaps = spheres.iter().any(|other| {
            let min_dist = radius + other.radius;
            position.distance_squared(other.position) < min_dist * min_dist
        });
        if overlaps {
            continue;
        }

        let color = hsv_to_rgb(rng.gen(), rng.gen(), rng.gen());
        let metal = rng.gen::<f32>() < METAL_CHANCE;
        let emissive = rng.gen::<f32>() < EMISSIVE_CHANCE;
        spheres.push(SpherePrimitive {
            position,
            radius,
            albedo: if metal { Vec3::ZERO } else { color },
            specular: if metal { color } else { Vec3::splat(DIELECTRIC_SPECULAR) },
            emission: if emissive { color * EMISSION_SCALE } else { Vec3::ZERO },
            smoothness: rng.gen(),
        });
    }

    spheres
}

/// Single sphere light described by the scene settings.
pub fn default_light(scene: &SceneSettings) -> SphereLight {
    SphereLight {
        position: Vec3::from(scene.light_position),
        radius: scene.light_radius,
        intensity: scene.light_intensity,
        color: Vec3::from(scene.light_color),
    }
}

/// Square ground quad of edge `size` at y = 0, facing up.
pub fn ground_plane(size: f32, material: MeshMaterial) -> MeshObject {
    let h = size * 0.5;
    MeshObject::new(
        vec![
            Vec3::new(-h, 0.0, -h),
            Vec3::new(h, 0.0, -h),
            Vec3::new(h, 0.0, h),
            Vec3::new(-h, 0.0, h),
        ],
        vec![0, 2, 1, 0, 3, 2],
    )
    .with_material(material)
}

/// Axis-aligned box centered at `center` with the given half extents.
pub fn cuboid(center: Vec3, half_extents: Vec3, material: MeshMaterial) -> MeshObject {
    let corners: Vec<Vec3> = (0..8)
        .map(|i| {
            Vec3::new(
                if i & 1 == 0 { -1.0 } else { 1.0 },
                if i & 2 == 0 { -1.0 } else { 1.0 },
                if i & 4 == 0 { -1.0 } else { 1.0 },
            )
        })
        .collect();
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 3, 6, 7, // +y
        0, 4, 2, 2, 4, 6, // -x
        1, 3, 5, 3, 7, 5, // +x
    ];
    MeshObject::new(corners, indices)
        .with_transform(Mat4::from_translation(center) * Mat4::from_scale(half_extents))
        .with_material(material)
}

/// Ground, a random sphere field and the default light, ready to register.
pub fn demo_scene<R: Rng + ?Sized>(rng: &mut R, scene: &SceneSettings) -> Vec<SceneObjectHandle> {
    let mut objects = vec![SceneObjectHandle::new(ground_plane(
        scene.ground_size,
        MeshMaterial::diffuse(Vec3::splat(0.6)),
    ))];
    objects.extend(random_spheres(rng, scene).into_iter().map(SceneObjectHandle::new));
    objects.push(SceneObjectHandle::new(default_light(scene)));
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_spheres_do_not_overlap() {
        let mut rng = StdRng::seed_from_u64(7);
        let scene = SceneSettings {
            num_spheres: 200,
            ..Default::default()
        };
        let spheres = random_spheres(&mut rng, &scene);
        assert!(!spheres.is_empty());
        assert!(spheres.len() <= 200);

        for (i, a) in spheres.iter().enumerate() {
            assert!(a.radius >= scene.sphere_radius[0] && a.radius <= scene.sphere_radius[1]);
            assert_eq!(a.position.y, a.radius, "spheres rest on the ground");
            let flat = Vec2::new(a.position.x, a.position.z);
            assert!(flat.length() <= scene.placement_radius + 1e-3);
            for b in &spheres[i + 1..] {
                let min_dist = a.radius + b.radius;
                assert!(a.position.distance_squared(b.position) >= min_dist * min_dist);
            }
        }
    }

    #[test]
    fn test_random_spheres_deterministic_for_seed() {
        let scene = SceneSettings::default();
        let a = random_spheres(&mut StdRng::seed_from_u64(42), &scene);
        let b = random_spheres(&mut StdRng::seed_from_u64(42), &scene);
        assert_eq!(a, b);
    }

    #[test]
    fn test_metal_or_dielectric() {
        let mut rng = StdRng::seed_from_u64(3);
        for s in random_spheres(&mut rng, &SceneSettings::default()) {
            let metal = s.albedo == Vec3::ZERO;
            if !metal {
                assert_eq!(s.specular, Vec3::splat(DIELECTRIC_SPECULAR));
            }
            assert!((0.0..1.0).contains(&s.smoothness));
        }
    }

    #[test]
    fn test_cuboid_shape() {
        let mesh = cuboid(Vec3::ZERO, Vec3::ONE, MeshMaterial::default());
        assert_eq!(mesh.vertices.len(), 8);
        assert_eq!(mesh.indices.len(), 36);
        assert!(mesh.indices.iter().all(|&i| i < 8));
    }

    #[test]
    fn test_demo_scene_has_light() {
        let mut rng = StdRng::seed_from_u64(1);
        let objects = demo_scene(&mut rng, &SceneSettings::default());
        assert!(objects.iter().any(|o| o.is_light()));
        assert!(objects[0].as_mesh().is_some());
    }
}
