//! End-to-end runs of the render loop with the CPU reference tracer.

use glam::Vec3;
use progressive_tracer::gpu::{CpuTracer, SkyModel};
use progressive_tracer::prelude::*;
use progressive_tracer::scene::generate::demo_scene;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn tracer_with_sky(sky: Vec3, render: RenderSettings) -> RenderLoop<HeadlessBackend> {
    let backend = HeadlessBackend::new().with_kernel(CpuTracer::with_sky(SkyModel::Constant(sky)));
    RenderLoop::new(backend, render)
}

fn seeded(seed: u64) -> RenderSettings {
    RenderSettings {
        seed: Some(seed),
        ..Default::default()
    }
}

fn converged(tracer: &RenderLoop<HeadlessBackend>) -> Vec<[f32; 4]> {
    let targets = tracer.accumulator().targets().expect("targets");
    tracer.backend().image_pixels(targets.converged).expect("converged image").to_vec()
}

fn close(a: [f32; 4], b: [f32; 4]) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
}

#[test]
fn test_empty_scene_converges_to_sky() {
    let render = RenderSettings {
        sky_brightness: 2.0,
        ..seeded(1)
    };
    let mut tracer = tracer_with_sky(Vec3::new(0.1, 0.2, 0.3), render);
    let input = FrameInput::new(6, 4, CameraState::default());
    for _ in 0..3 {
        tracer.run_frame(&input);
    }
    assert_eq!(tracer.sample_count(), 3);
    assert!(converged(&tracer).iter().all(|p| close(*p, [0.2, 0.4, 0.6, 1.0])));
}

#[test]
fn test_light_filling_view_is_its_emission() {
    let mut tracer = tracer_with_sky(Vec3::ZERO, seeded(2));
    // Camera at z=5; a radius-4 light covers the whole 60° frustum.
    tracer.registry_mut().register(SceneObjectHandle::new(SphereLight {
        position: Vec3::ZERO,
        radius: 4.0,
        intensity: 2.0,
        color: Vec3::new(1.0, 0.5, 0.25),
    }));
    let input = FrameInput::new(8, 8, CameraState::default());
    for _ in 0..5 {
        tracer.run_frame(&input);
    }
    assert_eq!(tracer.sample_count(), 5);
    assert!(converged(&tracer).iter().all(|p| close(*p, [2.0, 1.0, 0.5, 1.0])));
}

#[test]
fn test_removing_an_object_resets_to_sky() {
    let mut tracer = tracer_with_sky(Vec3::splat(0.5), seeded(3));
    let light = SceneObjectHandle::new(SphereLight {
        position: Vec3::ZERO,
        radius: 4.0,
        intensity: 1.0,
        color: Vec3::new(3.0, 3.0, 3.0),
    });
    tracer.registry_mut().register(light.clone());
    let input = FrameInput::new(4, 4, CameraState::default());
    tracer.run_frame(&input);
    tracer.run_frame(&input);
    assert!(converged(&tracer).iter().all(|p| close(*p, [3.0, 3.0, 3.0, 1.0])));

    assert!(tracer.registry_mut().unregister(&light));
    assert_eq!(tracer.run_frame(&input), FrameOutcome::Rendered { sample_count: 1 });
    assert!(tracer.synchronizer().bindings().spheres.is_none());
    // No ghost of the removed light survives the reset.
    assert!(converged(&tracer).iter().all(|p| close(*p, [0.5, 0.5, 0.5, 1.0])));
}

#[test]
fn test_emissive_mesh_through_flat_buffers() {
    let mut tracer = tracer_with_sky(Vec3::ZERO, seeded(4));
    // A big triangle at z = -1 in front of a camera at z = 5, placed by its transform.
    let wall = MeshObject::new(
        vec![
            Vec3::new(-100.0, -100.0, 0.0),
            Vec3::new(100.0, -100.0, 0.0),
            Vec3::new(0.0, 100.0, 0.0),
        ],
        vec![0, 1, 2],
    )
    .with_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0)))
    .with_material(MeshMaterial::emissive(Vec3::new(0.25, 0.5, 1.0), 4.0));
    // A mesh registered first shifts the wall's indices; an offset bug would lose the wall.
    tracer.registry_mut().register(SceneObjectHandle::new(MeshObject::new(
        vec![Vec3::new(100.0, 100.0, 100.0); 3],
        vec![0, 1, 2],
    )));
    tracer.registry_mut().register(SceneObjectHandle::new(wall));

    let input = FrameInput::new(6, 6, CameraState::default());
    for _ in 0..3 {
        tracer.run_frame(&input);
    }
    assert_eq!(tracer.synchronizer().bindings().mesh_count(), 2);
    assert!(converged(&tracer).iter().all(|p| close(*p, [1.0, 2.0, 4.0, 1.0])));
}

#[test]
fn test_demo_scene_is_reproducible() {
    let render = || {
        let scene = SceneSettings {
            num_spheres: 20,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut tracer = RenderLoop::new(HeadlessBackend::new(), seeded(11));
        for object in demo_scene(&mut rng, &scene) {
            tracer.registry_mut().register(object);
        }
        let camera = CameraState::orbit(Vec3::ZERO, 160.0, 45.0, -25.0, 1.5);
        let input = FrameInput::new(24, 16, camera);
        for _ in 0..6 {
            assert!(tracer.run_frame(&input).is_rendered());
        }
        converged(&tracer)
    };

    let a = render();
    let b = render();
    assert_eq!(a, b);
    assert!(a.iter().flatten().all(|c| c.is_finite() && *c >= 0.0));
}
