//! Per-frame driver: scene sync, resets, dispatch, blend, present.

use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trace_kernel::{dispatch_groups, KernelUniforms};

use crate::accumulator::ProgressiveAccumulator;
use crate::camera::CameraState;
use crate::gpu::{BufferSynchronizer, DispatchJob, GpuBackend, SceneBindings};
use crate::scene::{FlatSceneBuffers, SceneRegistry, SnapshotBuilder};
use crate::settings::RenderSettings;
use crate::util::ErrorCategory;

/// What the host reports each frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameInput {
    pub width: u32,
    pub height: u32,
    pub camera: CameraState,
    /// Camera or a light moved since the previous frame.
    pub camera_changed: bool,
}

impl FrameInput {
    pub fn new(width: u32, height: u32, camera: CameraState) -> Self {
        Self {
            width,
            height,
            camera,
            camera_changed: false,
        }
    }

    pub fn with_camera_changed(mut self, changed: bool) -> Self {
        self.camera_changed = changed;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Zero-area viewport (minimized window).
    EmptyViewport,
    /// Image targets could not be allocated.
    TargetsUnavailable,
    DispatchFailed,
    BlendFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered { sample_count: u64 },
    /// Nothing was accumulated; the sample count is unchanged.
    Skipped(SkipReason),
}

impl FrameOutcome {
    pub fn is_rendered(&self) -> bool {
        matches!(self, FrameOutcome::Rendered { .. })
    }
}

fn frame_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Owns the registry, snapshot, buffer slots and accumulator for one backend.
#[derive(Debug)]
pub struct RenderLoop<B: GpuBackend> {
    backend: B,
    registry: SceneRegistry,
    snapshot: SnapshotBuilder,
    sync: BufferSynchronizer,
    accumulator: ProgressiveAccumulator,
    render: RenderSettings,
    rng: StdRng,
    /// A slot failed last sync and should be retried.
    resync_pending: bool,
    frames: u64,
}

impl<B: GpuBackend> RenderLoop<B> {
    pub fn new(backend: B, render: RenderSettings) -> Self {
        let render = render.sanitized();
        let rng = frame_rng(render.seed);
        Self {
            backend,
            registry: SceneRegistry::new(),
            snapshot: SnapshotBuilder::new(),
            sync: BufferSynchronizer::new(),
            accumulator: ProgressiveAccumulator::new(),
            render,
            rng,
            resync_pending: false,
            frames: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn registry(&self) -> &SceneRegistry {
        &self.registry
    }

    /// Scene edits go here; they are picked up at the start of the next frame.
    pub fn registry_mut(&mut self) -> &mut SceneRegistry {
        &mut self.registry
    }

    pub fn accumulator(&self) -> &ProgressiveAccumulator {
        &self.accumulator
    }

    pub fn synchronizer(&self) -> &BufferSynchronizer {
        &self.sync
    }

    pub fn snapshot(&self) -> &FlatSceneBuffers {
        self.snapshot.current()
    }

    pub fn render_settings(&self) -> &RenderSettings {
        &self.render
    }

    pub fn sample_count(&self) -> u64 {
        self.accumulator.sample_count()
    }

    /// Frames attempted so far, rendered or skipped.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Appearance uniforms are part of the image: changing them restarts accumulation.
    /// Values are clamped like settings loaded from disk.
    pub fn set_render_settings(&mut self, render: RenderSettings) {
        let render = render.sanitized();
        let appearance_changed =
            render.sky_brightness != self.render.sky_brightness || render.bounces != self.render.bounces;
        if render.seed != self.render.seed {
            self.rng = frame_rng(render.seed);
        }
        self.render = render;
        if appearance_changed {
            self.accumulator.notify_scene_changed();
        }
    }

    /// Rebuild and resync when owed.
    fn sync_scene(&mut self) {
        if self.registry.consume_dirty_flag() {
            let flat = self.snapshot.rebuild(&self.registry);
            let report = self.sync.sync_scene(&mut self.backend, flat);
            self.resync_pending = !report.is_ok();
            self.accumulator.notify_scene_changed();
        } else if self.resync_pending {
            let report = self.sync.sync_scene(&mut self.backend, self.snapshot.current());
            if report.is_ok() {
                tracing::info!("buffer resync recovered");
                self.resync_pending = false;
                self.accumulator.notify_scene_changed();
            }
        }
    }

    fn uniforms(&mut self, camera: &CameraState, bindings: &SceneBindings) -> KernelUniforms {
        let jitter = Vec2::new(self.rng.gen(), self.rng.gen());
        let seed: f32 = self.rng.gen();
        KernelUniforms {
            sky_brightness: self.render.sky_brightness,
            bounces: self.render.bounces,
            sphere_count: bindings.sphere_count(),
            mesh_count: bindings.mesh_count(),
            ..KernelUniforms::default()
        }
        .with_camera(camera.camera_to_world, camera.inverse_projection())
        .with_jitter(jitter, seed)
    }

    /// Run one frame. Never panics on device failures; a skipped frame leaves
    /// the sample count where it was.
    #[tracing::instrument(skip_all, fields(frame = self.frames, width = input.width, height = input.height))]
    pub fn run_frame(&mut self, input: &FrameInput) -> FrameOutcome {
        self.frames += 1;

        // 1. scene
        self.sync_scene();

        // 2. camera / lights
        if input.camera_changed {
            self.accumulator.notify_camera_changed();
        }

        // 3. targets
        if input.width == 0 || input.height == 0 {
            tracing::trace!("empty viewport, frame skipped");
            return FrameOutcome::Skipped(SkipReason::EmptyViewport);
        }
        if let Err(err) = self.accumulator.begin_frame(&mut self.backend, input.width, input.height) {
            tracing::warn!(%err, "accumulation targets unavailable, frame skipped");
            return FrameOutcome::Skipped(SkipReason::TargetsUnavailable);
        }
        let Some(targets) = self.accumulator.targets() else {
            return FrameOutcome::Skipped(SkipReason::TargetsUnavailable);
        };

        // 4. bindings, 5. uniforms
        let bindings = self.sync.bindings();
        let uniforms = self.uniforms(&input.camera, &bindings);

        // 6. dispatch
        let job = DispatchJob {
            output: targets.raw,
            bindings: &bindings,
            uniforms: &uniforms,
            groups: dispatch_groups(input.width, input.height),
        };
        if let Err(err) = self.backend.dispatch(&job) {
            if err.category() == ErrorCategory::InvariantViolation {
                tracing::error!(%err, "dispatch rejected");
            } else {
                tracing::warn!(%err, "dispatch failed, frame dropped");
            }
            return FrameOutcome::Skipped(SkipReason::DispatchFailed);
        }

        // 7. blend, present
        let sample_count = match self.accumulator.blend_and_advance(&mut self.backend) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%err, "blend failed, frame dropped");
                return FrameOutcome::Skipped(SkipReason::BlendFailed);
            }
        };
        if let Err(err) = self.backend.present(targets.converged) {
            tracing::warn!(%err, "present failed");
        }
        FrameOutcome::Rendered { sample_count }
    }

    /// Release every device resource this loop owns. The next frame re-uploads
    /// the scene and starts a fresh accumulation.
    pub fn release(&mut self) {
        self.sync.release_all(&mut self.backend);
        self.accumulator.release(&mut self.backend);
        self.registry.mark_dirty();
        self.resync_pending = false;
    }

    pub fn into_backend(mut self) -> B {
        self.release();
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessBackend, HostDispatch};
    use crate::scene::{MeshObject, SceneObjectHandle, SphereLight};
    use crate::util::Error;
    use glam::Vec3;

    fn seeded() -> RenderSettings {
        RenderSettings {
            seed: Some(7),
            ..Default::default()
        }
    }

    fn constant_kernel(value: f32) -> HeadlessBackend {
        HeadlessBackend::new().with_kernel_fn(move |_: &HostDispatch<'_>, out: &mut [[f32; 4]]| {
            out.fill([value, 0.0, 0.0, 1.0]);
            Ok(())
        })
    }

    fn input() -> FrameInput {
        FrameInput::new(16, 8, CameraState::default())
    }

    #[test]
    fn test_frames_accumulate() {
        let mut tracer = RenderLoop::new(constant_kernel(1.0), seeded());
        for n in 1..=4 {
            assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: n });
        }
        let targets = tracer.accumulator().targets().unwrap();
        assert_eq!(tracer.backend().presented(), Some(targets.converged));
        let pixels = tracer.backend().image_pixels(targets.converged).unwrap();
        assert!(pixels.iter().all(|p| *p == [1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_scene_edit_resets() {
        let mut tracer = RenderLoop::new(constant_kernel(1.0), seeded());
        tracer.run_frame(&input());
        tracer.run_frame(&input());
        assert_eq!(tracer.sample_count(), 2);

        tracer.registry_mut().register(SceneObjectHandle::new(SphereLight {
            position: Vec3::ZERO,
            radius: 1.0,
            intensity: 1.0,
            color: Vec3::ONE,
        }));
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 1 });
        assert_eq!(tracer.synchronizer().bindings().sphere_count(), 1);
    }

    #[test]
    fn test_camera_change_resets() {
        let mut tracer = RenderLoop::new(constant_kernel(1.0), seeded());
        for _ in 0..3 {
            tracer.run_frame(&input());
        }
        let outcome = tracer.run_frame(&input().with_camera_changed(true));
        assert_eq!(outcome, FrameOutcome::Rendered { sample_count: 1 });
    }

    #[test]
    fn test_empty_viewport_keeps_count() {
        let mut tracer = RenderLoop::new(constant_kernel(1.0), seeded());
        tracer.run_frame(&input());
        tracer.run_frame(&input());
        let minimized = FrameInput::new(0, 0, CameraState::default());
        assert_eq!(tracer.run_frame(&minimized), FrameOutcome::Skipped(SkipReason::EmptyViewport));
        assert_eq!(tracer.sample_count(), 2);
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 3 });
    }

    #[test]
    fn test_dispatch_failure_keeps_count() {
        let mut calls = 0;
        let backend = HeadlessBackend::new().with_kernel_fn(move |_: &HostDispatch<'_>, out: &mut [[f32; 4]]| {
            calls += 1;
            if calls == 3 {
                return Err(Error::Dispatch("device lost".into()));
            }
            out.fill([1.0; 4]);
            Ok(())
        });
        let mut tracer = RenderLoop::new(backend, seeded());
        tracer.run_frame(&input());
        tracer.run_frame(&input());
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Skipped(SkipReason::DispatchFailed));
        assert_eq!(tracer.sample_count(), 2);
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 3 });
    }

    #[test]
    fn test_uniforms_carry_counts_and_settings() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = seen.clone();
        let backend = HeadlessBackend::new().with_kernel_fn(move |d: &HostDispatch<'_>, _: &mut [[f32; 4]]| {
            log.borrow_mut().push(*d.uniforms);
            Ok(())
        });
        let render = RenderSettings {
            sky_brightness: 0.5,
            bounces: 3,
            seed: Some(1),
        };
        let mut tracer = RenderLoop::new(backend, render);
        tracer.registry_mut().register(SceneObjectHandle::new(MeshObject::new(
            vec![Vec3::X, Vec3::Y, Vec3::Z],
            vec![0, 1, 2],
        )));
        tracer.run_frame(&input());
        tracer.run_frame(&input());

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        let u = seen[0];
        assert_eq!(u.sky_brightness, 0.5);
        assert_eq!(u.bounces, 3);
        assert_eq!(u.mesh_count, 1);
        assert_eq!(u.sphere_count, 0);
        assert!(u.pixel_offset.iter().all(|c| (0.0..1.0).contains(c)));
        assert!((0.0..1.0).contains(&u.seed));
        assert_ne!(seen[0].pixel_offset, seen[1].pixel_offset);
    }

    #[test]
    fn test_settings_change_resets() {
        let mut tracer = RenderLoop::new(constant_kernel(1.0), seeded());
        tracer.run_frame(&input());
        tracer.run_frame(&input());
        tracer.set_render_settings(RenderSettings {
            sky_brightness: 3.0,
            ..seeded()
        });
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 1 });
    }

    #[test]
    fn test_failed_slot_is_retried() {
        // Two 16x8 targets (2 × 2048) plus vertices and indices fit; the mesh record does not.
        let backend = constant_kernel(1.0).with_memory_limit(4096 + 36 + 12);
        let mut tracer = RenderLoop::new(backend, seeded());
        assert!(tracer.run_frame(&input()).is_rendered());

        tracer.registry_mut().register(SceneObjectHandle::new(MeshObject::new(
            vec![Vec3::X, Vec3::Y, Vec3::Z],
            vec![0, 1, 2],
        )));
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 1 });
        assert!(tracer.synchronizer().bindings().vertices.is_some());
        assert_eq!(tracer.synchronizer().bindings().mesh_count(), 0);
        // Retry fails again: bindings unchanged, accumulation continues.
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 2 });

        tracer.backend_mut().set_memory_limit(None);
        // Retry succeeds; the image now includes the mesh, so accumulation restarts.
        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 1 });
        assert_eq!(tracer.synchronizer().bindings().mesh_count(), 1);
    }

    #[test]
    fn test_render_after_release() {
        let mut frame = 0;
        let backend = HeadlessBackend::new().with_kernel_fn(move |_: &HostDispatch<'_>, out: &mut [[f32; 4]]| {
            frame += 1;
            let value = if frame > 3 { 4.0 } else { 1.0 };
            out.fill([value, 0.0, 0.0, 1.0]);
            Ok(())
        });
        let mut tracer = RenderLoop::new(backend, seeded());
        tracer.registry_mut().register(SceneObjectHandle::new(MeshObject::new(
            vec![Vec3::X, Vec3::Y, Vec3::Z],
            vec![0, 1, 2],
        )));
        for _ in 0..3 {
            tracer.run_frame(&input());
        }
        tracer.release();
        assert_eq!(tracer.backend().live_buffers(), 0);
        assert_eq!(tracer.backend().live_images(), 0);

        assert_eq!(tracer.run_frame(&input()), FrameOutcome::Rendered { sample_count: 1 });
        assert_eq!(tracer.synchronizer().bindings().mesh_count(), 1);
        let targets = tracer.accumulator().targets().unwrap();
        let pixels = tracer.backend().image_pixels(targets.converged).unwrap();
        assert!(pixels.iter().all(|p| *p == [4.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_render_settings_are_clamped() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = seen.clone();
        let backend = HeadlessBackend::new().with_kernel_fn(move |d: &HostDispatch<'_>, _: &mut [[f32; 4]]| {
            log.borrow_mut().push(d.uniforms.bounces);
            Ok(())
        });
        let mut tracer = RenderLoop::new(
            backend,
            RenderSettings {
                bounces: 0,
                ..seeded()
            },
        );
        assert_eq!(tracer.render_settings().bounces, 1);
        tracer.run_frame(&input());

        tracer.set_render_settings(RenderSettings {
            bounces: 1000,
            sky_brightness: -2.0,
            ..seeded()
        });
        assert_eq!(tracer.render_settings().sky_brightness, 0.0);
        tracer.run_frame(&input());
        assert_eq!(*seen.borrow(), vec![1, crate::settings::MAX_BOUNCES]);
    }

    #[test]
    fn test_seed_change_reseeds() {
        let first_offsets = |seeds: &[u64]| {
            let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
            let log = seen.clone();
            let backend = HeadlessBackend::new().with_kernel_fn(move |d: &HostDispatch<'_>, _: &mut [[f32; 4]]| {
                log.borrow_mut().push(d.uniforms.pixel_offset);
                Ok(())
            });
            let mut tracer = RenderLoop::new(backend, RenderSettings::default());
            for &seed in seeds {
                tracer.set_render_settings(RenderSettings {
                    seed: Some(seed),
                    ..Default::default()
                });
                tracer.run_frame(&input());
            }
            let offsets = seen.borrow().clone();
            offsets
        };
        // A new seed restarts the jitter sequence as if the loop had been built with it.
        let switched = first_offsets(&[5, 9]);
        let fresh = first_offsets(&[9]);
        assert_eq!(switched[1], fresh[0]);
        assert_ne!(switched[0], switched[1]);
    }
}
