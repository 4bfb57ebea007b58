//! Progressive accumulation: two image targets and the running-mean sample counter.
//!
//! `begin_frame` decides targets and resets; `blend_and_advance` folds one raw
//! sample into the converged image. Keeping them apart lets a caller skip a frame
//! (minimized window, failed dispatch) without touching the sample count.

use crate::gpu::{GpuBackend, ImageId};
use crate::util::{Error, Result};

/// Accumulation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulationPhase {
    /// Sample count is 0; targets may need to be (re)created.
    Stale,
    /// Targets match the viewport; blends advance the sample count.
    Accumulating,
}

/// The raw-sample and converged images at render resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccumulationTargets {
    /// Written by the trace kernel (`Result`).
    pub raw: ImageId,
    pub converged: ImageId,
    pub width: u32,
    pub height: u32,
}

/// What triggered the most recent reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetReason {
    Viewport,
    Scene,
    Camera,
    /// Targets were released; the converged image is gone.
    Released,
}

#[derive(Debug)]
pub struct ProgressiveAccumulator {
    phase: AccumulationPhase,
    sample_count: u64,
    viewport: (u32, u32),
    targets: Option<AccumulationTargets>,
    last_reset: Option<ResetReason>,
}

impl Default for ProgressiveAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressiveAccumulator {
    pub fn new() -> Self {
        Self {
            phase: AccumulationPhase::Stale,
            sample_count: 0,
            viewport: (0, 0),
            targets: None,
            last_reset: None,
        }
    }

    pub fn phase(&self) -> AccumulationPhase {
        self.phase
    }

    /// Raw samples folded into the converged image since the last reset.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn targets(&self) -> Option<AccumulationTargets> {
        self.targets
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn last_reset(&self) -> Option<ResetReason> {
        self.last_reset
    }

    fn reset(&mut self, reason: ResetReason) {
        if self.sample_count > 0 || self.phase == AccumulationPhase::Accumulating {
            tracing::debug!(?reason, samples = self.sample_count, "accumulation reset");
        }
        self.phase = AccumulationPhase::Stale;
        self.sample_count = 0;
        self.last_reset = Some(reason);
    }

    pub fn notify_viewport_changed(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        self.reset(ResetReason::Viewport);
    }

    pub fn notify_scene_changed(&mut self) {
        self.reset(ResetReason::Scene);
    }

    pub fn notify_camera_changed(&mut self) {
        self.reset(ResetReason::Camera);
    }

    /// Make sure both targets exist at `width` × `height`.
    ///
    /// A viewport different from the last one counts as a viewport change. Targets
    /// are recreated when missing or sized differently; a stale accumulator with
    /// matching targets keeps them, since the first blend after a reset overwrites
    /// the converged image outright. On allocation failure the accumulator stays
    /// stale with no targets, and the next call retries.
    pub fn begin_frame<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::other(format!("cannot render a {width}x{height} viewport")));
        }
        if self.viewport != (width, height) {
            self.notify_viewport_changed(width, height);
        }

        let matches = self.targets.is_some_and(|t| (t.width, t.height) == (width, height));
        if !matches {
            self.drop_targets(backend);
            let raw = backend.create_image(trace_kernel::bindings::RESULT, width, height)?;
            let converged = match backend.create_image("converged", width, height) {
                Ok(id) => id,
                Err(err) => {
                    backend.release_image(raw);
                    return Err(err);
                }
            };
            self.targets = Some(AccumulationTargets {
                raw,
                converged,
                width,
                height,
            });
            tracing::info!(width, height, "accumulation targets created");
        }

        self.phase = AccumulationPhase::Accumulating;
        Ok(())
    }

    /// Fold the raw target into the converged target and count the sample.
    ///
    /// The new sample gets weight `1 / (n + 1)`, so after N blends the converged
    /// image is the arithmetic mean of the N raw samples. The count only advances
    /// if the blend succeeded.
    pub fn blend_and_advance<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<u64> {
        let targets = match (self.phase, self.targets) {
            (AccumulationPhase::Accumulating, Some(targets)) => targets,
            _ => return Err(Error::TargetsNotReady),
        };
        backend.blend(targets.raw, targets.converged, self.sample_count)?;
        self.sample_count += 1;
        Ok(self.sample_count)
    }

    /// Drop both targets and go stale; the next `begin_frame` recreates them.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        self.drop_targets(backend);
        self.reset(ResetReason::Released);
    }

    fn drop_targets<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(targets) = self.targets.take() {
            backend.release_image(targets.raw);
            backend.release_image(targets.converged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;

    fn fill(backend: &mut HeadlessBackend, acc: &ProgressiveAccumulator, color: [f32; 4]) {
        let targets = acc.targets().unwrap();
        let texels = vec![color; (targets.width * targets.height) as usize];
        backend.write_image(targets.raw, &texels).unwrap();
    }

    fn converged(backend: &HeadlessBackend, acc: &ProgressiveAccumulator) -> Vec<[f32; 4]> {
        backend.image_pixels(acc.targets().unwrap().converged).unwrap().to_vec()
    }

    #[test]
    fn test_four_identical_frames() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        for _ in 0..4 {
            acc.begin_frame(&mut backend, 4, 3).unwrap();
            fill(&mut backend, &acc, [1.0, 0.0, 0.0, 1.0]);
            acc.blend_and_advance(&mut backend).unwrap();
        }
        assert_eq!(acc.sample_count(), 4);
        assert!(converged(&backend, &acc).iter().all(|p| *p == [1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_running_mean() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        let samples = [0.3f32, 1.7, 0.0, 4.25, 2.5, 0.125, 9.0];
        for v in samples {
            acc.begin_frame(&mut backend, 2, 2).unwrap();
            fill(&mut backend, &acc, [v, 2.0 * v, 0.0, 1.0]);
            acc.blend_and_advance(&mut backend).unwrap();
        }
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        for p in converged(&backend, &acc) {
            assert!((p[0] - mean).abs() < 1e-5, "{} vs {mean}", p[0]);
            assert!((p[1] - 2.0 * mean).abs() < 1e-5);
        }
    }

    #[test]
    fn test_camera_change_after_ten_frames() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        for i in 0..10 {
            acc.begin_frame(&mut backend, 2, 2).unwrap();
            fill(&mut backend, &acc, [i as f32, 0.0, 0.0, 1.0]);
            acc.blend_and_advance(&mut backend).unwrap();
        }
        assert_eq!(acc.sample_count(), 10);

        acc.notify_camera_changed();
        assert_eq!(acc.phase(), AccumulationPhase::Stale);
        assert_eq!(acc.sample_count(), 0);

        acc.begin_frame(&mut backend, 2, 2).unwrap();
        fill(&mut backend, &acc, [0.5, 0.25, 0.125, 1.0]);
        acc.blend_and_advance(&mut backend).unwrap();
        assert_eq!(acc.sample_count(), 1);
        assert!(converged(&backend, &acc).iter().all(|p| *p == [0.5, 0.25, 0.125, 1.0]));
    }

    #[test]
    fn test_only_notifications_reset() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        for _ in 0..3 {
            acc.begin_frame(&mut backend, 8, 8).unwrap();
            acc.blend_and_advance(&mut backend).unwrap();
        }
        // Same viewport again: no reset, same targets.
        let targets = acc.targets();
        acc.begin_frame(&mut backend, 8, 8).unwrap();
        assert_eq!(acc.sample_count(), 3);
        assert_eq!(acc.targets(), targets);

        acc.notify_scene_changed();
        assert_eq!(acc.sample_count(), 0);
        assert_eq!(acc.last_reset(), Some(ResetReason::Scene));
    }

    #[test]
    fn test_viewport_change_recreates_targets() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        acc.begin_frame(&mut backend, 8, 8).unwrap();
        acc.blend_and_advance(&mut backend).unwrap();
        let old = acc.targets().unwrap();

        acc.begin_frame(&mut backend, 16, 9).unwrap();
        let new = acc.targets().unwrap();
        assert_eq!(acc.sample_count(), 0);
        assert_eq!(acc.last_reset(), Some(ResetReason::Viewport));
        assert_eq!((new.width, new.height), (16, 9));
        assert_ne!(new.raw, old.raw);
        assert_eq!(backend.image_size(new.converged), Some((16, 9)));
        assert_eq!(backend.image_size(old.converged), None);
        assert_eq!(backend.live_images(), 2);
    }

    #[test]
    fn test_blend_before_begin_frame() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        assert!(matches!(acc.blend_and_advance(&mut backend), Err(Error::TargetsNotReady)));

        acc.begin_frame(&mut backend, 2, 2).unwrap();
        acc.notify_camera_changed();
        assert!(matches!(acc.blend_and_advance(&mut backend), Err(Error::TargetsNotReady)));
        assert_eq!(acc.sample_count(), 0);
    }

    #[test]
    fn test_target_allocation_failure_retries() {
        // Room for one 4x4 RGBA32F image (256 bytes) but not two.
        let mut backend = HeadlessBackend::new().with_memory_limit(300);
        let mut acc = ProgressiveAccumulator::new();
        let err = acc.begin_frame(&mut backend, 4, 4).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
        assert_eq!(acc.phase(), AccumulationPhase::Stale);
        assert!(acc.targets().is_none());
        assert_eq!(backend.live_images(), 0);

        backend.set_memory_limit(None);
        acc.begin_frame(&mut backend, 4, 4).unwrap();
        assert_eq!(acc.phase(), AccumulationPhase::Accumulating);
    }

    #[test]
    fn test_zero_viewport_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        assert!(acc.begin_frame(&mut backend, 0, 10).is_err());
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_release_restarts_the_mean() {
        let mut backend = HeadlessBackend::new();
        let mut acc = ProgressiveAccumulator::new();
        for _ in 0..3 {
            acc.begin_frame(&mut backend, 2, 2).unwrap();
            fill(&mut backend, &acc, [1.0; 4]);
            acc.blend_and_advance(&mut backend).unwrap();
        }
        acc.release(&mut backend);
        assert_eq!(acc.phase(), AccumulationPhase::Stale);
        assert_eq!(acc.sample_count(), 0);
        assert_eq!(acc.last_reset(), Some(ResetReason::Released));
        assert_eq!(backend.live_images(), 0);

        acc.begin_frame(&mut backend, 2, 2).unwrap();
        fill(&mut backend, &acc, [4.0; 4]);
        assert_eq!(acc.blend_and_advance(&mut backend).unwrap(), 1);
        assert!(converged(&backend, &acc).iter().all(|p| *p == [4.0; 4]));
    }
}
