//! The device boundary the synchronizer, accumulator and render loop drive.

use std::fmt;

use trace_kernel::{bindings, KernelUniforms};

use crate::util::{Error, Result};

/// Backend-issued structured buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Backend-issued image handle (RGBA32F, random-access writable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// A structured buffer ready to bind, with its element count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundBuffer {
    pub id: BufferId,
    pub count: u32,
}

/// Optional scene buffers for one dispatch. `None` means "do not bind".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SceneBindings {
    pub vertices: Option<BoundBuffer>,
    pub indices: Option<BoundBuffer>,
    pub mesh_objects: Option<BoundBuffer>,
    pub spheres: Option<BoundBuffer>,
}

impl SceneBindings {
    /// Mesh records are only traceable if all three mesh buffers are present.
    pub fn mesh_count(&self) -> u32 {
        match (self.mesh_objects, self.vertices, self.indices) {
            (Some(meshes), Some(_), Some(_)) => meshes.count,
            _ => 0,
        }
    }

    pub fn sphere_count(&self) -> u32 {
        self.spheres.map_or(0, |s| s.count)
    }
}

/// Everything one kernel dispatch needs.
#[derive(Clone, Copy, Debug)]
pub struct DispatchJob<'a> {
    /// Raw-sample target the kernel writes (`Result`).
    pub output: ImageId,
    pub bindings: &'a SceneBindings,
    pub uniforms: &'a KernelUniforms,
    /// Workgroup grid, `[ceil(w/8), ceil(h/8), 1]`.
    pub groups: [u32; 3],
}

/// A device that can hold the scene buffers and image targets and run the kernels.
///
/// Every call is synchronous from the caller's point of view: work submitted by
/// `dispatch` is ordered before work submitted by a later `blend`.
pub trait GpuBackend {
    /// Resolve a kernel resource name to its binding slot.
    fn binding_slot(&self, name: &str) -> Result<u32> {
        bindings::slot_of(name).ok_or_else(|| Error::MissingBinding(name.to_string()))
    }

    /// Allocate `count` elements of `stride` bytes.
    fn create_buffer(&mut self, label: &str, count: usize, stride: usize) -> Result<BufferId>;

    /// Upload the whole buffer at once. `bytes.len()` must equal capacity × stride.
    fn write_buffer(&mut self, id: BufferId, bytes: &[u8]) -> Result<()>;

    fn release_buffer(&mut self, id: BufferId);

    /// Allocate a `width` × `height` RGBA32F image usable as a storage target.
    fn create_image(&mut self, label: &str, width: u32, height: u32) -> Result<ImageId>;

    fn release_image(&mut self, id: ImageId);

    /// Run the trace kernel.
    fn dispatch(&mut self, job: &DispatchJob<'_>) -> Result<()>;

    /// Fold `raw` into `converged` as the running mean after `sample_count` samples.
    /// With `sample_count == 0`, `converged` becomes a copy of `raw`.
    fn blend(&mut self, raw: ImageId, converged: ImageId, sample_count: u64) -> Result<()>;

    /// Hand the converged image to the presentation side.
    fn present(&mut self, image: ImageId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_count_requires_all_mesh_buffers() {
        let bound = |count| Some(BoundBuffer { id: BufferId(1), count });
        let mut bindings = SceneBindings {
            vertices: bound(3),
            indices: bound(3),
            mesh_objects: bound(1),
            spheres: None,
        };
        assert_eq!(bindings.mesh_count(), 1);
        assert_eq!(bindings.sphere_count(), 0);

        bindings.indices = None;
        assert_eq!(bindings.mesh_count(), 0);
    }
}
