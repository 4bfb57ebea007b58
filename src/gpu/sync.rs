//! Mirror the flat scene arrays into the four structured buffers.

use smallvec::SmallVec;

use super::backend::{GpuBackend, SceneBindings};
use super::slot::{BufferSlot, SlotKind};
use crate::scene::FlatSceneBuffers;
use crate::util::Error;

/// Outcome of one sync pass. Slots are independent: a failure in one never
/// stops the others from syncing.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Slots whose allocation or upload failed; worth retrying.
    pub failures: SmallVec<[(SlotKind, Error); 4]>,
    /// Slots whose kernel binding could not be resolved; left untouched.
    pub unresolved: SmallVec<[SlotKind; 4]>,
}

impl SyncReport {
    /// No slot needs a retry.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, kind: SlotKind) -> bool {
        self.failures.iter().any(|(k, _)| *k == kind)
    }
}

/// Owns the `_Vertices`, `_Indices`, `_MeshObjects` and `_Spheres` slots.
#[derive(Debug)]
pub struct BufferSynchronizer {
    vertices: BufferSlot,
    indices: BufferSlot,
    mesh_objects: BufferSlot,
    spheres: BufferSlot,
}

impl Default for BufferSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSynchronizer {
    pub fn new() -> Self {
        Self {
            vertices: BufferSlot::new(SlotKind::Vertices),
            indices: BufferSlot::new(SlotKind::Indices),
            mesh_objects: BufferSlot::new(SlotKind::MeshObjects),
            spheres: BufferSlot::new(SlotKind::Spheres),
        }
    }

    pub fn slot(&self, kind: SlotKind) -> &BufferSlot {
        match kind {
            SlotKind::Vertices => &self.vertices,
            SlotKind::Indices => &self.indices,
            SlotKind::MeshObjects => &self.mesh_objects,
            SlotKind::Spheres => &self.spheres,
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut BufferSlot {
        match kind {
            SlotKind::Vertices => &mut self.vertices,
            SlotKind::Indices => &mut self.indices,
            SlotKind::MeshObjects => &mut self.mesh_objects,
            SlotKind::Spheres => &mut self.spheres,
        }
    }

    /// Sync all four slots from a freshly built snapshot.
    #[tracing::instrument(skip_all, fields(
        vertices = flat.vertices.len(),
        indices = flat.indices.len(),
        meshes = flat.mesh_descriptors.len(),
        spheres = flat.sphere_descriptors.len(),
    ))]
    pub fn sync_scene<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        flat: &FlatSceneBuffers,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for kind in SlotKind::ALL {
            if let Err(err) = backend.binding_slot(kind.binding_name()) {
                tracing::warn!(slot = kind.binding_name(), %err, "kernel binding unresolved, skipping");
                report.unresolved.push(kind);
                continue;
            }
            let bytes = match kind {
                SlotKind::Vertices => flat.vertices_bytes(),
                SlotKind::Indices => flat.indices_bytes(),
                SlotKind::MeshObjects => flat.mesh_descriptors_bytes(),
                SlotKind::Spheres => flat.sphere_descriptors_bytes(),
            };
            if let Err(err) = self.slot_mut(kind).sync(backend, bytes, kind.stride()) {
                tracing::warn!(slot = kind.binding_name(), %err, "buffer sync failed, binding skipped");
                report.failures.push((kind, err));
            }
        }
        report
    }

    /// Buffers to bind for the next dispatch.
    pub fn bindings(&self) -> SceneBindings {
        SceneBindings {
            vertices: self.vertices.binding(),
            indices: self.indices.binding(),
            mesh_objects: self.mesh_objects.binding(),
            spheres: self.spheres.binding(),
        }
    }

    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for kind in SlotKind::ALL {
            self.slot_mut(kind).release(backend);
        }
    }
}
