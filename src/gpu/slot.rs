//! One GPU buffer per semantic array, with the reuse-or-reallocate policy.

use bytemuck::Pod;
use trace_kernel::{bindings, INDEX_STRIDE, MESH_OBJECT_STRIDE, SPHERE_STRIDE, VERTEX_STRIDE};

use super::backend::{BoundBuffer, BufferId, GpuBackend};
use crate::util::{Error, Result};

/// The four structured buffers the kernel reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Vertices,
    Indices,
    MeshObjects,
    Spheres,
}

impl SlotKind {
    pub const ALL: [SlotKind; 4] = [
        SlotKind::Vertices,
        SlotKind::Indices,
        SlotKind::MeshObjects,
        SlotKind::Spheres,
    ];

    /// Kernel resource name.
    pub fn binding_name(self) -> &'static str {
        match self {
            SlotKind::Vertices => bindings::VERTICES,
            SlotKind::Indices => bindings::INDICES,
            SlotKind::MeshObjects => bindings::MESH_OBJECTS,
            SlotKind::Spheres => bindings::SPHERES,
        }
    }

    /// Element stride in bytes.
    pub fn stride(self) -> usize {
        match self {
            SlotKind::Vertices => VERTEX_STRIDE,
            SlotKind::Indices => INDEX_STRIDE,
            SlotKind::MeshObjects => MESH_OBJECT_STRIDE,
            SlotKind::Spheres => SPHERE_STRIDE,
        }
    }
}

/// Where a slot stands after its last sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Never synced, or released after a failure.
    Unallocated,
    /// Last data was empty: no allocation, binding is skipped.
    Empty,
    /// Holds exactly `capacity` elements of `stride` bytes and they were uploaded.
    Bound {
        id: BufferId,
        capacity: usize,
        stride: usize,
    },
}

/// A buffer slot for one semantic array.
#[derive(Debug)]
pub struct BufferSlot {
    kind: SlotKind,
    state: SlotState,
    allocations: u64,
    reallocations: u64,
}

impl BufferSlot {
    pub fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            state: SlotState::Unallocated,
            allocations: 0,
            reallocations: 0,
        }
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Buffers allocated over the slot's lifetime.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Allocations dropped because count or stride changed.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// The buffer to bind, if any.
    pub fn binding(&self) -> Option<BoundBuffer> {
        match self.state {
            // `sync` never binds more than `u32::MAX` elements.
            SlotState::Bound { id, capacity, .. } => {
                u32::try_from(capacity).ok().map(|count| BoundBuffer { id, count })
            }
            SlotState::Unallocated | SlotState::Empty => None,
        }
    }

    /// Sync typed data using the slot's fixed stride.
    pub fn sync_slice<B, T>(&mut self, backend: &mut B, data: &[T]) -> Result<Option<BoundBuffer>>
    where
        B: GpuBackend + ?Sized,
        T: Pod,
    {
        debug_assert_eq!(std::mem::size_of::<T>(), self.kind.stride());
        self.sync(backend, bytemuck::cast_slice(data), self.kind.stride())
    }

    /// Make the slot hold exactly `data`, reusing the allocation when its shape matches.
    ///
    /// 1. empty data: release, bind nothing
    /// 2. allocated with a different (count, stride): release
    /// 3. unallocated: allocate exactly `count` × `stride`
    /// 4. upload
    ///
    /// A failed allocation or upload leaves the slot unallocated, never half-written.
    pub fn sync<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        data: &[u8],
        stride: usize,
    ) -> Result<Option<BoundBuffer>> {
        let name = self.kind.binding_name();

        if data.is_empty() {
            self.release(backend);
            self.state = SlotState::Empty;
            return Ok(None);
        }

        let count = match element_count(name, data.len(), stride) {
            Ok(count) => count,
            Err(err) => {
                self.release(backend);
                return Err(err);
            }
        };

        if let SlotState::Bound { capacity, stride: held, .. } = self.state {
            if (capacity, held) != (count, stride) {
                tracing::debug!(slot = name, capacity, held, count, stride, "shape changed, reallocating");
                self.release(backend);
                self.reallocations += 1;
            }
        }

        let id = match self.state {
            SlotState::Bound { id, .. } => {
                tracing::trace!(slot = name, count, "reusing buffer");
                id
            }
            SlotState::Unallocated | SlotState::Empty => {
                let id = backend.create_buffer(name, count, stride)?;
                self.allocations += 1;
                self.state = SlotState::Bound {
                    id,
                    capacity: count,
                    stride,
                };
                id
            }
        };

        if let Err(err) = backend.write_buffer(id, data) {
            self.release(backend);
            return Err(err);
        }

        Ok(self.binding())
    }

    /// Drop the allocation, if held.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        if let SlotState::Bound { id, .. } = self.state {
            backend.release_buffer(id);
        }
        self.state = SlotState::Unallocated;
    }
}

/// Whole elements in `len` bytes; the kernel indexes them with `u32`.
fn element_count(name: &str, len: usize, stride: usize) -> Result<usize> {
    if stride == 0 || len % stride != 0 {
        return Err(Error::StrideMismatch {
            slot: name.to_string(),
            expected: stride as u64,
            actual: len as u64,
        });
    }
    let count = len / stride;
    if u32::try_from(count).is_err() {
        return Err(Error::exhausted(name, len as u64));
    }
    Ok(count)
}
