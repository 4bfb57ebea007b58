//! Device side: the backend seam, buffer slots and the scene buffer synchronizer.
//!
//! ## Data flow
//! ```text
//! FlatSceneBuffers → BufferSynchronizer (4 × BufferSlot) → SceneBindings → GpuBackend::dispatch
//! ```

mod backend;
mod headless;
mod slot;
mod sync;
#[cfg(feature = "gpu")]
mod wgpu_backend;

pub use backend::{BoundBuffer, BufferId, DispatchJob, GpuBackend, ImageId, SceneBindings};
pub use headless::{CpuTracer, HeadlessBackend, HeadlessStats, HostDispatch, HostKernel, SkyModel};
pub use slot::{BufferSlot, SlotKind, SlotState};
pub use sync::{BufferSynchronizer, SyncReport};
#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;
