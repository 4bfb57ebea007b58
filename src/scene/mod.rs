//! Scene side of the tracer: objects, the active-object registry and the
//! snapshot builder that flattens them for the GPU.
//!
//! ## Data flow
//! ```text
//! register/unregister → SceneRegistry (dirty flag) → build_snapshot → FlatSceneBuffers
//! ```

pub mod generate;
mod object;
mod registry;
mod snapshot;

pub use object::{MeshMaterial, MeshObject, SceneObject, SceneObjectHandle, SphereLight, SpherePrimitive};
pub use registry::SceneRegistry;
pub use snapshot::{build_snapshot, FlatSceneBuffers, MeshDescriptor, SnapshotBuilder, SphereDescriptor};
