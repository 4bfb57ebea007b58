//! Flatten the registry into GPU-consumable arrays.
//!
//! Meshes are concatenated into one global vertex array and one global index
//! array. Indices are rewritten to point into the global vertex array, and each
//! mesh descriptor records where its indices start in the global index array.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use smallvec::SmallVec;
use trace_kernel::{INDEX_STRIDE, MESH_OBJECT_STRIDE, SPHERE_STRIDE, VERTEX_STRIDE};

use super::object::{MeshObject, SceneObject, SphereLight, SpherePrimitive};
use super::registry::SceneRegistry;
use crate::util::{energy, BBox3f};

/// Per-mesh record in `_MeshObjects` (104 bytes, matches the kernel layout).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshDescriptor {
    /// Column-major local-to-world matrix.
    pub local_to_world: [[f32; 4]; 4],
    /// First index of this mesh in the global index array.
    pub index_offset: u32,
    pub index_count: u32,
    pub albedo: [f32; 3],
    pub specular: f32,
    pub smoothness: f32,
    pub emission: [f32; 3],
}

/// Per-sphere record in `_Spheres` (56 bytes: 12+4+12+12+12+4).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SphereDescriptor {
    pub position: [f32; 3],
    pub radius: f32,
    pub albedo: [f32; 3],
    pub specular: [f32; 3],
    pub emission: [f32; 3],
    pub smoothness: f32,
}

const _: () = assert!(std::mem::size_of::<Vec3>() == VERTEX_STRIDE);
const _: () = assert!(std::mem::size_of::<u32>() == INDEX_STRIDE);
const _: () = assert!(std::mem::size_of::<MeshDescriptor>() == MESH_OBJECT_STRIDE);
const _: () = assert!(std::mem::size_of::<SphereDescriptor>() == SPHERE_STRIDE);

impl SphereDescriptor {
    /// A light is a pure emitter: no albedo, no specular.
    pub fn from_light(light: &SphereLight) -> Self {
        Self {
            position: light.position.to_array(),
            radius: light.radius,
            albedo: [0.0; 3],
            specular: [0.0; 3],
            emission: (light.color * light.intensity).to_array(),
            smoothness: 1.0,
        }
    }

    pub fn from_primitive(sphere: &SpherePrimitive) -> Self {
        Self {
            position: sphere.position.to_array(),
            radius: sphere.radius,
            albedo: sphere.albedo.to_array(),
            specular: sphere.specular.to_array(),
            emission: sphere.emission.to_array(),
            smoothness: sphere.smoothness,
        }
    }
}

/// Flat arrays produced by one rebuild. Replaced wholesale, never patched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlatSceneBuffers {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub mesh_descriptors: Vec<MeshDescriptor>,
    pub sphere_descriptors: Vec<SphereDescriptor>,
}

impl FlatSceneBuffers {
    pub fn vertices_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn indices_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn mesh_descriptors_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.mesh_descriptors)
    }

    pub fn sphere_descriptors_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.sphere_descriptors)
    }

    pub fn is_empty(&self) -> bool {
        self.mesh_descriptors.is_empty() && self.sphere_descriptors.is_empty()
    }

    /// World-space bounds of all geometry.
    pub fn bounds(&self) -> BBox3f {
        let mut bounds = BBox3f::EMPTY;
        for sphere in &self.sphere_descriptors {
            bounds.expand_by_sphere(Vec3::from(sphere.position), sphere.radius);
        }
        for mesh in &self.mesh_descriptors {
            let transform = glam::Mat4::from_cols_array_2d(&mesh.local_to_world);
            let start = mesh.index_offset as usize;
            let end = start + mesh.index_count as usize;
            for &index in self.indices.get(start..end).unwrap_or_default() {
                if let Some(v) = self.vertices.get(index as usize) {
                    bounds.expand_by_point(transform.transform_point3(*v));
                }
            }
        }
        bounds
    }
}

fn append_mesh(flat: &mut FlatSceneBuffers, mesh: &MeshObject) {
    let first_vertex = flat.vertices.len() as u32;
    let first_index = flat.indices.len() as u32;

    flat.vertices.extend_from_slice(&mesh.vertices);

    // A triangle with any index outside this mesh's vertices is dropped whole;
    // shifting it would land on another mesh's vertices.
    let vertex_count = mesh.vertices.len();
    let mut dropped = 0usize;
    for triangle in mesh.indices.chunks(3) {
        let global: Option<SmallVec<[u32; 3]>> = triangle
            .iter()
            .map(|&i| if (i as usize) < vertex_count { i.checked_add(first_vertex) } else { None })
            .collect();
        match global {
            Some(global) => flat.indices.extend_from_slice(&global),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, vertex_count, "mesh triangles with out-of-range indices dropped");
    }
    let index_count = flat.indices.len() as u32 - first_index;

    let material = &mesh.material;
    flat.mesh_descriptors.push(MeshDescriptor {
        local_to_world: mesh.world_transform.to_cols_array_2d(),
        index_offset: first_index,
        index_count,
        albedo: material.albedo.to_array(),
        specular: energy(material.specular),
        smoothness: material.smoothness,
        emission: (material.emission * material.intensity).to_array(),
    });
}

/// Flatten every active object, in registry order.
///
/// Deterministic: the same registry contents in the same order yield
/// byte-identical buffers.
pub fn build_snapshot(registry: &SceneRegistry) -> FlatSceneBuffers {
    let mut flat = FlatSceneBuffers::default();
    for handle in registry.iter() {
        match handle.object() {
            SceneObject::Mesh(mesh) => append_mesh(&mut flat, mesh),
            SceneObject::Light(light) => flat.sphere_descriptors.push(SphereDescriptor::from_light(light)),
            SceneObject::Sphere(sphere) => {
                flat.sphere_descriptors.push(SphereDescriptor::from_primitive(sphere))
            }
        }
    }
    flat
}

/// Owns the current flat buffers and replaces them on every rebuild.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    current: FlatSceneBuffers,
    generation: u64,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(skip_all, fields(objects = registry.len()))]
    pub fn rebuild(&mut self, registry: &SceneRegistry) -> &FlatSceneBuffers {
        self.current = build_snapshot(registry);
        self.generation += 1;
        tracing::debug!(
            generation = self.generation,
            vertices = self.current.vertices.len(),
            indices = self.current.indices.len(),
            meshes = self.current.mesh_descriptors.len(),
            spheres = self.current.sphere_descriptors.len(),
            "scene snapshot rebuilt"
        );
        &self.current
    }

    pub fn current(&self) -> &FlatSceneBuffers {
        &self.current
    }

    /// Number of rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshMaterial, SceneObjectHandle};
    use glam::Mat4;

    fn triangle(offset: f32) -> MeshObject {
        MeshObject::new(
            vec![
                Vec3::new(offset, 0.0, 0.0),
                Vec3::new(offset + 1.0, 0.0, 0.0),
                Vec3::new(offset, 1.0, 0.0),
            ],
            vec![0, 1, 2],
        )
    }

    #[test]
    fn test_two_triangles_offsets() {
        let mut registry = SceneRegistry::new();
        registry.register(SceneObjectHandle::new(triangle(0.0)));
        registry.register(SceneObjectHandle::new(triangle(5.0)));

        let flat = build_snapshot(&registry);
        assert_eq!(flat.vertices.len(), 6);
        assert_eq!(flat.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(flat.mesh_descriptors[0].index_offset, 0);
        assert_eq!(flat.mesh_descriptors[1].index_offset, 3);
        assert_eq!(flat.mesh_descriptors[1].index_count, 3);
        let b = &flat.mesh_descriptors[1];
        let start = b.index_offset as usize;
        assert_eq!(&flat.indices[start..start + 3], &[3, 4, 5]);
    }

    #[test]
    fn test_offsets_with_uneven_meshes() {
        let quad = MeshObject::new(vec![Vec3::ZERO; 4], vec![0, 1, 2, 0, 2, 3]);
        let tri = triangle(0.0);
        let empty = MeshObject::new(vec![], vec![]);
        let mut registry = SceneRegistry::new();
        for mesh in [quad.clone(), empty, tri.clone(), quad] {
            registry.register(SceneObjectHandle::new(mesh));
        }

        let flat = build_snapshot(&registry);
        let offsets: Vec<u32> = flat.mesh_descriptors.iter().map(|m| m.index_offset).collect();
        let counts: Vec<u32> = flat.mesh_descriptors.iter().map(|m| m.index_count).collect();
        assert_eq!(offsets, vec![0, 6, 6, 9]);
        assert_eq!(counts, vec![6, 0, 3, 6]);
        // Last quad starts at vertex 4 + 0 + 3 = 7.
        assert_eq!(&flat.indices[9..], &[7, 8, 9, 7, 9, 10]);
        assert_eq!(flat.vertices.len(), 11);
    }

    #[test]
    fn test_light_descriptor() {
        let mut registry = SceneRegistry::new();
        registry.register(SceneObjectHandle::new(SphereLight {
            position: Vec3::new(1.0, 2.0, 3.0),
            radius: 0.5,
            intensity: 4.0,
            color: Vec3::new(1.0, 0.5, 0.25),
        }));

        let flat = build_snapshot(&registry);
        assert!(flat.mesh_descriptors.is_empty());
        let s = flat.sphere_descriptors[0];
        assert_eq!(s.position, [1.0, 2.0, 3.0]);
        assert_eq!(s.radius, 0.5);
        assert_eq!(s.emission, [4.0, 2.0, 1.0]);
        assert_eq!(s.specular, [0.0; 3]);
        assert_eq!(s.smoothness, 1.0);
    }

    #[test]
    fn test_mesh_material_and_transform() {
        let transform = Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0));
        let mesh = triangle(0.0).with_transform(transform).with_material(MeshMaterial {
            albedo: Vec3::new(0.1, 0.2, 0.3),
            specular: Vec3::splat(0.5),
            smoothness: 0.9,
            emission: Vec3::ONE,
            intensity: 2.0,
        });
        let mut registry = SceneRegistry::new();
        registry.register(SceneObjectHandle::new(mesh));

        let flat = build_snapshot(&registry);
        let d = flat.mesh_descriptors[0];
        assert_eq!(Mat4::from_cols_array_2d(&d.local_to_world), transform);
        assert_eq!(d.albedo, [0.1, 0.2, 0.3]);
        assert!((d.specular - 0.5).abs() < 1e-6);
        assert_eq!(d.emission, [2.0, 2.0, 2.0]);
        // Vertices stay in local space.
        assert_eq!(flat.vertices[2], Vec3::new(0.0, 1.0, 0.0));
        let bounds = flat.bounds();
        assert_eq!(bounds.max.y, 4.0);
    }

    #[test]
    fn test_rebuild_replaces_wholesale() {
        let mut registry = SceneRegistry::new();
        let a = SceneObjectHandle::new(triangle(0.0));
        registry.register(a.clone());

        let mut builder = SnapshotBuilder::new();
        assert_eq!(builder.rebuild(&registry).vertices.len(), 3);
        registry.unregister(&a);
        assert!(builder.rebuild(&registry).vertices.is_empty());
        assert_eq!(builder.generation(), 2);
    }

    #[test]
    fn test_out_of_range_triangle_is_dropped() {
        // Index 3 is past the first mesh's vertices; shifted it would hit the second mesh.
        let bad = MeshObject::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2, 0, 1, 3]);
        let huge = MeshObject::new(vec![Vec3::Z], vec![0, 0, u32::MAX]);
        let mut registry = SceneRegistry::new();
        registry.register(SceneObjectHandle::new(bad));
        registry.register(SceneObjectHandle::new(triangle(5.0)));
        registry.register(SceneObjectHandle::new(huge));

        let flat = build_snapshot(&registry);
        assert_eq!(flat.indices, vec![0, 1, 2, 3, 4, 5]);
        let counts: Vec<u32> = flat.mesh_descriptors.iter().map(|m| m.index_count).collect();
        let offsets: Vec<u32> = flat.mesh_descriptors.iter().map(|m| m.index_offset).collect();
        assert_eq!(counts, vec![3, 3, 0]);
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(flat.vertices.len(), 7);
    }
}
