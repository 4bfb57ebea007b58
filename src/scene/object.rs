//! Caller-owned scene objects and the handles the registry tracks.
//!
//! Objects are immutable once wrapped in a [`SceneObjectHandle`]; editing an
//! object means unregistering its handle and registering a new one.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use glam::{Mat4, Vec3};

/// Surface appearance of a mesh.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshMaterial {
    pub albedo: Vec3,
    pub specular: Vec3,
    pub smoothness: f32,
    pub emission: Vec3,
    /// Multiplier applied to `emission`.
    pub intensity: f32,
}

impl Default for MeshMaterial {
    fn default() -> Self {
        Self {
            albedo: Vec3::splat(0.8),
            specular: Vec3::splat(0.04),
            smoothness: 0.2,
            emission: Vec3::ZERO,
            intensity: 1.0,
        }
    }
}

impl MeshMaterial {
    /// Matte surface with a small dielectric highlight.
    pub fn diffuse(albedo: Vec3) -> Self {
        Self {
            albedo,
            ..Default::default()
        }
    }

    /// Emissive surface.
    pub fn emissive(color: Vec3, intensity: f32) -> Self {
        Self {
            albedo: Vec3::ZERO,
            specular: Vec3::ZERO,
            smoothness: 0.0,
            emission: color,
            intensity,
        }
    }
}

/// Triangle mesh in local space. `indices` reference `vertices` of this mesh only.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshObject {
    pub world_transform: Mat4,
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub material: MeshMaterial,
}

impl MeshObject {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self {
            world_transform: Mat4::IDENTITY,
            vertices,
            indices,
            material: MeshMaterial::default(),
        }
    }

    pub fn with_transform(mut self, world_transform: Mat4) -> Self {
        self.world_transform = world_transform;
        self
    }

    pub fn with_material(mut self, material: MeshMaterial) -> Self {
        self.material = material;
        self
    }
}

/// Emissive sphere light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SphereLight {
    pub position: Vec3,
    pub radius: f32,
    pub intensity: f32,
    pub color: Vec3,
}

/// Sphere with a full material, as produced by scene generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpherePrimitive {
    pub position: Vec3,
    pub radius: f32,
    pub albedo: Vec3,
    pub specular: Vec3,
    pub emission: Vec3,
    pub smoothness: f32,
}

/// Anything the registry can hold.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneObject {
    Mesh(MeshObject),
    Light(SphereLight),
    Sphere(SpherePrimitive),
}

impl SceneObject {
    pub fn is_light(&self) -> bool {
        matches!(self, SceneObject::Light(_))
    }

    pub fn as_mesh(&self) -> Option<&MeshObject> {
        match self {
            SceneObject::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }
}

impl From<MeshObject> for SceneObject {
    fn from(mesh: MeshObject) -> Self {
        SceneObject::Mesh(mesh)
    }
}

impl From<SphereLight> for SceneObject {
    fn from(light: SphereLight) -> Self {
        SceneObject::Light(light)
    }
}

impl From<SpherePrimitive> for SceneObject {
    fn from(sphere: SpherePrimitive) -> Self {
        SceneObject::Sphere(sphere)
    }
}

/// Shared reference to a caller-owned scene object.
///
/// Equality is identity: two handles are equal only if they point at the same
/// allocation, so registering equal-looking objects twice keeps both.
#[derive(Clone)]
pub struct SceneObjectHandle(Arc<SceneObject>);

impl SceneObjectHandle {
    pub fn new(object: impl Into<SceneObject>) -> Self {
        Self(Arc::new(object.into()))
    }

    pub fn object(&self) -> &SceneObject {
        &self.0
    }
}

impl Deref for SceneObjectHandle {
    type Target = SceneObject;

    fn deref(&self) -> &SceneObject {
        &self.0
    }
}

impl PartialEq for SceneObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SceneObjectHandle {}

impl fmt::Debug for SceneObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.object() {
            SceneObject::Mesh(_) => "Mesh",
            SceneObject::Light(_) => "Light",
            SceneObject::Sphere(_) => "Sphere",
        };
        write!(f, "SceneObjectHandle({kind} @ {:p})", Arc::as_ptr(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_identity() {
        let light = SphereLight {
            position: Vec3::ZERO,
            radius: 1.0,
            intensity: 2.0,
            color: Vec3::ONE,
        };
        let a = SceneObjectHandle::new(light);
        let b = SceneObjectHandle::new(light);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.is_light());
        assert!(a.as_mesh().is_none());
    }
}
