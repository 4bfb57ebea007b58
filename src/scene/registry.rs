//! Set of active scene objects with a rebuild-owed flag.

use super::object::SceneObjectHandle;

/// Active scene objects in registration order.
///
/// Owned explicitly by whoever drives the frame loop and passed by reference;
/// a snapshot borrows it shared, so it cannot change mid-pass.
#[derive(Debug, Default)]
pub struct SceneRegistry {
    objects: Vec<SceneObjectHandle>,
    dirty: bool,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to the active set and mark the scene dirty.
    ///
    /// Registering a handle that is already active keeps a single entry.
    pub fn register(&mut self, handle: SceneObjectHandle) {
        if !self.objects.contains(&handle) {
            self.objects.push(handle);
        }
        self.dirty = true;
    }

    /// Remove `handle` if present and mark the scene dirty.
    ///
    /// Returns whether the handle was active. Absent handles are not an error.
    pub fn unregister(&mut self, handle: &SceneObjectHandle) -> bool {
        let removed = match self.objects.iter().position(|h| h == handle) {
            Some(index) => {
                self.objects.remove(index);
                true
            }
            None => false,
        };
        self.dirty = true;
        removed
    }

    /// Remove every object and mark the scene dirty.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.dirty = true;
    }

    /// Read and clear the dirty flag; `true` means a rebuild is owed.
    pub fn consume_dirty_flag(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Force a rebuild on the next frame without changing the active set.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneObjectHandle> {
        self.objects.iter()
    }

    pub fn contains(&self, handle: &SceneObjectHandle) -> bool {
        self.objects.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshObject, SphereLight};
    use glam::Vec3;

    fn light() -> SceneObjectHandle {
        SceneObjectHandle::new(SphereLight {
            position: Vec3::Y,
            radius: 1.0,
            intensity: 5.0,
            color: Vec3::ONE,
        })
    }

    #[test]
    fn test_register_marks_dirty() {
        let mut registry = SceneRegistry::new();
        assert!(!registry.consume_dirty_flag());

        registry.register(light());
        assert!(registry.is_dirty());
        assert!(registry.consume_dirty_flag());
        assert!(!registry.consume_dirty_flag(), "flag is cleared on read");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut registry = SceneRegistry::new();
        let a = light();
        registry.register(a.clone());
        registry.consume_dirty_flag();

        assert!(!registry.unregister(&light()));
        assert_eq!(registry.len(), 1);
        assert!(registry.consume_dirty_flag());

        assert!(registry.unregister(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_keeps_order_and_dedups() {
        let mut registry = SceneRegistry::new();
        let a = SceneObjectHandle::new(MeshObject::new(vec![], vec![]));
        let b = light();
        let c = SceneObjectHandle::new(MeshObject::new(vec![Vec3::ZERO], vec![0]));
        registry.register(a.clone());
        registry.register(b.clone());
        registry.register(a.clone());
        registry.register(c.clone());

        let order: Vec<_> = registry.iter().cloned().collect();
        assert_eq!(order, vec![a.clone(), b.clone(), c.clone()]);

        registry.unregister(&b);
        let order: Vec<_> = registry.iter().cloned().collect();
        assert_eq!(order, vec![a, c]);
    }
}
