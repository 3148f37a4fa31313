//! The target's image store.
//!
//! Dependency resolution never touches the host filesystem directly; every
//! image a mapping may pull in is published to the store first, keyed by an
//! origin path string. Side-by-side redirected origins live under their own
//! keys, so a redirect and the plain dependency name can coexist without
//! shadowing each other.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{Error::DependencyNotFound, Result};

/// Published images available to dependency resolution, keyed by origin.
pub struct ImageStore {
    images: DashMap<String, Arc<Vec<u8>>>,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        ImageStore {
            images: DashMap::new(),
        }
    }

    /// Publish image bytes under `origin`, replacing any previous entry.
    pub fn publish(&self, origin: &str, bytes: Vec<u8>) {
        self.images.insert(origin.to_string(), Arc::new(bytes));
    }

    /// Whether an image is published under `origin`.
    #[must_use]
    pub fn contains(&self, origin: &str) -> bool {
        self.images.contains_key(origin)
    }

    /// Fetch the image published under `origin`.
    ///
    /// # Errors
    /// Returns [`crate::Error::DependencyNotFound`] for an unknown origin.
    pub fn fetch(&self, origin: &str) -> Result<Arc<Vec<u8>>> {
        self.images
            .get(origin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DependencyNotFound {
                dependency: origin.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_fetch() {
        let store = ImageStore::new();
        assert!(!store.contains("dep.lmd"));
        assert!(store.fetch("dep.lmd").is_err());

        store.publish("dep.lmd", vec![1, 2, 3]);
        assert!(store.contains("dep.lmd"));
        assert_eq!(*store.fetch("dep.lmd").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn republish_replaces() {
        let store = ImageStore::new();
        store.publish("dep.lmd", vec![1]);
        store.publish("dep.lmd", vec![2]);
        assert_eq!(*store.fetch("dep.lmd").unwrap(), vec![2]);
    }
}
