//! Ordered release of device objects.
//!
//! Every device object is registered here right after it is created, together
//! with the action that destroys it. Releasing walks the list backwards, so
//! an object is always destroyed before anything it was created from. A
//! partially constructed engine therefore tears down exactly what it built.

use ash::vk;
use tracing::debug;

struct Owned {
    label: &'static str,
    release: Box<dyn FnOnce()>,
}

/// Creation-ordered list of release actions.
#[derive(Default)]
pub struct OwnershipList {
    entries: Vec<Owned>,
}

impl OwnershipList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle and returns it. Null handles are not recorded.
    pub fn adopt<H>(
        &mut self,
        label: &'static str,
        handle: H,
        release: impl FnOnce(H) + 'static,
    ) -> H
    where
        H: vk::Handle + Copy + 'static,
    {
        if handle.as_raw() != 0 {
            self.defer(label, move || release(handle));
        }
        handle
    }

    /// Registers a release action not tied to a single handle.
    pub fn defer(&mut self, label: &'static str, release: impl FnOnce() + 'static) {
        self.entries.push(Owned {
            label,
            release: Box::new(release),
        });
    }

    /// Runs every release action in reverse registration order.
    ///
    /// Each action runs at most once; later calls do nothing.
    pub fn release_all(&mut self) {
        while let Some(owned) = self.entries.pop() {
            debug!(object = owned.label, "releasing");
            (owned.release)();
        }
    }

    /// Labels of the registered objects in creation order.
    #[must_use]
    pub fn labels(&self) -> Vec<&'static str> {
        self.entries.iter().map(|owned| owned.label).collect()
    }

    /// Number of pending release actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is left to release.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for OwnershipList {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for OwnershipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipList")
            .field("labels", &self.labels())
            .finish()
    }
}
