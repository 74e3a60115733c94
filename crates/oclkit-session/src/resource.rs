//! Owned driver handles with release-on-drop.

use crate::driver::{Driver, RawHandle, ResourceKind};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A driver object owned by exactly one host value.
///
/// Not `Clone`. The handle slot starts full and is emptied by the first
/// [`Owned::release`]; later calls are no-ops.
pub(crate) struct Owned {
    driver: Arc<dyn Driver>,
    kind: ResourceKind,
    handle: Option<RawHandle>,
}

impl Owned {
    pub(crate) fn new(driver: Arc<dyn Driver>, kind: ResourceKind, handle: RawHandle) -> Self {
        Self { driver, kind, handle: Some(handle) }
    }

    pub(crate) fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub(crate) fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Release the handle. Returns `true` if this call released it.
    pub(crate) fn release(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        match self.driver.release(self.kind, handle) {
            Ok(()) => debug!(kind = %self.kind, handle = handle.0, "released"),
            Err(e) => warn!(kind = %self.kind, handle = handle.0, error = %e, "release failed"),
        }
        true
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Owned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("driver", &self.driver.name())
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}
