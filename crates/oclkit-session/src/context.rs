//! Compute context: the owner of every buffer, program and queue.

use crate::driver::{Driver, RawHandle, ResourceKind};
use crate::error::ContextError;
use crate::platform::Device;
use crate::resource::Owned;
use std::sync::Arc;
use tracing::info;

/// A driver context over one or more devices of a single platform.
///
/// Releasing the context invalidates everything created through it.
#[derive(Debug)]
pub struct ComputeContext {
    inner: Owned,
    devices: Vec<Device>,
}

impl ComputeContext {
    pub fn create(driver: &Arc<dyn Driver>, devices: &[Device]) -> Result<Self, ContextError> {
        if devices.is_empty() {
            return Err(ContextError::EmptyDeviceSet);
        }
        let ids: Vec<_> = devices.iter().map(|d| d.id).collect();
        let handle = driver
            .create_context(&ids)
            .map_err(|e| ContextError::CreationFailed { status: e.status, message: e.message })?;
        info!(
            devices = %devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", "),
            "context created"
        );
        Ok(Self { inner: Owned::new(Arc::clone(driver), ResourceKind::Context, handle), devices: devices.to_vec() })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.inner.driver()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle, ContextError> {
        self.inner.handle().ok_or(ContextError::Released)
    }

    /// Release the context. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}
