//! In-order dispatch queue and launch geometry.

use crate::buffer::{self, Buffer, HostBuffer};
use crate::context::ComputeContext;
use crate::driver::{Driver, RawHandle, ResourceKind};
use crate::error::{DispatchError, TransferError};
use crate::kernel::Kernel;
use crate::platform::Device;
use crate::resource::Owned;
use crate::status;
use bytemuck::Pod;
use std::sync::Arc;
use tracing::{debug, info};

// ── Launch geometry ─────────────────────────────────────────────────────────

/// Validated 1 to 3 dimensional launch range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdRange {
    global: Vec<usize>,
    local: Option<Vec<usize>>,
}

impl NdRange {
    /// Validate `global` (non-zero extents) and `local` (same dimensionality,
    /// evenly dividing `global`).
    pub fn new(global: &[usize], local: Option<&[usize]>) -> Result<Self, DispatchError> {
        if global.is_empty() || global.len() > 3 {
            return Err(DispatchError::InvalidWorkDimension { dims: global.len() });
        }
        if global.iter().any(|&g| g == 0) {
            return Err(DispatchError::InvalidGlobalWorkSize { global: global.to_vec() });
        }
        if let Some(local) = local {
            if local.len() != global.len() {
                return Err(DispatchError::InvalidWorkGroupSize {
                    reason: format!("local size {local:?} has {} dimensions, global size {global:?} has {}", local.len(), global.len()),
                });
            }
            for (dim, (&g, &l)) in global.iter().zip(local).enumerate() {
                if l == 0 || g % l != 0 {
                    return Err(DispatchError::InvalidWorkGroupSize {
                        reason: format!("local size {l} does not evenly divide global size {g} in dimension {dim}"),
                    });
                }
            }
        }
        Ok(Self { global: global.to_vec(), local: local.map(<[usize]>::to_vec) })
    }

    /// One-dimensional range of `n` work-items.
    pub fn linear(n: usize, local: Option<usize>) -> Result<Self, DispatchError> {
        Self::new(&[n], local.as_ref().map(std::slice::from_ref))
    }

    pub fn dims(&self) -> usize {
        self.global.len()
    }

    pub fn global(&self) -> &[usize] {
        &self.global
    }

    pub fn local(&self) -> Option<&[usize]> {
        self.local.as_deref()
    }

    pub fn global_items(&self) -> usize {
        self.global.iter().product()
    }

    pub fn local_items(&self) -> Option<usize> {
        self.local.as_ref().map(|l| l.iter().product())
    }

    /// Global extent padded to three dimensions with 1.
    pub fn global3(&self) -> [usize; 3] {
        pad3(&self.global)
    }

    pub fn local3(&self) -> Option<[usize; 3]> {
        self.local.as_deref().map(pad3)
    }

    /// Copy of this range with the work-group size filled in.
    pub(crate) fn with_local(&self, local: Vec<usize>) -> Self {
        Self { global: self.global.clone(), local: Some(local) }
    }
}

fn pad3(v: &[usize]) -> [usize; 3] {
    let mut out = [1; 3];
    out[..v.len()].copy_from_slice(v);
    out
}

/// Work-group size chosen when the caller gives none: the largest divisor
/// of the first extent not above `max_work_group_size`, 1 elsewhere.
pub fn default_local_size(global: &[usize], max_work_group_size: usize) -> Vec<usize> {
    let mut local = vec![1; global.len()];
    if let Some(&first) = global.first() {
        let cap = max_work_group_size.max(1).min(first);
        local[0] = (1..=cap).rev().find(|d| first % d == 0).unwrap_or(1);
    }
    local
}

// ── Queue ───────────────────────────────────────────────────────────────────

/// Ordered command stream bound to one device.
#[derive(Debug)]
pub struct DispatchQueue {
    inner: Owned,
    device: Device,
}

impl DispatchQueue {
    pub fn create(context: &ComputeContext, device: &Device) -> Result<Self, DispatchError> {
        let ctx = context.raw().map_err(|_| DispatchError::Released { what: "context" })?;
        let driver = context.driver();
        let handle = driver
            .create_queue(ctx, device.id)
            .map_err(|e| DispatchError::QueueCreationFailed { status: e.status, message: e.message })?;
        info!(device = %device.name, "queue created");
        Ok(Self { inner: Owned::new(Arc::clone(driver), ResourceKind::Queue, handle), device: device.clone() })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        self.inner.driver()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle, DispatchError> {
        self.inner.handle().ok_or(DispatchError::Released { what: "queue" })
    }

    /// Enqueue `kernel` over `global` work-items.
    ///
    /// Geometry and argument binding are checked here. Faults raised while
    /// the kernel runs are reported by [`DispatchQueue::finish`] or the next
    /// blocking transfer.
    pub fn enqueue_kernel(&self, kernel: &Kernel, global: &[usize], local: Option<&[usize]>) -> Result<(), DispatchError> {
        let range = NdRange::new(global, local)?;
        self.enqueue_range(kernel, &range)
    }

    pub fn enqueue_range(&self, kernel: &Kernel, range: &NdRange) -> Result<(), DispatchError> {
        self.check_device_limits(range)?;
        if let Some(index) = kernel.first_unbound() {
            return Err(DispatchError::UnboundArgument { kernel: kernel.name().to_string(), index });
        }
        let q = self.raw()?;
        let k = kernel.raw()?;
        self.driver().enqueue_kernel(q, k, range).map_err(|e| match e.status {
            status::INVALID_WORK_GROUP_SIZE | status::INVALID_WORK_ITEM_SIZE => {
                DispatchError::InvalidWorkGroupSize { reason: e.message }
            }
            status::INVALID_WORK_DIMENSION => DispatchError::InvalidWorkDimension { dims: range.dims() },
            _ => DispatchError::EnqueueFailed { status: e.status, message: e.message },
        })?;
        debug!(kernel = kernel.name(), global = ?range.global(), local = ?range.local(), "kernel enqueued");
        Ok(())
    }

    fn check_device_limits(&self, range: &NdRange) -> Result<(), DispatchError> {
        let Some(local) = range.local() else {
            return Ok(());
        };
        let items: usize = local.iter().product();
        if items > self.device.max_work_group_size {
            return Err(DispatchError::InvalidWorkGroupSize {
                reason: format!(
                    "local size {local:?} has {items} work-items, device '{}' allows {}",
                    self.device.name, self.device.max_work_group_size
                ),
            });
        }
        for (dim, (&l, &max)) in local.iter().zip(&self.device.max_work_item_sizes).enumerate() {
            if l > max {
                return Err(DispatchError::InvalidWorkGroupSize {
                    reason: format!("local size {l} exceeds device limit {max} in dimension {dim}"),
                });
            }
        }
        Ok(())
    }

    /// Commands after the barrier start only once every earlier command has
    /// completed.
    pub fn enqueue_barrier(&self) -> Result<(), DispatchError> {
        let q = self.raw()?;
        self.driver()
            .enqueue_barrier(q)
            .map_err(|e| DispatchError::EnqueueFailed { status: e.status, message: e.message })
    }

    /// Block until every enqueued command has completed, reporting the first
    /// deferred device fault.
    pub fn finish(&self) -> Result<(), DispatchError> {
        let q = self.raw()?;
        self.driver().finish(q).map_err(|e| DispatchError::DeviceFault { status: e.status, message: e.message })?;
        debug!(device = %self.device.name, "queue finished");
        Ok(())
    }

    /// Blocking read of the whole buffer as elements of `T`.
    pub fn read_vec<T: Pod + Send + Sync>(&self, buffer: &Buffer) -> Result<Vec<T>, TransferError> {
        let host = HostBuffer::<T>::zeroed(buffer.size() / std::mem::size_of::<T>());
        buffer::read_buffer(self, buffer, &host, true)?;
        Ok(host.snapshot())
    }

    /// Release the queue. Idempotent.
    pub fn release(&mut self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_bad_dimensions() {
        assert!(matches!(NdRange::new(&[], None), Err(DispatchError::InvalidWorkDimension { dims: 0 })));
        assert!(matches!(NdRange::new(&[1, 1, 1, 1], None), Err(DispatchError::InvalidWorkDimension { dims: 4 })));
        assert!(matches!(NdRange::new(&[4, 0], None), Err(DispatchError::InvalidGlobalWorkSize { .. })));
    }

    #[test]
    fn local_must_match_dimensionality() {
        let err = NdRange::new(&[6, 6], Some(&[1][..])).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidWorkGroupSize { .. }));
    }

    #[test]
    fn padded_extents() {
        let r = NdRange::new(&[6, 4], Some(&[3, 2][..])).unwrap();
        assert_eq!(r.global3(), [6, 4, 1]);
        assert_eq!(r.local3(), Some([3, 2, 1]));
        assert_eq!(r.global_items(), 24);
        assert_eq!(r.local_items(), Some(6));
    }

    #[test]
    fn default_local_size_picks_largest_divisor() {
        assert_eq!(default_local_size(&[1000], 256), vec![250]);
        assert_eq!(default_local_size(&[6, 6], 256), vec![6, 1]);
        assert_eq!(default_local_size(&[7], 4), vec![1]);
    }

    proptest! {
        #[test]
        fn non_dividing_local_size_is_rejected(global in 1usize..512, local in 1usize..64) {
            prop_assume!(global % local != 0);
            let err = NdRange::linear(global, Some(local)).unwrap_err();
            prop_assert!(matches!(err, DispatchError::InvalidWorkGroupSize { .. }), "unexpected error: {err}");
        }

        #[test]
        fn dividing_local_size_is_accepted(groups in 1usize..64, local in 1usize..32) {
            let range = NdRange::linear(groups * local, Some(local)).unwrap();
            prop_assert_eq!(range.local(), Some(&[local][..]));
        }

        #[test]
        fn default_local_size_divides_global(global in 1usize..4096, max in 1usize..1024) {
            let local = default_local_size(&[global], max);
            prop_assert!(local[0] <= max);
            prop_assert_eq!(global % local[0], 0);
        }
    }
}
