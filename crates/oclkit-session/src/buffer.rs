//! Device buffers and host transfers.
//!
//! Buffers never synchronise on their own: the order of transfers and kernel
//! launches on the [`DispatchQueue`] is the only ordering there is.

use crate::context::ComputeContext;
use crate::driver::{DriverError, HostSink, RawHandle, ResourceKind};
use crate::error::{BufferError, TransferError};
use crate::queue::DispatchQueue;
use crate::resource::Owned;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Kernel-side access mode of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::WriteOnly => write!(f, "write-only"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Device memory owned through a compute context.
#[derive(Debug)]
pub struct Buffer {
    inner: Owned,
    mode: AccessMode,
    size: usize,
}

impl Buffer {
    /// Allocate `size_bytes` of device memory, optionally initialised from
    /// `host_data`.
    ///
    /// A read-only buffer must be initialised from the host, and `host_data`
    /// must be exactly `size_bytes` long.
    pub fn create(
        context: &ComputeContext,
        mode: AccessMode,
        size_bytes: usize,
        host_data: Option<&[u8]>,
    ) -> Result<Self, BufferError> {
        if size_bytes == 0 {
            return Err(BufferError::InvalidBufferSpec { reason: "buffer size must be non-zero".into() });
        }
        if mode == AccessMode::ReadOnly && host_data.is_none() {
            return Err(BufferError::InvalidBufferSpec {
                reason: "read-only buffer requires initial host data".into(),
            });
        }
        if let Some(data) = host_data {
            if data.len() != size_bytes {
                return Err(BufferError::SizeMismatch { expected: size_bytes, actual: data.len() });
            }
        }

        let ctx = context.raw().map_err(|_| BufferError::Released)?;
        let driver = context.driver();
        let handle = driver.create_buffer(ctx, mode, size_bytes, host_data).map_err(|e| {
            BufferError::AllocationFailed { size: size_bytes, status: e.status, message: e.message }
        })?;
        debug!(%mode, size_bytes, copied = host_data.is_some(), "buffer created");
        Ok(Self { inner: Owned::new(Arc::clone(driver), ResourceKind::Buffer, handle), mode, size: size_bytes })
    }

    /// Buffer initialised with a copy of `data`.
    pub fn from_slice<T: Pod>(context: &ComputeContext, mode: AccessMode, data: &[T]) -> Result<Self, BufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::create(context, mode, bytes.len(), Some(bytes))
    }

    /// Uninitialised buffer holding `len` elements of `T`.
    pub fn uninit<T: Pod>(context: &ComputeContext, mode: AccessMode, len: usize) -> Result<Self, BufferError> {
        Self::create(context, mode, element_bytes::<T>(len)?, None)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub(crate) fn raw(&self) -> Result<RawHandle, BufferError> {
        self.inner.handle().ok_or(BufferError::Released)
    }

    /// Release the device memory. Idempotent.
    pub fn release(&mut self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

/// Byte size of `len` elements of `T`.
pub(crate) fn element_bytes<T: Pod>(len: usize) -> Result<usize, BufferError> {
    let size = std::mem::size_of::<T>();
    len.checked_mul(size).ok_or_else(|| BufferError::InvalidBufferSpec {
        reason: format!("{len} elements of {size} bytes overflow the address space"),
    })
}

/// Shared host allocation used as the destination of device reads.
///
/// After a non-blocking read the contents are undefined until the read's
/// completion point: a later blocking call or [`DispatchQueue::finish`].
pub struct HostBuffer<T: Pod> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: Pod + Send + Sync> HostBuffer<T> {
    /// Zero-filled buffer of `len` elements.
    pub fn zeroed(len: usize) -> Self {
        Self { data: Arc::new(Mutex::new(vec![T::zeroed(); len])) }
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self { data: Arc::new(Mutex::new(data)) }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    /// Copy of the current host contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.data.lock().clone()
    }

    pub(crate) fn sink(&self) -> Arc<dyn HostSink> {
        Arc::new(Sink { data: Arc::clone(&self.data) })
    }
}

impl<T: Pod> fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.data.lock().len())
            .field("elem_size", &std::mem::size_of::<T>())
            .finish()
    }
}

struct Sink<T> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: Pod + Send + Sync> HostSink for Sink<T> {
    fn byte_len(&self) -> usize {
        self.data.lock().len() * std::mem::size_of::<T>()
    }

    fn store(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let dst: &mut [u8] = bytemuck::cast_slice_mut(data.as_mut_slice());
        let n = dst.len().min(bytes.len());
        dst[..n].copy_from_slice(&bytes[..n]);
    }
}

fn transfer_error(e: DriverError, read: bool) -> TransferError {
    match (e.deferred, read) {
        (true, _) => TransferError::DeviceFault { status: e.status, message: e.message },
        (false, true) => TransferError::ReadFailed { status: e.status, message: e.message },
        (false, false) => TransferError::WriteFailed { status: e.status, message: e.message },
    }
}

/// Enqueue a device-to-host read of `dst.len()` elements into `dst`.
///
/// With `blocking` the call returns once `dst` holds the data; any device
/// fault left over from earlier commands is reported here.
pub fn read_buffer<T: Pod + Send + Sync>(
    queue: &DispatchQueue,
    buffer: &Buffer,
    dst: &HostBuffer<T>,
    blocking: bool,
) -> Result<(), TransferError> {
    let requested = dst.byte_len();
    if requested > buffer.size() {
        return Err(TransferError::OutOfRange { requested, capacity: buffer.size() });
    }
    let q = queue.raw().map_err(|_| TransferError::Released { what: "queue" })?;
    let b = buffer.raw().map_err(|_| TransferError::Released { what: "buffer" })?;
    queue.driver().enqueue_read(q, b, dst.sink(), blocking).map_err(|e| transfer_error(e, true))?;
    debug!(bytes = requested, blocking, "read enqueued");
    Ok(())
}

/// Enqueue a host-to-device write of `src`. The data is copied before this
/// returns, so `src` may be reused immediately even when not blocking.
pub fn write_buffer<T: Pod>(
    queue: &DispatchQueue,
    buffer: &Buffer,
    src: &[T],
    blocking: bool,
) -> Result<(), TransferError> {
    let bytes: &[u8] = bytemuck::cast_slice(src);
    if bytes.len() > buffer.size() {
        return Err(TransferError::OutOfRange { requested: bytes.len(), capacity: buffer.size() });
    }
    let q = queue.raw().map_err(|_| TransferError::Released { what: "queue" })?;
    let b = buffer.raw().map_err(|_| TransferError::Released { what: "buffer" })?;
    queue.driver().enqueue_write(q, b, bytes, blocking).map_err(|e| transfer_error(e, false))?;
    debug!(bytes = bytes.len(), blocking, "write enqueued");
    Ok(())
}
