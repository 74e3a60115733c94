//! Device-abstraction seam.
//!
//! Everything above this module talks to a [`Driver`] through opaque
//! [`RawHandle`]s. The in-process [`ReferenceDriver`] is always available;
//! the OpenCL ICD driver is compiled in with the `opencl` feature.

pub mod reference;

#[cfg(feature = "opencl")]
pub mod opencl;

use crate::buffer::AccessMode;
use crate::error::DiscoveryError;
use crate::kernel::Scalar;
use crate::platform::{Device, DeviceType, Platform};
use crate::queue::NdRange;
use crate::status::{self, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use reference::{
    DeviceSpec, HostKernel, KernelArgs, KernelFault, PlatformSpec, ReferenceDriver,
    ReferenceDriverBuilder, WorkItem,
};

#[cfg(feature = "opencl")]
pub use opencl::OpenClDriver;

/// Opaque handle to a driver-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

/// Identifier of a platform as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformId(pub u64);

/// Identifier of a device as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

/// Kind of a releasable driver object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Program,
    Kernel,
    Buffer,
    Queue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => write!(f, "context"),
            Self::Program => write!(f, "program"),
            Self::Kernel => write!(f, "kernel"),
            Self::Buffer => write!(f, "buffer"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

/// Failure reported by a driver call.
///
/// `deferred` is set when the failure belongs to an earlier asynchronous
/// command and is only now being surfaced at a synchronisation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub status: Status,
    pub message: String,
    pub deferred: bool,
}

impl DriverError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), deferred: false }
    }

    pub fn deferred(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), deferred: true }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, status::name(self.status))
    }
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Outcome of a program build. The log is kept verbatim on success and failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub status: Status,
    pub log: String,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

/// Kernel argument as handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawArg {
    Buffer(RawHandle),
    Scalar(Scalar),
    /// Work-group local allocation of the given byte size.
    Local(usize),
}

/// Host-side destination of a device read.
///
/// The driver calls [`HostSink::store`] once the read has actually executed,
/// which for a non-blocking read may be well after the enqueue call returned.
pub trait HostSink: Send + Sync {
    fn byte_len(&self) -> usize;
    fn store(&self, bytes: &[u8]);
}

/// Host API of a compute platform.
pub trait Driver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn platforms(&self) -> DriverResult<Vec<Platform>>;

    /// Devices of `platform` whose type intersects `filter`, in enumeration order.
    fn devices(&self, platform: PlatformId, filter: DeviceType) -> DriverResult<Vec<Device>>;

    fn create_context(&self, devices: &[DeviceId]) -> DriverResult<RawHandle>;

    fn create_program(&self, context: RawHandle, source: &str) -> DriverResult<RawHandle>;

    fn build_program(&self, program: RawHandle, devices: &[DeviceId], options: &str) -> BuildOutcome;

    fn kernel_names(&self, program: RawHandle) -> DriverResult<Vec<String>>;

    fn create_kernel(&self, program: RawHandle, name: &str) -> DriverResult<RawHandle>;

    fn kernel_arity(&self, kernel: RawHandle) -> DriverResult<usize>;

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: RawArg) -> DriverResult<()>;

    fn create_buffer(
        &self,
        context: RawHandle,
        mode: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<RawHandle>;

    fn create_queue(&self, context: RawHandle, device: DeviceId) -> DriverResult<RawHandle>;

    /// Enqueue a host-to-device copy. `data` is copied before this returns.
    fn enqueue_write(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        data: &[u8],
        blocking: bool,
    ) -> DriverResult<()>;

    /// Enqueue a device-to-host copy of `sink.byte_len()` bytes.
    fn enqueue_read(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        sink: Arc<dyn HostSink>,
        blocking: bool,
    ) -> DriverResult<()>;

    fn enqueue_kernel(&self, queue: RawHandle, kernel: RawHandle, range: &NdRange) -> DriverResult<()>;

    fn enqueue_barrier(&self, queue: RawHandle) -> DriverResult<()>;

    /// Block until every command on `queue` has completed.
    fn finish(&self, queue: RawHandle) -> DriverResult<()>;

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> DriverResult<()>;
}

/// Which driver a session should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Reference,
    OpenCl,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::OpenCl => write!(f, "opencl"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reference" | "ref" => Ok(Self::Reference),
            "opencl" | "cl" => Ok(Self::OpenCl),
            other => Err(format!("unknown driver: {other}")),
        }
    }
}

/// Open the driver named by `kind`.
pub fn open(kind: DriverKind) -> Result<Arc<dyn Driver>, DiscoveryError> {
    match kind {
        DriverKind::Reference => Ok(Arc::new(ReferenceDriver::new())),
        #[cfg(feature = "opencl")]
        DriverKind::OpenCl => Ok(Arc::new(OpenClDriver::new())),
        #[cfg(not(feature = "opencl"))]
        DriverKind::OpenCl => Err(DiscoveryError::DriverUnavailable { name: kind.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_kind_display_roundtrip() {
        for kind in [DriverKind::Reference, DriverKind::OpenCl] {
            let parsed: DriverKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_driver_kind_is_rejected() {
        assert!("cuda".parse::<DriverKind>().is_err());
    }

    #[test]
    fn open_reference_driver() {
        let driver = open(DriverKind::Reference).unwrap();
        assert_eq!(driver.name(), "reference");
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn opencl_driver_unavailable_without_feature() {
        let err = open(DriverKind::OpenCl).unwrap_err();
        assert!(matches!(err, DiscoveryError::DriverUnavailable { .. }));
    }

    #[test]
    fn driver_error_display_names_status() {
        let err = DriverError::deferred(status::OUT_OF_RESOURCES, "kernel faulted");
        assert!(err.deferred);
        assert_eq!(err.to_string(), "kernel faulted (CL_OUT_OF_RESOURCES)");
    }
}
