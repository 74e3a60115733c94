//! Error taxonomy for the compute session.
//!
//! One enum per pipeline stage, aggregated into [`SessionError`]. Every
//! variant that originates in a driver call keeps the raw status code so the
//! caller can look it up with [`crate::status::name`].

use crate::config::ConfigError;
use crate::platform::DeviceType;
use crate::program::ProgramState;
use crate::session::SessionState;
use crate::status::{self, Status};
use thiserror::Error;

/// Result alias used by the session layer.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Platform and device discovery failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no compute platform found")]
    NoPlatformFound,

    #[error("no device matches filter [{filter}]")]
    NoDeviceFound { filter: DeviceType },

    #[error("platform index {index} out of range ({count} platforms available)")]
    PlatformIndexOutOfRange { index: usize, count: usize },

    #[error("platform query failed: {message} ({})", status::name(*.status))]
    PlatformQueryFailed { status: Status, message: String },

    #[error("device query failed: {message} ({})", status::name(*.status))]
    DeviceQueryFailed { status: Status, message: String },

    #[error("driver '{name}' is not available in this build")]
    DriverUnavailable { name: String },
}

/// Compute context failures.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context creation failed: empty device set")]
    EmptyDeviceSet,

    #[error("context creation failed: {message} ({})", status::name(*.status))]
    CreationFailed { status: Status, message: String },

    #[error("context has been released")]
    Released,
}

/// Program load, build and kernel creation failures.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("kernel source is empty")]
    SourceEmpty,

    #[error("program creation failed: {message} ({})", status::name(*.status))]
    ProgramCreationFailed { status: Status, message: String },

    #[error("program build failed ({}):\n{log}", status::name(*.status))]
    BuildFailed { status: Status, log: String },

    #[error("program is not built (state: {state})")]
    ProgramNotBuilt { state: ProgramState },

    #[error("entry point '{name}' not found in program (available: {available})")]
    EntryPointNotFound { name: String, available: String },

    #[error("kernel '{name}' creation failed: {message} ({})", status::name(*.status))]
    KernelCreationFailed { name: String, status: Status, message: String },

    #[error("program has been released")]
    Released,
}

impl CompileError {
    /// Build log attached to a failed build, if any.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Device buffer creation failures.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid buffer spec: {reason}")]
    InvalidBufferSpec { reason: String },

    #[error("host data length {actual} does not match buffer size {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("buffer allocation of {size} bytes failed: {message} ({})", status::name(*.status))]
    AllocationFailed { size: usize, status: Status, message: String },

    #[error("buffer has been released")]
    Released,
}

/// Kernel argument binding, launch geometry and synchronisation failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid work dimension: {dims} (expected 1 to 3)")]
    InvalidWorkDimension { dims: usize },

    #[error("invalid global work size {global:?}: every extent must be non-zero")]
    InvalidGlobalWorkSize { global: Vec<usize> },

    #[error("invalid work-group size: {reason}")]
    InvalidWorkGroupSize { reason: String },

    #[error("kernel '{kernel}' argument {index} is not bound")]
    UnboundArgument { kernel: String, index: u32 },

    #[error("kernel '{kernel}' has {arity} arguments, index {index} is out of range")]
    ArgumentIndexOutOfRange { kernel: String, index: u32, arity: usize },

    #[error("kernel '{kernel}' argument {index} expects {expected}, got {actual}")]
    ArgumentTypeMismatch { kernel: String, index: u32, expected: String, actual: String },

    #[error("queue creation failed: {message} ({})", status::name(*.status))]
    QueueCreationFailed { status: Status, message: String },

    #[error("enqueue failed: {message} ({})", status::name(*.status))]
    EnqueueFailed { status: Status, message: String },

    #[error("device fault: {message} ({})", status::name(*.status))]
    DeviceFault { status: Status, message: String },

    #[error("{what} has been released")]
    Released { what: &'static str },
}

/// Host/device transfer failures.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    OutOfRange { requested: usize, capacity: usize },

    #[error("buffer read failed: {message} ({})", status::name(*.status))]
    ReadFailed { status: Status, message: String },

    #[error("buffer write failed: {message} ({})", status::name(*.status))]
    WriteFailed { status: Status, message: String },

    #[error("device fault surfaced at blocking transfer: {message} ({})", status::name(*.status))]
    DeviceFault { status: Status, message: String },

    #[error("{what} has been released")]
    Released { what: &'static str },
}

/// Aggregate error returned by [`crate::Session`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("context stage failed: {0}")]
    Context(#[from] ContextError),

    #[error("compile stage failed: {0}")]
    Compile(#[from] CompileError),

    #[error("buffer stage failed: {0}")]
    Buffer(#[from] BufferError),

    #[error("dispatch stage failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("transfer stage failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} is not valid in session state {state}")]
    InvalidState { operation: &'static str, state: SessionState },

    #[error("unknown {kind} handle #{index}")]
    UnknownHandle { kind: &'static str, index: usize },

    #[error("{operation} called on a torn-down session")]
    TornDown { operation: &'static str },
}

impl SessionError {
    /// Raw driver status carried by the error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Discovery(
                DiscoveryError::PlatformQueryFailed { status, .. }
                | DiscoveryError::DeviceQueryFailed { status, .. },
            )
            | Self::Context(ContextError::CreationFailed { status, .. })
            | Self::Compile(
                CompileError::ProgramCreationFailed { status, .. }
                | CompileError::BuildFailed { status, .. }
                | CompileError::KernelCreationFailed { status, .. },
            )
            | Self::Buffer(BufferError::AllocationFailed { status, .. })
            | Self::Dispatch(
                DispatchError::QueueCreationFailed { status, .. }
                | DispatchError::EnqueueFailed { status, .. }
                | DispatchError::DeviceFault { status, .. },
            )
            | Self::Transfer(
                TransferError::ReadFailed { status, .. }
                | TransferError::WriteFailed { status, .. }
                | TransferError::DeviceFault { status, .. },
            ) => Some(*status),
            _ => None,
        }
    }

    /// Build log carried by a compile failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::Compile(e) => e.build_log(),
            _ => None,
        }
    }
}
