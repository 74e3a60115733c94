//! Host-side compute sessions for OpenCL-style accelerators.
//!
//! A [`Session`] selects a device, creates a context, compiles a program,
//! allocates buffers, dispatches kernels on an in-order queue and tears
//! everything down again in reverse order. All device access goes through
//! the [`Driver`] trait: the in-process [`ReferenceDriver`] is always
//! available, and the `opencl` feature adds a driver for real OpenCL ICDs.
//!
//! ```no_run
//! use oclkit_session::{kernels, pipeline, Session, SessionConfig};
//!
//! let mut session = Session::from_config(SessionConfig::default())?;
//! let sums = pipeline::vector_add(&mut session, kernels::VECTOR_ADD_SRC, 1000, None)?;
//! assert!(sums.iter().all(|&v| v == 1000.0));
//! # Ok::<(), oclkit_session::SessionError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod kernels;
pub mod pipeline;
pub mod platform;
pub mod program;
pub mod queue;
pub mod reference_kernels;
mod resource;
pub mod session;
pub mod status;

pub use buffer::{read_buffer, write_buffer, AccessMode, Buffer, HostBuffer};
pub use config::{ConfigError, SessionConfig};
pub use context::ComputeContext;
pub use driver::{Driver, DriverKind, ReferenceDriver};
pub use error::{
    BufferError, CompileError, ContextError, DiscoveryError, DispatchError, Result, SessionError, TransferError,
};
pub use kernel::{Kernel, KernelArg, Scalar};
pub use pipeline::RotateParams;
pub use platform::{list_devices, list_platforms, select_device, select_first_device, Device, DeviceType, Platform};
pub use program::{compile, compile_with_options, Program, ProgramState};
pub use queue::{DispatchQueue, NdRange};
pub use session::{Arg, BufferId, KernelId, Session, SessionState};
