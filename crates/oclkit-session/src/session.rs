//! Session lifecycle controller.
//!
//! A [`Session`] owns every resource of one compute job and walks it through
//! a fixed state machine:
//!
//! ```text
//! Uninitialized → DeviceSelected → ContextCreated → ProgramBuilt
//!   → BuffersAllocated → QueueReady → Dispatched → ResultsRetrieved → TornDown
//! ```
//!
//! The state only moves forward. Any stage failure is logged, the session is
//! torn down, and the error is returned; nothing is retried. Teardown
//! releases kernels, buffers and the program, then the queue, then the
//! context, and may be called any number of times from any state.

use crate::buffer::{self, AccessMode, Buffer, HostBuffer};
use crate::config::SessionConfig;
use crate::context::ComputeContext;
use crate::driver::{self, Driver};
use crate::error::{Result, SessionError};
use crate::kernel::{Kernel, KernelArg, Scalar};
use crate::platform::{self, Device, DeviceType, Platform};
use crate::program::{self, Program};
use crate::queue::{DispatchQueue, NdRange};
use crate::status;
use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Position of a session in its lifecycle. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Uninitialized,
    DeviceSelected,
    ContextCreated,
    ProgramBuilt,
    BuffersAllocated,
    QueueReady,
    Dispatched,
    ResultsRetrieved,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::DeviceSelected => "device-selected",
            Self::ContextCreated => "context-created",
            Self::ProgramBuilt => "program-built",
            Self::BuffersAllocated => "buffers-allocated",
            Self::QueueReady => "queue-ready",
            Self::Dispatched => "dispatched",
            Self::ResultsRetrieved => "results-retrieved",
            Self::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Handle to a kernel owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(usize);

/// Handle to a buffer owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Kernel argument expressed through session handles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Buffer(BufferId),
    Scalar(Scalar),
    /// Work-group local memory of the given byte size.
    Local(usize),
}

impl From<BufferId> for Arg {
    fn from(id: BufferId) -> Self {
        Self::Buffer(id)
    }
}

impl From<Scalar> for Arg {
    fn from(s: Scalar) -> Self {
        Self::Scalar(s)
    }
}

macro_rules! arg_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Arg {
            fn from(v: $ty) -> Self {
                Self::Scalar(Scalar::from(v))
            }
        })*
    };
}

arg_from_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// One compute job: device, context, program, kernels, buffers and queue.
#[derive(Debug)]
pub struct Session {
    driver: Arc<dyn Driver>,
    config: SessionConfig,
    state: SessionState,
    platform: Option<Platform>,
    device: Option<Device>,
    context: Option<ComputeContext>,
    program: Option<Program>,
    kernels: Vec<Option<Kernel>>,
    buffers: Vec<Option<Buffer>>,
    queue: Option<DispatchQueue>,
}

impl Session {
    pub fn new(driver: Arc<dyn Driver>, config: SessionConfig) -> Self {
        debug!(driver = driver.name(), "session created");
        Self {
            driver,
            config,
            state: SessionState::Uninitialized,
            platform: None,
            device: None,
            context: None,
            program: None,
            kernels: Vec::new(),
            buffers: Vec::new(),
            queue: None,
        }
    }

    /// Open the driver named in `config`.
    pub fn from_config(config: SessionConfig) -> Result<Self> {
        let driver = driver::open(config.driver)?;
        Ok(Self::new(driver, config))
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn context(&self) -> Option<&ComputeContext> {
        self.context.as_ref()
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn queue(&self) -> Option<&DispatchQueue> {
        self.queue.as_ref()
    }

    pub fn build_log(&self) -> Option<&str> {
        self.program.as_ref().map(Program::build_log)
    }

    /// Entry points of the built program; empty before a build.
    pub fn kernel_names(&self) -> &[String] {
        self.program.as_ref().map(Program::kernel_names).unwrap_or_default()
    }

    pub fn kernel(&self, id: KernelId) -> Option<&Kernel> {
        self.kernels.get(id.0).and_then(Option::as_ref)
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.0).and_then(Option::as_ref)
    }

    pub fn is_torn_down(&self) -> bool {
        self.state == SessionState::TornDown
    }

    // ── Guards ─────────────────────────────────────────────────────────────

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.is_torn_down() {
            return Err(SessionError::TornDown { operation });
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState { operation, state: self.state }
    }

    fn advance(&mut self, to: SessionState) {
        if to > self.state {
            info!(from = %self.state, to = %to, "session state advanced");
            self.state = to;
        }
    }

    /// Log a stage failure, tear the session down and hand the error back.
    fn fail(&mut self, stage: &'static str, err: impl Into<SessionError>) -> SessionError {
        let err = err.into();
        error!(
            stage,
            status = err.status().map_or("-", status::name),
            build_log = err.build_log().unwrap_or(""),
            error = %err,
            "session stage failed"
        );
        self.teardown();
        err
    }

    fn live_device(&self, operation: &'static str) -> Result<Device> {
        self.ensure_live(operation)?;
        self.device.clone().ok_or_else(|| self.invalid(operation))
    }

    fn live_context(&self, operation: &'static str) -> Result<&ComputeContext> {
        self.ensure_live(operation)?;
        self.context.as_ref().ok_or_else(|| self.invalid(operation))
    }

    fn live_queue(&self, operation: &'static str) -> Result<&DispatchQueue> {
        self.ensure_live(operation)?;
        self.queue.as_ref().ok_or_else(|| self.invalid(operation))
    }

    fn live_buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.buffer(id).ok_or(SessionError::UnknownHandle { kind: "buffer", index: id.0 })
    }

    // ── Stages ─────────────────────────────────────────────────────────────

    /// Select the first device matching the configured filter and platform.
    pub fn select_configured_device(&mut self) -> Result<Device> {
        self.select_device(self.config.device_type)
    }

    /// Select the first device matching `filter`, scanning platforms in order
    /// (or only the configured platform).
    pub fn select_device(&mut self, filter: DeviceType) -> Result<Device> {
        self.ensure_live("select_device")?;
        if self.state != SessionState::Uninitialized {
            return Err(self.invalid("select_device"));
        }
        let (platform, device) = platform::select_first_device(&self.driver, filter, self.config.platform_index)
            .map_err(|e| self.fail("discovery", e))?;
        info!(platform = %platform.name, device = %device.name, "device selected");
        self.platform = Some(platform);
        self.device = Some(device.clone());
        self.advance(SessionState::DeviceSelected);
        Ok(device)
    }

    pub fn create_context(&mut self) -> Result<()> {
        let device = self.live_device("create_context")?;
        if self.context.is_some() {
            return Err(self.invalid("create_context"));
        }
        let context = ComputeContext::create(&self.driver, &[device]).map_err(|e| self.fail("context", e))?;
        self.context = Some(context);
        self.advance(SessionState::ContextCreated);
        Ok(())
    }

    /// Compile `source` for the selected device with the configured build
    /// options. A failed build tears the session down and returns the build
    /// log inside [`crate::CompileError::BuildFailed`].
    pub fn build_program(&mut self, source: &str) -> Result<()> {
        let device = self.live_device("build_program")?;
        if self.program.is_some() {
            return Err(self.invalid("build_program"));
        }
        let context = self.live_context("build_program")?;
        let program = program::compile_with_options(context, &[device], source, &self.config.build_options)
            .map_err(|e| self.fail("compile", e))?;
        let failure = program.build_error();
        self.program = Some(program);
        if let Some(err) = failure {
            return Err(self.fail("compile", err));
        }
        self.advance(SessionState::ProgramBuilt);
        Ok(())
    }

    pub fn create_kernel(&mut self, name: &str) -> Result<KernelId> {
        self.ensure_live("create_kernel")?;
        let program = self.program.as_ref().ok_or_else(|| self.invalid("create_kernel"))?;
        let kernel = program.create_kernel(name).map_err(|e| self.fail("kernel", e))?;
        self.kernels.push(Some(kernel));
        Ok(KernelId(self.kernels.len() - 1))
    }

    /// Allocate a buffer in the session's context.
    pub fn create_buffer(&mut self, mode: AccessMode, size_bytes: usize, host_data: Option<&[u8]>) -> Result<BufferId> {
        let context = self.live_context("create_buffer")?;
        let buffer = Buffer::create(context, mode, size_bytes, host_data).map_err(|e| self.fail("buffer", e))?;
        Ok(self.push_buffer(buffer))
    }

    pub fn buffer_from_slice<T: Pod>(&mut self, mode: AccessMode, data: &[T]) -> Result<BufferId> {
        self.create_buffer(mode, std::mem::size_of_val(data), Some(bytemuck::cast_slice(data)))
    }

    pub fn buffer_uninit<T: Pod>(&mut self, mode: AccessMode, len: usize) -> Result<BufferId> {
        let context = self.live_context("create_buffer")?;
        let buffer = Buffer::uninit::<T>(context, mode, len).map_err(|e| self.fail("buffer", e))?;
        Ok(self.push_buffer(buffer))
    }

    fn push_buffer(&mut self, buffer: Buffer) -> BufferId {
        self.buffers.push(Some(buffer));
        self.advance(SessionState::BuffersAllocated);
        BufferId(self.buffers.len() - 1)
    }

    pub fn create_queue(&mut self) -> Result<()> {
        let device = self.live_device("create_queue")?;
        if self.queue.is_some() {
            return Err(self.invalid("create_queue"));
        }
        let context = self.live_context("create_queue")?;
        let queue = DispatchQueue::create(context, &device).map_err(|e| self.fail("queue", e))?;
        self.queue = Some(queue);
        self.advance(SessionState::QueueReady);
        Ok(())
    }

    /// Bind argument `index` of `kernel`.
    pub fn set_arg(&mut self, kernel: KernelId, index: u32, arg: impl Into<Arg>) -> Result<()> {
        self.ensure_live("set_arg")?;
        let arg = arg.into();
        let Self { kernels, buffers, .. } = &mut *self;
        let k = kernels
            .get_mut(kernel.0)
            .and_then(Option::as_mut)
            .ok_or(SessionError::UnknownHandle { kind: "kernel", index: kernel.0 })?;
        let bound = match arg {
            Arg::Buffer(id) => {
                let b = buffers
                    .get(id.0)
                    .and_then(Option::as_ref)
                    .ok_or(SessionError::UnknownHandle { kind: "buffer", index: id.0 })?;
                k.set_arg(index, KernelArg::Buffer(b))
            }
            Arg::Scalar(s) => k.set_arg(index, KernelArg::Scalar(s)),
            Arg::Local(size) => k.set_arg(index, KernelArg::Local(size)),
        };
        bound.map_err(|e| self.fail("bind", e))
    }

    /// Bind every argument of `kernel` in order.
    pub fn set_args(&mut self, kernel: KernelId, args: &[Arg]) -> Result<()> {
        for (index, arg) in args.iter().enumerate() {
            self.set_arg(kernel, index as u32, *arg)?;
        }
        Ok(())
    }

    /// Enqueue `kernel` over `global` work-items with an optional work-group
    /// size. Faults raised while it runs surface at the next sync point.
    pub fn dispatch(&mut self, kernel: KernelId, global: &[usize], local: Option<&[usize]>) -> Result<()> {
        let range = NdRange::new(global, local).map_err(|e| self.fail("dispatch", e))?;
        self.dispatch_range(kernel, &range)
    }

    pub fn dispatch_range(&mut self, kernel: KernelId, range: &NdRange) -> Result<()> {
        let queue = self.live_queue("dispatch")?;
        let k = self.kernel(kernel).ok_or(SessionError::UnknownHandle { kind: "kernel", index: kernel.0 })?;
        queue.enqueue_range(k, range).map_err(|e| self.fail("dispatch", e))?;
        self.advance(SessionState::Dispatched);
        Ok(())
    }

    pub fn barrier(&mut self) -> Result<()> {
        let queue = self.live_queue("barrier")?;
        queue.enqueue_barrier().map_err(|e| self.fail("dispatch", e))
    }

    pub fn write_buffer<T: Pod>(&mut self, buffer: BufferId, src: &[T], blocking: bool) -> Result<()> {
        let queue = self.live_queue("write_buffer")?;
        let b = self.live_buffer(buffer)?;
        buffer::write_buffer(queue, b, src, blocking).map_err(|e| self.fail("transfer", e))
    }

    /// Enqueue a read into `dst`. With `blocking` the results are retrieved
    /// when this returns; otherwise only after [`Session::finish`].
    pub fn read_buffer<T: Pod + Send + Sync>(&mut self, buffer: BufferId, dst: &HostBuffer<T>, blocking: bool) -> Result<()> {
        let queue = self.live_queue("read_buffer")?;
        let b = self.live_buffer(buffer)?;
        buffer::read_buffer(queue, b, dst, blocking).map_err(|e| self.fail("transfer", e))?;
        if blocking {
            self.advance(SessionState::ResultsRetrieved);
        }
        Ok(())
    }

    /// Blocking read of the whole buffer.
    pub fn read_vec<T: Pod + Send + Sync>(&mut self, buffer: BufferId) -> Result<Vec<T>> {
        let queue = self.live_queue("read_vec")?;
        let b = self.live_buffer(buffer)?;
        let data = queue.read_vec(b).map_err(|e| self.fail("transfer", e))?;
        self.advance(SessionState::ResultsRetrieved);
        Ok(data)
    }

    /// Wait for every enqueued command, reporting deferred device faults.
    pub fn finish(&mut self) -> Result<()> {
        let queue = self.live_queue("finish")?;
        queue.finish().map_err(|e| self.fail("finish", e))
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    /// Release everything the session holds. Idempotent.
    pub fn teardown(&mut self) {
        if self.is_torn_down() {
            return;
        }
        let kernels = self.kernels.iter().flatten().count();
        for mut kernel in self.kernels.drain(..).flatten() {
            kernel.release();
        }
        let buffers = self.buffers.iter().flatten().count();
        for mut buffer in self.buffers.drain(..).flatten() {
            buffer.release();
        }
        if let Some(mut program) = self.program.take() {
            program.release();
        }
        if let Some(mut queue) = self.queue.take() {
            queue.release();
        }
        if let Some(mut context) = self.context.take() {
            context.release();
        }
        info!(from = %self.state, kernels, buffers, "session torn down");
        self.state = SessionState::TornDown;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ReferenceDriver, ResourceKind};
    use crate::error::{CompileError, DiscoveryError};

    fn session() -> (Arc<ReferenceDriver>, Session) {
        let reference = Arc::new(ReferenceDriver::new());
        let session = Session::new(reference.clone(), SessionConfig::default());
        (reference, session)
    }

    #[test]
    fn states_are_ordered() {
        assert!(SessionState::Uninitialized < SessionState::DeviceSelected);
        assert!(SessionState::Dispatched < SessionState::ResultsRetrieved);
        assert!(SessionState::ResultsRetrieved < SessionState::TornDown);
        assert_eq!(SessionState::QueueReady.to_string(), "queue-ready");
    }

    #[test]
    fn context_before_device_is_invalid() {
        let (_driver, mut s) = session();
        let err = s.create_context().unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { operation: "create_context", state: SessionState::Uninitialized }));
        assert_eq!(s.state(), SessionState::Uninitialized);
    }

    #[test]
    fn no_matching_device_tears_down() {
        let (_driver, mut s) = session();
        let err = s.select_device(DeviceType::ACCELERATOR).unwrap_err();
        assert!(matches!(err, SessionError::Discovery(DiscoveryError::NoDeviceFound { .. })));
        assert!(s.is_torn_down());
        assert!(matches!(s.create_context(), Err(SessionError::TornDown { .. })));
    }

    #[test]
    fn queue_before_buffers_keeps_state_monotonic() {
        let (_driver, mut s) = session();
        s.select_configured_device().unwrap();
        s.create_context().unwrap();
        s.create_queue().unwrap();
        assert_eq!(s.state(), SessionState::QueueReady);
        s.buffer_uninit::<f32>(AccessMode::WriteOnly, 4).unwrap();
        assert_eq!(s.state(), SessionState::QueueReady);
    }

    #[test]
    fn oversized_element_count_is_a_buffer_error() {
        let (driver, mut s) = session();
        s.select_configured_device().unwrap();
        s.create_context().unwrap();
        let err = s.buffer_uninit::<f32>(AccessMode::ReadWrite, usize::MAX / 2).unwrap_err();
        assert!(matches!(err, SessionError::Buffer(crate::error::BufferError::InvalidBufferSpec { .. })), "{err}");
        assert!(s.is_torn_down());
        assert_eq!(driver.live_objects(), 0);
    }

    #[test]
    fn build_failure_tears_down_with_log() {
        let (driver, mut s) = session();
        s.select_configured_device().unwrap();
        s.create_context().unwrap();
        let err = s.build_program("__kernel void broken(__global float *a {").unwrap_err();
        let log = err.build_log().unwrap_or_default().to_string();
        assert!(!log.is_empty());
        assert!(matches!(err, SessionError::Compile(CompileError::BuildFailed { .. })));
        assert!(s.is_torn_down());
        assert!(driver.release_log().iter().all(|(kind, _)| *kind != ResourceKind::Kernel));
        assert_eq!(driver.live_objects(), 0);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (driver, mut s) = session();
        s.select_configured_device().unwrap();
        s.create_context().unwrap();
        s.create_queue().unwrap();
        s.teardown();
        let released = driver.release_log().len();
        s.teardown();
        drop(s);
        assert_eq!(driver.release_log().len(), released);
        assert_eq!(released, 2);
    }

    #[test]
    fn unknown_handles_are_reported() {
        let (_driver, mut s) = session();
        s.select_configured_device().unwrap();
        s.create_context().unwrap();
        s.create_queue().unwrap();
        let err = s.read_vec::<u8>(BufferId(3)).unwrap_err();
        assert!(matches!(err, SessionError::UnknownHandle { kind: "buffer", index: 3 }));
        assert!(!s.is_torn_down());
    }
}
