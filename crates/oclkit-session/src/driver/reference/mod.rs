//! In-process reference driver.
//!
//! Implements the [`Driver`] contract on the host: kernel source goes through
//! the front end in [`crate::program::signature`], and each entry point is
//! executed by a registered [`HostKernel`]. Queues are in-order and lazy;
//! commands run at the next synchronisation point (a blocking transfer or
//! `finish`), so device faults surface there the way they do on real
//! hardware.

mod builtins;
mod exec;

pub use exec::{HostKernel, KernelArgs, KernelFault, WorkItem};

use super::{
    BuildOutcome, DeviceId, Driver, DriverError, DriverResult, HostSink, PlatformId, RawArg, RawHandle,
    ResourceKind,
};
use crate::buffer::AccessMode;
use crate::platform::{Device, DeviceType, Platform};
use crate::program::signature::{self, ParamKind};
use crate::queue::{default_local_size, NdRange};
use crate::status::{self, Status};
use exec::{BoundArg, Launch};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Topology ────────────────────────────────────────────────────────────────

/// Description of a simulated device.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    name: String,
    vendor: String,
    vendor_id: u32,
    device_type: DeviceType,
    compute_units: u32,
    max_work_group_size: usize,
    max_work_item_sizes: Vec<usize>,
    global_mem_bytes: u64,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            vendor: "oclkit".into(),
            vendor_id: 0x0c1c,
            device_type,
            compute_units: 8,
            max_work_group_size: 256,
            max_work_item_sizes: vec![256, 256, 64],
            global_mem_bytes: 1 << 30,
        }
    }

    pub fn gpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::GPU)
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self { compute_units: 4, max_work_group_size: 1024, max_work_item_sizes: vec![1024; 3], ..Self::new(name, DeviceType::CPU) }
    }

    pub fn accelerator(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::ACCELERATOR)
    }

    /// Also report the device as the platform default.
    pub fn as_default(mut self) -> Self {
        self.device_type |= DeviceType::DEFAULT;
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn compute_units(mut self, n: u32) -> Self {
        self.compute_units = n;
        self
    }

    /// Limit the work-group size; per-dimension item limits are clamped to it.
    pub fn max_work_group_size(mut self, n: usize) -> Self {
        self.max_work_group_size = n;
        for limit in &mut self.max_work_item_sizes {
            *limit = (*limit).min(n);
        }
        self
    }

    pub fn global_mem_bytes(mut self, bytes: u64) -> Self {
        self.global_mem_bytes = bytes;
        self
    }
}

/// Description of a simulated platform and its devices.
#[derive(Debug, Clone)]
pub struct PlatformSpec {
    name: String,
    vendor: String,
    version: String,
    extensions: Vec<String>,
    devices: Vec<DeviceSpec>,
}

impl PlatformSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: "oclkit".into(),
            version: "OpenCL 1.2 oclkit-reference".into(),
            extensions: vec!["cl_khr_byte_addressable_store".into(), "cl_khr_global_int32_base_atomics".into()],
            devices: Vec::new(),
        }
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extensions.push(ext.into());
        self
    }

    pub fn device(mut self, device: DeviceSpec) -> Self {
        self.devices.push(device);
        self
    }
}

fn default_platforms() -> Vec<PlatformSpec> {
    vec![PlatformSpec::new("oclkit Reference Platform")
        .device(DeviceSpec::gpu("Reference GPU").as_default().compute_units(32))
        .device(DeviceSpec::cpu("Reference CPU"))]
}

struct PlatformEntry {
    platform: Platform,
    devices: Vec<Device>,
}

fn materialize(specs: Vec<PlatformSpec>) -> Vec<PlatformEntry> {
    let mut next_device = 1;
    specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            let platform_id = PlatformId(index as u64 + 1);
            let devices = spec
                .devices
                .into_iter()
                .map(|d| {
                    let id = DeviceId(next_device);
                    next_device += 1;
                    Device {
                        id,
                        platform: platform_id,
                        name: d.name,
                        vendor: d.vendor,
                        vendor_id: d.vendor_id,
                        device_type: d.device_type,
                        compute_units: d.compute_units,
                        max_work_group_size: d.max_work_group_size,
                        max_work_item_sizes: d.max_work_item_sizes,
                        global_mem_bytes: d.global_mem_bytes,
                        driver_version: env!("CARGO_PKG_VERSION").into(),
                        version: "OpenCL 1.2".into(),
                    }
                })
                .collect();
            PlatformEntry {
                platform: Platform {
                    id: platform_id,
                    name: spec.name,
                    vendor: spec.vendor,
                    version: spec.version,
                    profile: "FULL_PROFILE".into(),
                    extensions: spec.extensions,
                },
                devices,
            }
        })
        .collect()
}

// ── Object tables ───────────────────────────────────────────────────────────

struct ContextEntry {
    devices: Vec<DeviceId>,
}

struct ProgramEntry {
    context: u64,
    source: String,
    /// Entry points and their parameter kinds once built.
    built: Option<Vec<(String, Vec<ParamKind>)>>,
}

struct KernelEntry {
    program: u64,
    context: u64,
    name: String,
    params: Vec<ParamKind>,
    args: Vec<Option<BoundArg>>,
    imp: Arc<dyn HostKernel>,
}

pub(super) struct BufferEntry {
    pub(super) context: u64,
    pub(super) mode: AccessMode,
    pub(super) data: Vec<u8>,
}

enum Command {
    Write { buffer: u64, data: Vec<u8> },
    Read { buffer: u64, sink: Arc<dyn HostSink> },
    Launch(Launch),
    Barrier,
}

struct QueueEntry {
    context: u64,
    device: DeviceId,
    pending: VecDeque<Command>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    contexts: HashMap<u64, ContextEntry>,
    programs: HashMap<u64, ProgramEntry>,
    kernels: HashMap<u64, KernelEntry>,
    buffers: HashMap<u64, BufferEntry>,
    queues: HashMap<u64, QueueEntry>,
    released: Vec<(ResourceKind, RawHandle)>,
}

impl State {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn live(&self) -> usize {
        self.contexts.len() + self.programs.len() + self.kernels.len() + self.buffers.len() + self.queues.len()
    }

    /// Run every pending command on `queue` in order. The first failure is
    /// returned as a deferred error and the rest of the batch is dropped.
    fn flush(&mut self, queue: u64) -> DriverResult<()> {
        let pending = match self.queues.get_mut(&queue) {
            Some(q) => std::mem::take(&mut q.pending),
            None => return Err(DriverError::new(status::INVALID_COMMAND_QUEUE, format!("unknown queue {queue}"))),
        };
        let total = pending.len();
        for (done, command) in pending.into_iter().enumerate() {
            if let Err(mut e) = self.execute(command) {
                e.deferred = true;
                warn!(queue, dropped = total - done - 1, error = %e, "command failed, discarding the rest of the batch");
                return Err(e);
            }
        }
        if total > 0 {
            trace!(queue, commands = total, "queue drained");
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) -> DriverResult<()> {
        match command {
            Command::Write { buffer, data } => {
                let entry = self.buffers.get_mut(&buffer).ok_or_else(|| released_buffer(buffer))?;
                entry.data[..data.len()].copy_from_slice(&data);
                Ok(())
            }
            Command::Read { buffer, sink } => {
                let entry = self.buffers.get(&buffer).ok_or_else(|| released_buffer(buffer))?;
                let n = sink.byte_len().min(entry.data.len());
                sink.store(&entry.data[..n]);
                Ok(())
            }
            Command::Launch(launch) => {
                debug!(kernel = %launch.name, global = ?launch.range.global(), local = ?launch.range.local(), "executing kernel");
                exec::run(&mut self.buffers, &launch)
            }
            Command::Barrier => Ok(()),
        }
    }

    fn queue(&self, queue: RawHandle) -> DriverResult<&QueueEntry> {
        self.queues
            .get(&queue.0)
            .ok_or_else(|| DriverError::new(status::INVALID_COMMAND_QUEUE, format!("unknown queue {}", queue.0)))
    }

    fn buffer_in(&self, buffer: RawHandle, context: u64) -> DriverResult<&BufferEntry> {
        let entry = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| DriverError::new(status::INVALID_MEM_OBJECT, format!("unknown buffer {}", buffer.0)))?;
        if entry.context != context {
            return Err(DriverError::new(status::INVALID_CONTEXT, "buffer and queue belong to different contexts"));
        }
        Ok(entry)
    }

    fn push(&mut self, queue: RawHandle, command: Command, blocking: bool) -> DriverResult<()> {
        if let Some(q) = self.queues.get_mut(&queue.0) {
            q.pending.push_back(command);
        }
        if blocking {
            self.flush(queue.0)?;
        }
        Ok(())
    }

    /// Drop every object that belongs to `context`.
    fn invalidate_context(&mut self, context: u64) {
        self.queues.retain(|_, q| q.context != context);
        self.buffers.retain(|_, b| b.context != context);
        self.programs.retain(|_, p| p.context != context);
        self.kernels.retain(|_, k| k.context != context);
    }
}

fn released_buffer(buffer: u64) -> DriverError {
    DriverError::deferred(status::INVALID_MEM_OBJECT, format!("buffer {buffer} was released before the command ran"))
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Host-executed driver with a configurable platform topology.
pub struct ReferenceDriver {
    platforms: Vec<PlatformEntry>,
    host_kernels: HashMap<String, Arc<dyn HostKernel>>,
    state: Mutex<State>,
}

impl fmt::Debug for ReferenceDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.host_kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ReferenceDriver")
            .field("platforms", &self.platforms.len())
            .field("host_kernels", &names)
            .field("live_objects", &self.state.lock().live())
            .finish()
    }
}

impl Default for ReferenceDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`ReferenceDriver`].
pub struct ReferenceDriverBuilder {
    platforms: Option<Vec<PlatformSpec>>,
    host_kernels: HashMap<String, Arc<dyn HostKernel>>,
}

impl ReferenceDriverBuilder {
    /// Add a platform. The first call replaces the default topology.
    pub fn platform(mut self, spec: PlatformSpec) -> Self {
        self.platforms.get_or_insert_with(Vec::new).push(spec);
        self
    }

    /// A driver that reports no platforms at all.
    pub fn without_platforms(mut self) -> Self {
        self.platforms = Some(Vec::new());
        self
    }

    /// Register (or replace) the host implementation of entry point `name`.
    pub fn host_kernel(mut self, name: impl Into<String>, kernel: impl HostKernel + 'static) -> Self {
        self.host_kernels.insert(name.into(), Arc::new(kernel));
        self
    }

    pub fn build(self) -> ReferenceDriver {
        ReferenceDriver {
            platforms: materialize(self.platforms.unwrap_or_else(default_platforms)),
            host_kernels: self.host_kernels,
            state: Mutex::new(State::default()),
        }
    }
}

impl ReferenceDriver {
    /// Default topology (one platform with a GPU and a CPU device) and the
    /// builtin host kernels.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ReferenceDriverBuilder {
        ReferenceDriverBuilder { platforms: None, host_kernels: builtins::all() }
    }

    /// Every successful release, in order.
    pub fn release_log(&self) -> Vec<(ResourceKind, RawHandle)> {
        self.state.lock().released.clone()
    }

    /// Number of driver objects currently alive.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live()
    }

    /// Commands waiting on `queue`.
    pub fn pending_commands(&self, queue: RawHandle) -> usize {
        self.state.lock().queues.get(&queue.0).map_or(0, |q| q.pending.len())
    }

    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.platforms.iter().flat_map(|p| &p.devices).find(|d| d.id == id)
    }

    fn host_kernel_diagnostics(&self, kernels: &[signature::KernelSignature]) -> Vec<String> {
        kernels
            .iter()
            .filter(|k| !self.host_kernels.contains_key(&k.name))
            .map(|k| format!("<source>:{}:1: error: no host implementation for kernel '{}'", k.line, k.name))
            .collect()
    }
}

fn check_arg(param: &ParamKind, arg: &RawArg) -> Result<(), (Status, String)> {
    match (param, arg) {
        (ParamKind::Opaque { .. }, _) => Ok(()),
        (ParamKind::Buffer { .. }, RawArg::Buffer(_)) => Ok(()),
        (ParamKind::Local { .. }, RawArg::Local(0)) => {
            Err((status::INVALID_ARG_SIZE, "local allocation size must be non-zero".into()))
        }
        (ParamKind::Local { .. }, RawArg::Local(_)) => Ok(()),
        (ParamKind::Scalar(ty), RawArg::Scalar(s)) if s.to_ne_bytes().len() == ty.size() => Ok(()),
        (ParamKind::Scalar(ty), RawArg::Scalar(s)) => Err((
            status::INVALID_ARG_SIZE,
            format!("{} bytes given for {ty} ({} bytes)", s.to_ne_bytes().len(), ty.size()),
        )),
        (param, _) => Err((status::INVALID_ARG_VALUE, format!("argument does not match parameter type {param}"))),
    }
}

impl Driver for ReferenceDriver {
    fn name(&self) -> &str {
        "reference"
    }

    fn platforms(&self) -> DriverResult<Vec<Platform>> {
        Ok(self.platforms.iter().map(|p| p.platform.clone()).collect())
    }

    fn devices(&self, platform: PlatformId, filter: DeviceType) -> DriverResult<Vec<Device>> {
        let entry = self
            .platforms
            .iter()
            .find(|p| p.platform.id == platform)
            .ok_or_else(|| DriverError::new(status::INVALID_PLATFORM, format!("unknown platform {}", platform.0)))?;
        Ok(entry.devices.iter().filter(|d| d.matches(filter)).cloned().collect())
    }

    fn create_context(&self, devices: &[DeviceId]) -> DriverResult<RawHandle> {
        if devices.is_empty() {
            return Err(DriverError::new(status::INVALID_VALUE, "empty device list"));
        }
        let mut owners = Vec::with_capacity(devices.len());
        for id in devices {
            let device =
                self.device(*id).ok_or_else(|| DriverError::new(status::INVALID_DEVICE, format!("unknown device {}", id.0)))?;
            owners.push(device.platform);
        }
        if owners.iter().any(|p| *p != owners[0]) {
            return Err(DriverError::new(status::INVALID_DEVICE, "devices belong to different platforms"));
        }
        let mut state = self.state.lock();
        let handle = state.alloc();
        state.contexts.insert(handle, ContextEntry { devices: devices.to_vec() });
        Ok(RawHandle(handle))
    }

    fn create_program(&self, context: RawHandle, source: &str) -> DriverResult<RawHandle> {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.0) {
            return Err(DriverError::new(status::INVALID_CONTEXT, format!("unknown context {}", context.0)));
        }
        if source.is_empty() {
            return Err(DriverError::new(status::INVALID_VALUE, "empty program source"));
        }
        let handle = state.alloc();
        state.programs.insert(handle, ProgramEntry { context: context.0, source: source.to_string(), built: None });
        Ok(RawHandle(handle))
    }

    fn build_program(&self, program: RawHandle, devices: &[DeviceId], options: &str) -> BuildOutcome {
        let mut state = self.state.lock();
        let Some(entry) = state.programs.get(&program.0) else {
            return BuildOutcome { status: status::INVALID_PROGRAM, log: format!("unknown program {}", program.0) };
        };
        if state.kernels.values().any(|k| k.program == program.0) {
            return BuildOutcome {
                status: status::INVALID_OPERATION,
                log: "program has kernels attached and cannot be rebuilt".into(),
            };
        }
        let context_devices = state.contexts.get(&entry.context).map(|c| c.devices.as_slice()).unwrap_or_default();
        if let Some(stray) = devices.iter().find(|d| !context_devices.contains(d)) {
            return BuildOutcome {
                status: status::INVALID_DEVICE,
                log: format!("device {} is not part of the program's context", stray.0),
            };
        }
        if let Err(message) = signature::validate_options(options) {
            return BuildOutcome { status: status::INVALID_BUILD_OPTIONS, log: message };
        }

        let front = signature::analyze(&entry.source, options);
        let mut errors: Vec<String> = front.diagnostics.iter().map(ToString::to_string).collect();
        if errors.is_empty() {
            errors = self.host_kernel_diagnostics(&front.kernels);
        }
        if !errors.is_empty() {
            let log = errors.join("\n");
            debug!(program = program.0, errors = errors.len(), "build failed");
            if let Some(entry) = state.programs.get_mut(&program.0) {
                entry.built = None;
            }
            return BuildOutcome { status: status::BUILD_PROGRAM_FAILURE, log };
        }

        let kernels = front.kernels.into_iter().map(|k| (k.name, k.params.into_iter().map(|p| p.kind).collect())).collect();
        if let Some(entry) = state.programs.get_mut(&program.0) {
            entry.built = Some(kernels);
        }
        BuildOutcome { status: status::SUCCESS, log: String::new() }
    }

    fn kernel_names(&self, program: RawHandle) -> DriverResult<Vec<String>> {
        let state = self.state.lock();
        let entry = state
            .programs
            .get(&program.0)
            .ok_or_else(|| DriverError::new(status::INVALID_PROGRAM, format!("unknown program {}", program.0)))?;
        let built = entry
            .built
            .as_ref()
            .ok_or_else(|| DriverError::new(status::INVALID_PROGRAM_EXECUTABLE, "program is not built"))?;
        Ok(built.iter().map(|(name, _)| name.clone()).collect())
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> DriverResult<RawHandle> {
        let mut state = self.state.lock();
        let entry = state
            .programs
            .get(&program.0)
            .ok_or_else(|| DriverError::new(status::INVALID_PROGRAM, format!("unknown program {}", program.0)))?;
        let built = entry
            .built
            .as_ref()
            .ok_or_else(|| DriverError::new(status::INVALID_PROGRAM_EXECUTABLE, "program is not built"))?;
        let params = built
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, params)| params.clone())
            .ok_or_else(|| DriverError::new(status::INVALID_KERNEL_NAME, format!("no kernel named '{name}'")))?;
        let imp = self
            .host_kernels
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::new(status::INVALID_KERNEL_NAME, format!("no host implementation for '{name}'")))?;
        let context = entry.context;
        let handle = state.alloc();
        let args = vec![None; params.len()];
        state.kernels.insert(handle, KernelEntry { program: program.0, context, name: name.to_string(), params, args, imp });
        Ok(RawHandle(handle))
    }

    fn kernel_arity(&self, kernel: RawHandle) -> DriverResult<usize> {
        let state = self.state.lock();
        state
            .kernels
            .get(&kernel.0)
            .map(|k| k.params.len())
            .ok_or_else(|| DriverError::new(status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: RawArg) -> DriverResult<()> {
        let mut state = self.state.lock();
        let State { kernels, buffers, .. } = &mut *state;
        let entry = kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| DriverError::new(status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;
        let slot = index as usize;
        let param = entry.params.get(slot).ok_or_else(|| {
            DriverError::new(status::INVALID_ARG_INDEX, format!("kernel '{}' has {} arguments", entry.name, entry.params.len()))
        })?;
        check_arg(param, &arg).map_err(|(status, message)| DriverError::new(status, message))?;
        let bound = match arg {
            RawArg::Buffer(handle) => {
                match buffers.get(&handle.0) {
                    Some(b) if b.context == entry.context => {}
                    _ => {
                        return Err(DriverError::new(
                            status::INVALID_MEM_OBJECT,
                            format!("buffer {} is not a live buffer of the kernel's context", handle.0),
                        ))
                    }
                }
                BoundArg::Buffer(handle.0)
            }
            RawArg::Scalar(s) => BoundArg::Bytes(s.to_ne_bytes()),
            RawArg::Local(size) => BoundArg::Local(size),
        };
        entry.args[slot] = Some(bound);
        Ok(())
    }

    fn create_buffer(
        &self,
        context: RawHandle,
        mode: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<RawHandle> {
        let mut state = self.state.lock();
        let ctx = state
            .contexts
            .get(&context.0)
            .ok_or_else(|| DriverError::new(status::INVALID_CONTEXT, format!("unknown context {}", context.0)))?;
        if size == 0 {
            return Err(DriverError::new(status::INVALID_BUFFER_SIZE, "buffer size is zero"));
        }
        if host.is_some_and(|h| h.len() != size) {
            return Err(DriverError::new(status::INVALID_HOST_PTR, "host data length differs from buffer size"));
        }
        let limit = ctx.devices.iter().filter_map(|id| self.device(*id)).map(|d| d.global_mem_bytes).min().unwrap_or(0);
        if size as u64 > limit {
            return Err(DriverError::new(
                status::MEM_OBJECT_ALLOCATION_FAILURE,
                format!("{size} bytes exceeds device memory of {limit} bytes"),
            ));
        }
        let data = host.map_or_else(|| vec![0; size], <[u8]>::to_vec);
        let handle = state.alloc();
        state.buffers.insert(handle, BufferEntry { context: context.0, mode, data });
        Ok(RawHandle(handle))
    }

    fn create_queue(&self, context: RawHandle, device: DeviceId) -> DriverResult<RawHandle> {
        let mut state = self.state.lock();
        let ctx = state
            .contexts
            .get(&context.0)
            .ok_or_else(|| DriverError::new(status::INVALID_CONTEXT, format!("unknown context {}", context.0)))?;
        if !ctx.devices.contains(&device) {
            return Err(DriverError::new(status::INVALID_DEVICE, format!("device {} is not part of the context", device.0)));
        }
        let handle = state.alloc();
        state.queues.insert(handle, QueueEntry { context: context.0, device, pending: VecDeque::new() });
        Ok(RawHandle(handle))
    }

    fn enqueue_write(&self, queue: RawHandle, buffer: RawHandle, data: &[u8], blocking: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        let context = state.queue(queue)?.context;
        let size = state.buffer_in(buffer, context)?.data.len();
        if data.len() > size {
            return Err(DriverError::new(status::INVALID_VALUE, format!("write of {} bytes into {size}-byte buffer", data.len())));
        }
        state.push(queue, Command::Write { buffer: buffer.0, data: data.to_vec() }, blocking)
    }

    fn enqueue_read(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        sink: Arc<dyn HostSink>,
        blocking: bool,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let context = state.queue(queue)?.context;
        let size = state.buffer_in(buffer, context)?.data.len();
        if sink.byte_len() > size {
            return Err(DriverError::new(
                status::INVALID_VALUE,
                format!("read of {} bytes from {size}-byte buffer", sink.byte_len()),
            ));
        }
        state.push(queue, Command::Read { buffer: buffer.0, sink }, blocking)
    }

    fn enqueue_kernel(&self, queue: RawHandle, kernel: RawHandle, range: &NdRange) -> DriverResult<()> {
        let mut state = self.state.lock();
        let q = state.queue(queue)?;
        let (context, device_id) = (q.context, q.device);
        let entry = state
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| DriverError::new(status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0)))?;
        if entry.context != context {
            return Err(DriverError::new(status::INVALID_CONTEXT, "kernel and queue belong to different contexts"));
        }
        let args = entry
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                a.clone().ok_or_else(|| {
                    DriverError::new(status::INVALID_KERNEL_ARGS, format!("argument {i} of kernel '{}' is not set", entry.name))
                })
            })
            .collect::<DriverResult<Vec<_>>>()?;

        let device = self
            .device(device_id)
            .ok_or_else(|| DriverError::new(status::INVALID_DEVICE, format!("unknown device {}", device_id.0)))?;
        let local = match range.local() {
            Some(l) => l.to_vec(),
            None => default_local_size(range.global(), device.max_work_group_size),
        };
        let items: usize = local.iter().product();
        if items > device.max_work_group_size {
            return Err(DriverError::new(
                status::INVALID_WORK_GROUP_SIZE,
                format!("{items} work-items per group exceeds {}", device.max_work_group_size),
            ));
        }
        if local.iter().zip(&device.max_work_item_sizes).any(|(l, max)| l > max) {
            return Err(DriverError::new(
                status::INVALID_WORK_ITEM_SIZE,
                format!("local size {local:?} exceeds per-dimension limits {:?}", device.max_work_item_sizes),
            ));
        }

        let launch = Launch { name: entry.name.clone(), imp: Arc::clone(&entry.imp), args, range: range.with_local(local) };
        state.push(queue, Command::Launch(launch), false)
    }

    fn enqueue_barrier(&self, queue: RawHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.queue(queue)?;
        state.push(queue, Command::Barrier, false)
    }

    fn finish(&self, queue: RawHandle) -> DriverResult<()> {
        self.state.lock().flush(queue.0)
    }

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let found = match kind {
            ResourceKind::Context => {
                let found = state.contexts.remove(&handle.0).is_some();
                if found {
                    state.invalidate_context(handle.0);
                }
                found
            }
            ResourceKind::Program => {
                let found = state.programs.remove(&handle.0).is_some();
                if found {
                    state.kernels.retain(|_, k| k.program != handle.0);
                }
                found
            }
            ResourceKind::Kernel => state.kernels.remove(&handle.0).is_some(),
            ResourceKind::Buffer => state.buffers.remove(&handle.0).is_some(),
            ResourceKind::Queue => state.queues.remove(&handle.0).is_some(),
        };
        if !found {
            let code = match kind {
                ResourceKind::Context => status::INVALID_CONTEXT,
                ResourceKind::Program => status::INVALID_PROGRAM,
                ResourceKind::Kernel => status::INVALID_KERNEL,
                ResourceKind::Buffer => status::INVALID_MEM_OBJECT,
                ResourceKind::Queue => status::INVALID_COMMAND_QUEUE,
            };
            return Err(DriverError::new(code, format!("{kind} {} is not live", handle.0)));
        }
        state.released.push((kind, handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Scalar;

    const DOUBLE: &str = "__kernel void double_it(__global int *data) { }";

    fn doubling_driver() -> ReferenceDriver {
        ReferenceDriver::builder()
            .host_kernel("double_it", |item: &WorkItem, args: &mut KernelArgs| {
                let i = item.global_id(0);
                let v: i32 = args.load(0, i)?;
                args.store(0, i, v * 2)
            })
            .build()
    }

    struct Fixture {
        ctx: RawHandle,
        queue: RawHandle,
        device: DeviceId,
    }

    fn fixture(driver: &ReferenceDriver) -> Fixture {
        let platform = driver.platforms().unwrap()[0].id;
        let device = driver.devices(platform, DeviceType::GPU).unwrap()[0].id;
        let ctx = driver.create_context(&[device]).unwrap();
        let queue = driver.create_queue(ctx, device).unwrap();
        Fixture { ctx, queue, device }
    }

    fn built_kernel(driver: &ReferenceDriver, f: &Fixture, source: &str, name: &str) -> RawHandle {
        let program = driver.create_program(f.ctx, source).unwrap();
        let outcome = driver.build_program(program, &[f.device], "");
        assert!(outcome.is_success(), "{}", outcome.log);
        driver.create_kernel(program, name).unwrap()
    }

    struct Collect(Mutex<Vec<u8>>);

    impl HostSink for Collect {
        fn byte_len(&self) -> usize {
            self.0.lock().len()
        }
        fn store(&self, bytes: &[u8]) {
            self.0.lock().copy_from_slice(bytes);
        }
    }

    #[test]
    fn default_topology_has_gpu_and_cpu() {
        let driver = ReferenceDriver::new();
        let platforms = driver.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        let all = driver.devices(platforms[0].id, DeviceType::ALL).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].matches(DeviceType::DEFAULT));
        assert!(all[1].matches(DeviceType::CPU));
        assert!(driver.devices(platforms[0].id, DeviceType::ACCELERATOR).unwrap().is_empty());
    }

    #[test]
    fn commands_run_lazily_at_finish() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let buf = driver.create_buffer(f.ctx, AccessMode::ReadWrite, 8, Some(bytemuck::cast_slice(&[3i32, 4]))).unwrap();
        driver.set_kernel_arg(kernel, 0, RawArg::Buffer(buf)).unwrap();
        driver.enqueue_kernel(f.queue, kernel, &NdRange::linear(2, None).unwrap()).unwrap();
        let sink = Arc::new(Collect(Mutex::new(vec![0; 8])));
        driver.enqueue_read(f.queue, buf, sink.clone(), false).unwrap();
        assert_eq!(driver.pending_commands(f.queue), 2);
        assert_eq!(*sink.0.lock(), vec![0; 8]);
        driver.finish(f.queue).unwrap();
        assert_eq!(driver.pending_commands(f.queue), 0);
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, i32>(&sink.0.lock()), vec![6, 8]);
    }

    #[test]
    fn missing_host_kernel_fails_build_with_log() {
        let driver = ReferenceDriver::new();
        let f = fixture(&driver);
        let program = driver.create_program(f.ctx, "__kernel void mystery(__global int *x) {}").unwrap();
        let outcome = driver.build_program(program, &[f.device], "");
        assert_eq!(outcome.status, status::BUILD_PROGRAM_FAILURE);
        assert!(outcome.log.contains("mystery"), "{}", outcome.log);
        let err = driver.kernel_names(program).unwrap_err();
        assert_eq!(err.status, status::INVALID_PROGRAM_EXECUTABLE);
    }

    #[test]
    fn bad_build_options_are_reported() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let program = driver.create_program(f.ctx, DOUBLE).unwrap();
        let outcome = driver.build_program(program, &[f.device], "--bogus");
        assert_eq!(outcome.status, status::INVALID_BUILD_OPTIONS);
    }

    #[test]
    fn unset_argument_blocks_enqueue() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let err = driver.enqueue_kernel(f.queue, kernel, &NdRange::linear(1, None).unwrap()).unwrap_err();
        assert_eq!(err.status, status::INVALID_KERNEL_ARGS);
        assert!(!err.deferred);
    }

    #[test]
    fn argument_types_are_checked() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let err = driver.set_kernel_arg(kernel, 0, RawArg::Scalar(Scalar::I32(1))).unwrap_err();
        assert_eq!(err.status, status::INVALID_ARG_VALUE);
        let err = driver.set_kernel_arg(kernel, 1, RawArg::Local(4)).unwrap_err();
        assert_eq!(err.status, status::INVALID_ARG_INDEX);
    }

    #[test]
    fn fault_drops_rest_of_batch_and_reports_once() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let buf = driver.create_buffer(f.ctx, AccessMode::ReadWrite, 4, Some(&1i32.to_ne_bytes()[..])).unwrap();
        driver.set_kernel_arg(kernel, 0, RawArg::Buffer(buf)).unwrap();
        // two work-items over a one-element buffer
        driver.enqueue_kernel(f.queue, kernel, &NdRange::linear(2, Some(1)).unwrap()).unwrap();
        driver.enqueue_write(f.queue, buf, &[9, 9, 9, 9], false).unwrap();

        let err = driver.finish(f.queue).unwrap_err();
        assert!(err.deferred);
        assert_eq!(err.status, status::OUT_OF_RESOURCES);
        driver.finish(f.queue).unwrap();

        let sink = Arc::new(Collect(Mutex::new(vec![0; 4])));
        driver.enqueue_read(f.queue, buf, sink.clone(), true).unwrap();
        assert_eq!(*sink.0.lock(), 2i32.to_ne_bytes().to_vec());
    }

    #[test]
    fn oversized_work_group_is_rejected() {
        let driver = ReferenceDriver::builder()
            .platform(PlatformSpec::new("small").device(DeviceSpec::gpu("tiny").max_work_group_size(4)))
            .host_kernel("double_it", |_: &WorkItem, _: &mut KernelArgs| Ok::<(), KernelFault>(()))
            .build();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let buf = driver.create_buffer(f.ctx, AccessMode::ReadWrite, 64, None).unwrap();
        driver.set_kernel_arg(kernel, 0, RawArg::Buffer(buf)).unwrap();
        let err = driver.enqueue_kernel(f.queue, kernel, &NdRange::linear(16, Some(8)).unwrap()).unwrap_err();
        assert_eq!(err.status, status::INVALID_WORK_GROUP_SIZE);
        driver.enqueue_kernel(f.queue, kernel, &NdRange::linear(16, None).unwrap()).unwrap();
    }

    #[test]
    fn allocation_beyond_device_memory_fails() {
        let driver = ReferenceDriver::builder()
            .platform(PlatformSpec::new("p").device(DeviceSpec::gpu("g").global_mem_bytes(1024)))
            .build();
        let f = fixture(&driver);
        let err = driver.create_buffer(f.ctx, AccessMode::ReadWrite, 2048, None).unwrap_err();
        assert_eq!(err.status, status::MEM_OBJECT_ALLOCATION_FAILURE);
    }

    #[test]
    fn context_release_invalidates_children() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let kernel = built_kernel(&driver, &f, DOUBLE, "double_it");
        let buf = driver.create_buffer(f.ctx, AccessMode::ReadWrite, 4, None).unwrap();
        driver.release(ResourceKind::Context, f.ctx).unwrap();
        assert_eq!(driver.live_objects(), 0);
        assert_eq!(driver.set_kernel_arg(kernel, 0, RawArg::Buffer(buf)).unwrap_err().status, status::INVALID_KERNEL);
        assert_eq!(driver.release(ResourceKind::Buffer, buf).unwrap_err().status, status::INVALID_MEM_OBJECT);
        assert_eq!(driver.release_log(), vec![(ResourceKind::Context, f.ctx)]);
    }

    #[test]
    fn rebuild_with_attached_kernels_is_refused() {
        let driver = doubling_driver();
        let f = fixture(&driver);
        let program = driver.create_program(f.ctx, DOUBLE).unwrap();
        assert!(driver.build_program(program, &[f.device], "").is_success());
        let _kernel = driver.create_kernel(program, "double_it").unwrap();
        assert_eq!(driver.build_program(program, &[f.device], "").status, status::INVALID_OPERATION);
    }
}
