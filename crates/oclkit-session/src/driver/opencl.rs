//! OpenCL ICD driver via the `opencl3` crate.
//!
//! Objects live in handle tables inside the driver; the session layer only
//! ever sees [`RawHandle`]s. Non-blocking transfers keep their host staging
//! memory alive in the queue slot until the next `finish`.

use super::{
    BuildOutcome, DeviceId, Driver, DriverError, DriverResult, HostSink, PlatformId, RawArg, RawHandle,
    ResourceKind,
};
use crate::buffer::AccessMode;
use crate::kernel::Scalar;
use crate::platform::{Device, DeviceType, Platform};
use crate::queue::NdRange;
use crate::status;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::Device as ClDevice;
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::{get_platforms, Platform as ClPlatform};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, CL_BLOCKING, CL_NON_BLOCKING};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

fn cl_err(e: ClError, what: &str) -> DriverError {
    DriverError::new(e.0, format!("{what}: {e}"))
}

fn lookup<'a, T>(map: &'a HashMap<u64, T>, handle: RawHandle, kind: ResourceKind) -> DriverResult<&'a T> {
    map.get(&handle.0).ok_or_else(|| unknown(kind, handle))
}

fn unknown(kind: ResourceKind, handle: RawHandle) -> DriverError {
    let code = match kind {
        ResourceKind::Context => status::INVALID_CONTEXT,
        ResourceKind::Program => status::INVALID_PROGRAM,
        ResourceKind::Kernel => status::INVALID_KERNEL,
        ResourceKind::Buffer => status::INVALID_MEM_OBJECT,
        ResourceKind::Queue => status::INVALID_COMMAND_QUEUE,
    };
    DriverError::new(code, format!("unknown {kind} {}", handle.0))
}

struct ContextSlot {
    context: Context,
    devices: Vec<cl_device_id>,
}

struct QueueSlot {
    queue: CommandQueue,
    /// Host memory of in-flight non-blocking writes.
    staged_writes: Vec<Vec<u8>>,
    /// Host memory of in-flight non-blocking reads, delivered at `finish`.
    staged_reads: Vec<(Vec<u8>, Arc<dyn HostSink>)>,
}

#[derive(Default)]
struct Tables {
    next: u64,
    contexts: HashMap<u64, ContextSlot>,
    programs: HashMap<u64, Program>,
    kernels: HashMap<u64, Kernel>,
    buffers: HashMap<u64, Buffer<u8>>,
    queues: HashMap<u64, QueueSlot>,
}

impl Tables {
    fn alloc(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// Driver backed by the system OpenCL ICD loader.
pub struct OpenClDriver {
    tables: Mutex<Tables>,
}

// SAFETY: every OpenCL object is only touched while holding the table lock,
// and the OpenCL runtime allows its handles to be used from any thread.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

impl fmt::Debug for OpenClDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.tables.lock();
        f.debug_struct("OpenClDriver")
            .field("contexts", &t.contexts.len())
            .field("buffers", &t.buffers.len())
            .field("queues", &t.queues.len())
            .finish()
    }
}

impl Default for OpenClDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenClDriver {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }

    fn describe_device(id: cl_device_id, platform: PlatformId) -> DriverResult<Device> {
        let d = ClDevice::new(id);
        let q = |e: ClError| cl_err(e, "device query");
        Ok(Device {
            id: DeviceId(id as u64),
            platform,
            name: d.name().map_err(q)?,
            vendor: d.vendor().map_err(q)?,
            vendor_id: d.vendor_id().map_err(q)?,
            device_type: DeviceType::from_bits_truncate(d.dev_type().map_err(q)?),
            compute_units: d.max_compute_units().map_err(q)?,
            max_work_group_size: d.max_work_group_size().map_err(q)?,
            max_work_item_sizes: d.max_work_item_sizes().map_err(q)?,
            global_mem_bytes: d.global_mem_size().map_err(q)?,
            driver_version: d.driver_version().map_err(q)?,
            version: d.version().map_err(q)?,
        })
    }
}

fn raw_devices(devices: &[DeviceId]) -> Vec<cl_device_id> {
    devices.iter().map(|d| d.0 as cl_device_id).collect()
}

impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> DriverResult<Vec<Platform>> {
        let platforms = get_platforms().map_err(|e| cl_err(e, "clGetPlatformIDs"))?;
        platforms
            .iter()
            .map(|p| {
                let q = |e: ClError| cl_err(e, "platform query");
                Ok(Platform {
                    id: PlatformId(p.id() as u64),
                    name: p.name().map_err(q)?,
                    vendor: p.vendor().map_err(q)?,
                    version: p.version().map_err(q)?,
                    profile: p.profile().map_err(q)?,
                    extensions: p.extensions().map_err(q)?.split_whitespace().map(String::from).collect(),
                })
            })
            .collect()
    }

    fn devices(&self, platform: PlatformId, filter: DeviceType) -> DriverResult<Vec<Device>> {
        let p = ClPlatform::new(platform.0 as _);
        let ids = match p.get_devices(filter.bits()) {
            Ok(ids) => ids,
            Err(e) if e.0 == status::DEVICE_NOT_FOUND => return Ok(Vec::new()),
            Err(e) => return Err(cl_err(e, "clGetDeviceIDs")),
        };
        ids.into_iter().map(|id| Self::describe_device(id, platform)).collect()
    }

    fn create_context(&self, devices: &[DeviceId]) -> DriverResult<RawHandle> {
        let ids = raw_devices(devices);
        let context =
            Context::from_devices(&ids, &[], None, ptr::null_mut()).map_err(|e| cl_err(e, "clCreateContext"))?;
        let mut t = self.tables.lock();
        let h = t.alloc();
        t.contexts.insert(h, ContextSlot { context, devices: ids });
        Ok(RawHandle(h))
    }

    fn create_program(&self, context: RawHandle, source: &str) -> DriverResult<RawHandle> {
        let mut t = self.tables.lock();
        let ctx = lookup(&t.contexts, context, ResourceKind::Context)?;
        let program =
            Program::create_from_source(&ctx.context, source).map_err(|e| cl_err(e, "clCreateProgramWithSource"))?;
        let h = t.alloc();
        t.programs.insert(h, program);
        Ok(RawHandle(h))
    }

    fn build_program(&self, program: RawHandle, devices: &[DeviceId], options: &str) -> BuildOutcome {
        let mut t = self.tables.lock();
        let Some(p) = t.programs.get_mut(&program.0) else {
            return BuildOutcome { status: status::INVALID_PROGRAM, log: format!("unknown program {}", program.0) };
        };
        let ids = raw_devices(devices);
        let result = p.build(&ids, options);
        let log = ids
            .iter()
            .filter_map(|id| p.get_build_log(*id).ok())
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        match result {
            Ok(()) => BuildOutcome { status: status::SUCCESS, log },
            Err(e) => BuildOutcome { status: e.0, log },
        }
    }

    fn kernel_names(&self, program: RawHandle) -> DriverResult<Vec<String>> {
        let t = self.tables.lock();
        let p = lookup(&t.programs, program, ResourceKind::Program)?;
        let names = p.get_kernel_names().map_err(|e| cl_err(e, "CL_PROGRAM_KERNEL_NAMES"))?;
        Ok(names.split(';').map(str::trim).filter(|n| !n.is_empty()).map(String::from).collect())
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> DriverResult<RawHandle> {
        let mut t = self.tables.lock();
        let p = lookup(&t.programs, program, ResourceKind::Program)?;
        let kernel = Kernel::create(p, name).map_err(|e| cl_err(e, "clCreateKernel"))?;
        let h = t.alloc();
        t.kernels.insert(h, kernel);
        Ok(RawHandle(h))
    }

    fn kernel_arity(&self, kernel: RawHandle) -> DriverResult<usize> {
        let t = self.tables.lock();
        let k = lookup(&t.kernels, kernel, ResourceKind::Kernel)?;
        Ok(k.num_args().map_err(|e| cl_err(e, "CL_KERNEL_NUM_ARGS"))? as usize)
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: RawArg) -> DriverResult<()> {
        let t = self.tables.lock();
        let k = lookup(&t.kernels, kernel, ResourceKind::Kernel)?;
        // SAFETY: argument values are plain data or live cl_mem handles owned
        // by this driver; the runtime copies them before returning.
        let result = unsafe {
            match arg {
                RawArg::Buffer(b) => {
                    let buffer = lookup(&t.buffers, b, ResourceKind::Buffer)?;
                    k.set_arg(index, &buffer.get())
                }
                RawArg::Local(size) => k.set_arg_local_buffer(index, size),
                RawArg::Scalar(s) => match s {
                    Scalar::I8(v) => k.set_arg(index, &v),
                    Scalar::U8(v) => k.set_arg(index, &v),
                    Scalar::I16(v) => k.set_arg(index, &v),
                    Scalar::U16(v) => k.set_arg(index, &v),
                    Scalar::I32(v) => k.set_arg(index, &v),
                    Scalar::U32(v) => k.set_arg(index, &v),
                    Scalar::I64(v) => k.set_arg(index, &v),
                    Scalar::U64(v) => k.set_arg(index, &v),
                    Scalar::F32(v) => k.set_arg(index, &v),
                    Scalar::F64(v) => k.set_arg(index, &v),
                },
            }
        };
        result.map_err(|e| cl_err(e, "clSetKernelArg"))
    }

    fn create_buffer(
        &self,
        context: RawHandle,
        mode: AccessMode,
        size: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<RawHandle> {
        let mut t = self.tables.lock();
        let ctx = lookup(&t.contexts, context, ResourceKind::Context)?;
        let mut flags = match mode {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        };
        let host_ptr = match host {
            Some(data) => {
                flags |= CL_MEM_COPY_HOST_PTR;
                data.as_ptr() as *mut _
            }
            None => ptr::null_mut(),
        };
        // SAFETY: with CL_MEM_COPY_HOST_PTR the runtime copies `size` bytes
        // from `host_ptr` before returning, and the caller checked the length.
        let buffer = unsafe { Buffer::<u8>::create(&ctx.context, flags, size, host_ptr) }
            .map_err(|e| cl_err(e, "clCreateBuffer"))?;
        let h = t.alloc();
        t.buffers.insert(h, buffer);
        Ok(RawHandle(h))
    }

    fn create_queue(&self, context: RawHandle, device: DeviceId) -> DriverResult<RawHandle> {
        let mut t = self.tables.lock();
        let ctx = lookup(&t.contexts, context, ResourceKind::Context)?;
        if ctx.devices.first() != Some(&(device.0 as cl_device_id)) {
            return Err(DriverError::new(
                status::INVALID_DEVICE,
                "queues can only be created on the context's first device",
            ));
        }
        let queue = CommandQueue::create_default_with_properties(&ctx.context, 0, 0)
            .map_err(|e| cl_err(e, "clCreateCommandQueue"))?;
        let h = t.alloc();
        t.queues.insert(h, QueueSlot { queue, staged_writes: Vec::new(), staged_reads: Vec::new() });
        Ok(RawHandle(h))
    }

    fn enqueue_write(&self, queue: RawHandle, buffer: RawHandle, data: &[u8], blocking: bool) -> DriverResult<()> {
        let mut guard = self.tables.lock();
        let Tables { buffers, queues, .. } = &mut *guard;
        let q = queues.get_mut(&queue.0).ok_or_else(|| unknown(ResourceKind::Queue, queue))?;
        let b = buffers.get_mut(&buffer.0).ok_or_else(|| unknown(ResourceKind::Buffer, buffer))?;
        let staged = data.to_vec();
        let flag = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        // SAFETY: `staged` is kept in the queue slot until the queue finishes.
        unsafe { q.queue.enqueue_write_buffer(b, flag, 0, &staged, &[]) }
            .map_err(|e| cl_err(e, "clEnqueueWriteBuffer"))?;
        if !blocking {
            q.staged_writes.push(staged);
        }
        Ok(())
    }

    fn enqueue_read(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        sink: Arc<dyn HostSink>,
        blocking: bool,
    ) -> DriverResult<()> {
        let mut guard = self.tables.lock();
        let Tables { buffers, queues, .. } = &mut *guard;
        let q = queues.get_mut(&queue.0).ok_or_else(|| unknown(ResourceKind::Queue, queue))?;
        let b = buffers.get(&buffer.0).ok_or_else(|| unknown(ResourceKind::Buffer, buffer))?;
        let mut staged = vec![0u8; sink.byte_len()];
        let flag = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        // SAFETY: the heap block of `staged` does not move when the Vec is
        // pushed into the queue slot, and stays alive until `finish`.
        unsafe { q.queue.enqueue_read_buffer(b, flag, 0, &mut staged, &[]) }.map_err(|e| {
            let code = e.0;
            let mut err = cl_err(e, "clEnqueueReadBuffer");
            err.deferred = blocking && code == status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST;
            err
        })?;
        if blocking {
            sink.store(&staged);
        } else {
            q.staged_reads.push((staged, sink));
        }
        Ok(())
    }

    fn enqueue_kernel(&self, queue: RawHandle, kernel: RawHandle, range: &NdRange) -> DriverResult<()> {
        let t = self.tables.lock();
        let q = lookup(&t.queues, queue, ResourceKind::Queue)?;
        let k = lookup(&t.kernels, kernel, ResourceKind::Kernel)?;
        let local = range.local();
        // SAFETY: the size arrays outlive the call and have `dims` entries.
        unsafe {
            q.queue.enqueue_nd_range_kernel(
                k.get(),
                range.dims() as u32,
                ptr::null(),
                range.global().as_ptr(),
                local.map_or(ptr::null(), <[usize]>::as_ptr),
                &[],
            )
        }
        .map_err(|e| cl_err(e, "clEnqueueNDRangeKernel"))?;
        debug!(global = ?range.global(), "nd-range enqueued");
        Ok(())
    }

    fn enqueue_barrier(&self, queue: RawHandle) -> DriverResult<()> {
        let t = self.tables.lock();
        let q = lookup(&t.queues, queue, ResourceKind::Queue)?;
        // SAFETY: empty wait list.
        unsafe { q.queue.enqueue_barrier_with_wait_list(&[]) }.map_err(|e| cl_err(e, "clEnqueueBarrier"))?;
        Ok(())
    }

    fn finish(&self, queue: RawHandle) -> DriverResult<()> {
        let mut t = self.tables.lock();
        let q = t.queues.get_mut(&queue.0).ok_or_else(|| unknown(ResourceKind::Queue, queue))?;
        let result = q.queue.finish();
        q.staged_writes.clear();
        let reads = std::mem::take(&mut q.staged_reads);
        result.map_err(|e| {
            warn!(error = %e, "queue finish failed");
            DriverError::deferred(e.0, format!("clFinish: {e}"))
        })?;
        for (bytes, sink) in reads {
            sink.store(&bytes);
        }
        Ok(())
    }

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> DriverResult<()> {
        let mut t = self.tables.lock();
        let found = match kind {
            ResourceKind::Context => t.contexts.remove(&handle.0).is_some(),
            ResourceKind::Program => t.programs.remove(&handle.0).is_some(),
            ResourceKind::Kernel => t.kernels.remove(&handle.0).is_some(),
            ResourceKind::Buffer => t.buffers.remove(&handle.0).is_some(),
            ResourceKind::Queue => match t.queues.remove(&handle.0) {
                Some(slot) => {
                    // pending transfers still reference the staging memory
                    if let Err(e) = slot.queue.finish() {
                        warn!(handle = handle.0, error = %e, "queue finish before release failed");
                    }
                    true
                }
                None => false,
            },
        };
        if found {
            Ok(())
        } else {
            Err(unknown(kind, handle))
        }
    }
}
