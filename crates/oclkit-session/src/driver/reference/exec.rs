//! Host execution of kernel launches.

use super::BufferEntry;
use crate::buffer::AccessMode;
use crate::driver::{DriverError, DriverResult};
use crate::queue::NdRange;
use crate::status;
use bytemuck::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Host implementation of a kernel entry point, called once per work-item.
pub trait HostKernel: Send + Sync {
    fn execute(&self, item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault>;
}

impl<F> HostKernel for F
where
    F: Fn(&WorkItem, &mut KernelArgs) -> Result<(), KernelFault> + Send + Sync,
{
    fn execute(&self, item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
        self(item, args)
    }
}

/// Fault raised by a host kernel. Reported as a deferred device fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelFault {
    #[error("argument {slot}: index {index} out of bounds (length {len})")]
    OutOfBounds { slot: usize, index: usize, len: usize },

    #[error("argument {slot}: store to read-only buffer")]
    WriteToReadOnly { slot: usize },

    #[error("argument {slot}: expected {expected}")]
    ArgumentKind { slot: usize, expected: String },

    #[error("argument {slot} was not supplied")]
    MissingArgument { slot: usize },

    #[error("trap: {0}")]
    Trap(String),
}

/// Position of one work-item in the launch, mirroring the OpenCL work-item
/// built-ins. Dimensions beyond the launch report id 0 and size 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    global_id: [usize; 3],
    local_id: [usize; 3],
    group_id: [usize; 3],
    global_size: [usize; 3],
    local_size: [usize; 3],
    dims: usize,
}

impl WorkItem {
    pub fn work_dim(&self) -> usize {
        self.dims
    }

    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id.get(dim).copied().unwrap_or(0)
    }

    pub fn local_id(&self, dim: usize) -> usize {
        self.local_id.get(dim).copied().unwrap_or(0)
    }

    pub fn group_id(&self, dim: usize) -> usize {
        self.group_id.get(dim).copied().unwrap_or(0)
    }

    pub fn global_size(&self, dim: usize) -> usize {
        self.global_size.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> usize {
        self.local_size.get(dim).copied().unwrap_or(1)
    }

    pub fn num_groups(&self, dim: usize) -> usize {
        self.global_size(dim) / self.local_size(dim)
    }

    /// Row-major linear index of the work-item.
    pub fn global_linear_id(&self) -> usize {
        (self.global_id[2] * self.global_size[1] + self.global_id[1]) * self.global_size[0] + self.global_id[0]
    }
}

/// Argument value captured at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum BoundArg {
    Buffer(u64),
    Bytes(Vec<u8>),
    Local(usize),
}

enum Slot {
    Buffer(usize),
    Scalar(Vec<u8>),
    Local(Vec<u8>),
}

struct Taken {
    handle: u64,
    entry: BufferEntry,
}

/// Arguments of a running launch as seen by a [`HostKernel`].
pub struct KernelArgs {
    slots: Vec<Slot>,
    buffers: Vec<Taken>,
}

impl KernelArgs {
    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    fn bytes(&self, slot: usize) -> Result<&[u8], KernelFault> {
        match self.slots.get(slot) {
            Some(Slot::Buffer(pos)) => Ok(&self.buffers[*pos].entry.data),
            Some(Slot::Local(data)) => Ok(data),
            Some(Slot::Scalar(_)) => Err(KernelFault::ArgumentKind { slot, expected: "buffer or local memory".into() }),
            None => Err(KernelFault::MissingArgument { slot }),
        }
    }

    fn bytes_mut(&mut self, slot: usize) -> Result<&mut [u8], KernelFault> {
        match self.slots.get_mut(slot) {
            Some(Slot::Buffer(pos)) => {
                let taken = &mut self.buffers[*pos];
                if taken.entry.mode == AccessMode::ReadOnly {
                    return Err(KernelFault::WriteToReadOnly { slot });
                }
                Ok(&mut taken.entry.data)
            }
            Some(Slot::Local(data)) => Ok(data),
            Some(Slot::Scalar(_)) => Err(KernelFault::ArgumentKind { slot, expected: "buffer or local memory".into() }),
            None => Err(KernelFault::MissingArgument { slot }),
        }
    }

    /// Number of `T` elements in a buffer or local argument.
    pub fn len<T: Pod>(&self, slot: usize) -> Result<usize, KernelFault> {
        Ok(self.bytes(slot)?.len() / std::mem::size_of::<T>())
    }

    pub fn load<T: Pod>(&self, slot: usize, index: usize) -> Result<T, KernelFault> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes(slot)?;
        let range = element_range(bytes.len(), size, slot, index)?;
        Ok(bytemuck::pod_read_unaligned(&bytes[range]))
    }

    pub fn store<T: Pod>(&mut self, slot: usize, index: usize, value: T) -> Result<(), KernelFault> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes_mut(slot)?;
        let range = element_range(bytes.len(), size, slot, index)?;
        bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    pub fn scalar<T: Pod>(&self, slot: usize) -> Result<T, KernelFault> {
        let size = std::mem::size_of::<T>();
        match self.slots.get(slot) {
            Some(Slot::Scalar(bytes)) if bytes.len() == size => Ok(bytemuck::pod_read_unaligned(bytes)),
            Some(_) => Err(KernelFault::ArgumentKind { slot, expected: format!("scalar of {size} bytes") }),
            None => Err(KernelFault::MissingArgument { slot }),
        }
    }

    fn reset_local(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Local(data) = slot {
                data.fill(0);
            }
        }
    }
}

fn element_range(byte_len: usize, size: usize, slot: usize, index: usize) -> Result<std::ops::Range<usize>, KernelFault> {
    let len = byte_len / size.max(1);
    if index >= len {
        return Err(KernelFault::OutOfBounds { slot, index, len });
    }
    Ok(index * size..(index + 1) * size)
}

/// A kernel launch waiting in a queue.
pub(super) struct Launch {
    pub(super) name: String,
    pub(super) imp: Arc<dyn HostKernel>,
    pub(super) args: Vec<BoundArg>,
    /// Range with the work-group size resolved.
    pub(super) range: NdRange,
}

/// Run `launch` against the driver's buffer table.
///
/// Buffers are moved out of the table for the duration of the launch and
/// always put back, including after a fault.
pub(super) fn run(buffers: &mut HashMap<u64, BufferEntry>, launch: &Launch) -> DriverResult<()> {
    let mut args = KernelArgs { slots: Vec::with_capacity(launch.args.len()), buffers: Vec::new() };
    let result = gather(buffers, &launch.args, &mut args).and_then(|()| execute(launch, &mut args));
    for taken in args.buffers.drain(..) {
        buffers.insert(taken.handle, taken.entry);
    }
    result
}

fn gather(buffers: &mut HashMap<u64, BufferEntry>, bound: &[BoundArg], args: &mut KernelArgs) -> DriverResult<()> {
    for arg in bound {
        let slot = match arg {
            BoundArg::Buffer(handle) => match args.buffers.iter().position(|t| t.handle == *handle) {
                Some(pos) => Slot::Buffer(pos),
                None => {
                    let entry = buffers.remove(handle).ok_or_else(|| {
                        DriverError::deferred(status::INVALID_MEM_OBJECT, format!("buffer {handle} was released before the launch ran"))
                    })?;
                    args.buffers.push(Taken { handle: *handle, entry });
                    Slot::Buffer(args.buffers.len() - 1)
                }
            },
            BoundArg::Bytes(bytes) => Slot::Scalar(bytes.clone()),
            BoundArg::Local(size) => Slot::Local(vec![0; *size]),
        };
        args.slots.push(slot);
    }
    Ok(())
}

fn execute(launch: &Launch, args: &mut KernelArgs) -> DriverResult<()> {
    let global = launch.range.global3();
    let local = launch.range.local3().unwrap_or([1; 3]);
    let groups = [global[0] / local[0], global[1] / local[1], global[2] / local[2]];
    let dims = launch.range.dims();

    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                args.reset_local();
                for lz in 0..local[2] {
                    for ly in 0..local[1] {
                        for lx in 0..local[0] {
                            let item = WorkItem {
                                global_id: [gx * local[0] + lx, gy * local[1] + ly, gz * local[2] + lz],
                                local_id: [lx, ly, lz],
                                group_id: [gx, gy, gz],
                                global_size: global,
                                local_size: local,
                                dims,
                            };
                            launch.imp.execute(&item, args).map_err(|fault| {
                                DriverError::deferred(
                                    status::OUT_OF_RESOURCES,
                                    format!(
                                        "kernel '{}' faulted at global id {:?}: {fault}",
                                        launch.name,
                                        &item.global_id[..dims]
                                    ),
                                )
                            })?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mode: AccessMode, data: Vec<u8>) -> BufferEntry {
        BufferEntry { context: 1, mode, data }
    }

    fn launch(imp: Arc<dyn HostKernel>, args: Vec<BoundArg>, global: &[usize], local: &[usize]) -> Launch {
        Launch { name: "test".into(), imp, args, range: NdRange::new(global, Some(local)).unwrap() }
    }

    #[test]
    fn work_items_cover_the_range_once() {
        let mut buffers = HashMap::new();
        buffers.insert(7, entry(AccessMode::ReadWrite, vec![0; 4 * 12]));
        let imp: Arc<dyn HostKernel> = Arc::new(|item: &WorkItem, args: &mut KernelArgs| {
            let i = item.global_linear_id();
            let seen: u32 = args.load(0, i)?;
            args.store(0, i, seen + 1)
        });
        run(&mut buffers, &launch(imp, vec![BoundArg::Buffer(7)], &[4, 3], &[2, 1])).unwrap();
        let data: Vec<u32> = bytemuck::pod_collect_to_vec(&buffers[&7].data);
        assert!(data.iter().all(|&v| v == 1));
    }

    #[test]
    fn fault_is_deferred_and_buffers_return() {
        let mut buffers = HashMap::new();
        buffers.insert(1, entry(AccessMode::ReadOnly, vec![0; 4]));
        let imp: Arc<dyn HostKernel> =
            Arc::new(|_: &WorkItem, args: &mut KernelArgs| args.store(0, 0, 1u32));
        let err = run(&mut buffers, &launch(imp, vec![BoundArg::Buffer(1)], &[1], &[1])).unwrap_err();
        assert!(err.deferred);
        assert_eq!(err.status, status::OUT_OF_RESOURCES);
        assert!(err.message.contains("read-only"), "{}", err.message);
        assert!(buffers.contains_key(&1));
    }

    #[test]
    fn aliased_buffer_is_taken_once() {
        let mut buffers = HashMap::new();
        buffers.insert(3, entry(AccessMode::ReadWrite, bytemuck::cast_slice(&[5i32]).to_vec()));
        let imp: Arc<dyn HostKernel> = Arc::new(|_: &WorkItem, args: &mut KernelArgs| {
            let v: i32 = args.load(0, 0)?;
            args.store(1, 0, v * 2)
        });
        run(&mut buffers, &launch(imp, vec![BoundArg::Buffer(3), BoundArg::Buffer(3)], &[1], &[1])).unwrap();
        let data: Vec<i32> = bytemuck::pod_collect_to_vec(&buffers[&3].data);
        assert_eq!(data, vec![10]);
    }

    #[test]
    fn scalars_and_local_memory() {
        let mut buffers = HashMap::new();
        buffers.insert(9, entry(AccessMode::WriteOnly, vec![0; 4 * 4]));
        let imp: Arc<dyn HostKernel> = Arc::new(|item: &WorkItem, args: &mut KernelArgs| {
            let scale: f32 = args.scalar(1)?;
            let lid = item.local_id(0);
            args.store(2, lid, lid as f32)?;
            let mirrored: f32 = args.load(2, lid)?;
            args.store(0, item.global_id(0), mirrored * scale)
        });
        let args = vec![BoundArg::Buffer(9), BoundArg::Bytes(2.0f32.to_ne_bytes().to_vec()), BoundArg::Local(8)];
        run(&mut buffers, &launch(imp, args, &[4], &[2])).unwrap();
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&buffers[&9].data);
        assert_eq!(data, vec![0.0, 2.0, 0.0, 2.0]);
    }

    #[test]
    fn out_of_bounds_reports_length() {
        let args = KernelArgs { slots: vec![Slot::Local(vec![0; 8])], buffers: Vec::new() };
        assert_eq!(args.load::<u32>(0, 2), Err(KernelFault::OutOfBounds { slot: 0, index: 2, len: 2 }));
        assert_eq!(args.scalar::<u32>(0), Err(KernelFault::ArgumentKind { slot: 0, expected: "scalar of 4 bytes".into() }));
        assert_eq!(args.load::<u32>(3, 0), Err(KernelFault::MissingArgument { slot: 3 }));
    }
}
