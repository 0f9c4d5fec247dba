use std::collections::{HashMap, HashSet};

use log::trace;

use super::{
    AccessMode, BufferHandle, ComputeBackend, CopyRegion, KernelArg, KernelHandle, NdRange,
};
use crate::error::J2kError;

/// Host closure standing in for a device kernel.
pub type HostKernelFn = Box<dyn FnMut(&mut KernelInvocation<'_>) -> Result<(), J2kError>>;

/// A command as it was submitted to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Compile {
        program: String,
        entry_point: String,
    },
    Alloc {
        buffer: BufferHandle,
        size: usize,
        access: AccessMode,
    },
    Upload {
        buffer: BufferHandle,
        size: usize,
        access: AccessMode,
    },
    Release {
        buffer: BufferHandle,
    },
    FillZero {
        buffer: BufferHandle,
    },
    CopyRect {
        src: BufferHandle,
        dst: BufferHandle,
        region: CopyRegion,
    },
    Dispatch {
        entry_point: String,
        args: Vec<KernelArg>,
        range: NdRange,
    },
    Finish,
    Read {
        buffer: BufferHandle,
    },
}

struct HostBuffer {
    data: Vec<u8>,
}

struct KernelSource {
    program: String,
    entry_point: String,
}

/// Compute backend that keeps every buffer in host memory.
///
/// Commands execute immediately in submission order, which matches the
/// semantics of an in-order device queue. Every command is recorded so that
/// callers can inspect the exact sequence a decode produced. Kernels run as
/// registered host closures; unregistered kernels are recorded and skipped.
pub struct HostBackend {
    buffers: Vec<Option<HostBuffer>>,
    kernels: Vec<KernelSource>,
    host_kernels: HashMap<(String, String), HostKernelFn>,
    failing_entry_points: HashSet<String>,
    commands: Vec<Command>,
    alignment: usize,
    memory_limit: Option<usize>,
    allocated: usize,
    peak_allocated: usize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            kernels: Vec::new(),
            host_kernels: HashMap::new(),
            failing_entry_points: HashSet::new(),
            commands: Vec::new(),
            alignment: 64,
            memory_limit: None,
            allocated: 0,
            peak_allocated: 0,
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Makes allocations fail once the live total would exceed `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn register_kernel<F>(&mut self, program: &str, entry_point: &str, kernel: F)
    where
        F: FnMut(&mut KernelInvocation<'_>) -> Result<(), J2kError> + 'static,
    {
        self.host_kernels.insert(
            (program.to_string(), entry_point.to_string()),
            Box::new(kernel),
        );
    }

    /// Makes every dispatch of `entry_point` report a device failure.
    pub fn fail_kernel(&mut self, entry_point: &str) {
        self.failing_entry_points.insert(entry_point.to_string());
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn peak_allocated_bytes(&self) -> usize {
        self.peak_allocated
    }

    /// Current contents of a live buffer.
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers
            .get(buffer.0 as usize)
            .and_then(|b| b.as_ref())
            .map(|b| b.data.as_slice())
    }

    /// Entry points of all recorded dispatches, in order.
    pub fn dispatched_entry_points(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { entry_point, .. } => Some(entry_point.as_str()),
                _ => None,
            })
            .collect()
    }

    fn insert_buffer(&mut self, data: Vec<u8>) -> BufferHandle {
        self.allocated += data.len();
        self.peak_allocated = self.peak_allocated.max(self.allocated);
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(HostBuffer { data }));
        handle
    }

    fn reserve(&self, size: usize, what: &'static str) -> Result<Vec<u8>, J2kError> {
        if let Some(limit) = self.memory_limit
            && self.allocated + size > limit
        {
            return Err(J2kError::ResourceAllocation { what, bytes: size });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| J2kError::ResourceAllocation { what, bytes: size })?;
        Ok(data)
    }

    fn live(&self, buffer: BufferHandle, operation: &'static str) -> Result<&HostBuffer, J2kError> {
        lookup(&self.buffers, buffer, operation)
    }
}

fn lookup<'a>(
    buffers: &'a [Option<HostBuffer>],
    buffer: BufferHandle,
    operation: &'static str,
) -> Result<&'a HostBuffer, J2kError> {
    buffers
        .get(buffer.0 as usize)
        .and_then(|b| b.as_ref())
        .ok_or_else(|| J2kError::device(operation, format!("buffer {} is not live", buffer.0)))
}

fn lookup_mut<'a>(
    buffers: &'a mut [Option<HostBuffer>],
    buffer: BufferHandle,
    operation: &'static str,
) -> Result<&'a mut HostBuffer, J2kError> {
    buffers
        .get_mut(buffer.0 as usize)
        .and_then(|b| b.as_mut())
        .ok_or_else(|| J2kError::device(operation, format!("buffer {} is not live", buffer.0)))
}

impl ComputeBackend for HostBackend {
    fn buffer_alignment(&self) -> usize {
        self.alignment
    }

    fn compile_kernel(
        &mut self,
        program: &str,
        entry_point: &str,
    ) -> Result<KernelHandle, J2kError> {
        let handle = KernelHandle(self.kernels.len() as u32);
        self.kernels.push(KernelSource {
            program: program.to_string(),
            entry_point: entry_point.to_string(),
        });
        self.commands.push(Command::Compile {
            program: program.to_string(),
            entry_point: entry_point.to_string(),
        });
        Ok(handle)
    }

    fn alloc_buffer(&mut self, size: usize, access: AccessMode) -> Result<BufferHandle, J2kError> {
        let mut data = self.reserve(size, "device buffer")?;
        data.resize(size, 0);
        let buffer = self.insert_buffer(data);
        trace!("alloc buffer {} ({} bytes)", buffer.0, size);
        self.commands.push(Command::Alloc {
            buffer,
            size,
            access,
        });
        Ok(buffer)
    }

    fn upload_buffer(
        &mut self,
        data: &[u8],
        access: AccessMode,
    ) -> Result<BufferHandle, J2kError> {
        let mut storage = self.reserve(data.len(), "uploaded buffer")?;
        storage.extend_from_slice(data);
        let buffer = self.insert_buffer(storage);
        self.commands.push(Command::Upload {
            buffer,
            size: data.len(),
            access,
        });
        Ok(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), J2kError> {
        let slot = self
            .buffers
            .get_mut(buffer.0 as usize)
            .ok_or_else(|| J2kError::device("release", format!("unknown buffer {}", buffer.0)))?;
        let released = slot
            .take()
            .ok_or_else(|| J2kError::device("release", format!("buffer {} released twice", buffer.0)))?;
        self.allocated -= released.data.len();
        trace!("release buffer {}", buffer.0);
        self.commands.push(Command::Release { buffer });
        Ok(())
    }

    fn fill_zero(&mut self, buffer: BufferHandle) -> Result<(), J2kError> {
        lookup_mut(&mut self.buffers, buffer, "fill")?.data.fill(0);
        self.commands.push(Command::FillZero { buffer });
        Ok(())
    }

    fn copy_rect(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        region: &CopyRegion,
    ) -> Result<(), J2kError> {
        let src_len = self.live(src, "copy rect")?.data.len();
        let dst_len = self.live(dst, "copy rect")?.data.len();
        if region.src_end() > src_len || region.dst_end() > dst_len {
            return Err(J2kError::device(
                "copy rect",
                format!(
                    "region {region:?} exceeds buffers of {src_len} and {dst_len} bytes"
                ),
            ));
        }

        let mut rows = Vec::with_capacity(region.row_bytes * region.rows);
        {
            let data = &self.live(src, "copy rect")?.data;
            for row in 0..region.rows {
                let start = region.src_offset + row * region.src_pitch;
                rows.extend_from_slice(&data[start..start + region.row_bytes]);
            }
        }
        let data = &mut lookup_mut(&mut self.buffers, dst, "copy rect")?.data;
        for (row, chunk) in rows.chunks(region.row_bytes.max(1)).enumerate() {
            let start = region.dst_offset + row * region.dst_pitch;
            data[start..start + chunk.len()].copy_from_slice(chunk);
        }

        self.commands.push(Command::CopyRect {
            src,
            dst,
            region: *region,
        });
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: KernelHandle,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<(), J2kError> {
        let source = self
            .kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| J2kError::device("dispatch", format!("unknown kernel {}", kernel.0)))?;
        let entry_point = source.entry_point.clone();
        let key = (source.program.clone(), source.entry_point.clone());

        for dim in 0..range.dimensions {
            if range.local[dim] == 0 || range.global[dim] % range.local[dim] != 0 {
                return Err(J2kError::device(
                    "dispatch",
                    format!("{entry_point}: global size {:?} is not a multiple of local size {:?}", range.global, range.local),
                ));
            }
        }
        for arg in args {
            if let KernelArg::Buffer(buffer) = arg {
                lookup(&self.buffers, *buffer, "dispatch")?;
            }
        }
        if self.failing_entry_points.contains(&entry_point) {
            return Err(J2kError::device("dispatch", format!("{entry_point} failed")));
        }

        trace!("dispatch {} over {:?}", entry_point, range.global);
        if let Some(host_kernel) = self.host_kernels.get_mut(&key) {
            let mut invocation = KernelInvocation {
                args,
                range,
                buffers: &mut self.buffers,
            };
            host_kernel(&mut invocation)?;
        }

        self.commands.push(Command::Dispatch {
            entry_point,
            args: args.to_vec(),
            range: *range,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), J2kError> {
        self.commands.push(Command::Finish);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, out: &mut [u8]) -> Result<(), J2kError> {
        let data = &self.live(buffer, "read")?.data;
        if out.len() > data.len() {
            return Err(J2kError::device(
                "read",
                format!("read of {} bytes from a {} byte buffer", out.len(), data.len()),
            ));
        }
        out.copy_from_slice(&data[..out.len()]);
        self.commands.push(Command::Read { buffer });
        Ok(())
    }
}

/// Arguments and memory visible to a host kernel during one dispatch.
pub struct KernelInvocation<'a> {
    args: &'a [KernelArg],
    range: &'a NdRange,
    buffers: &'a mut [Option<HostBuffer>],
}

impl KernelInvocation<'_> {
    pub fn args(&self) -> &[KernelArg] {
        self.args
    }

    pub fn range(&self) -> &NdRange {
        self.range
    }

    fn arg(&self, index: usize) -> Result<KernelArg, J2kError> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| J2kError::device("host kernel", format!("missing argument {index}")))
    }

    pub fn buffer(&self, index: usize) -> Result<BufferHandle, J2kError> {
        match self.arg(index)? {
            KernelArg::Buffer(buffer) => Ok(buffer),
            other => Err(mismatch(index, "buffer", other)),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32, J2kError> {
        match self.arg(index)? {
            KernelArg::Int(value) => Ok(value),
            other => Err(mismatch(index, "int", other)),
        }
    }

    pub fn int2(&self, index: usize) -> Result<[i32; 2], J2kError> {
        match self.arg(index)? {
            KernelArg::Int2(value) => Ok(value),
            other => Err(mismatch(index, "int2", other)),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32, J2kError> {
        match self.arg(index)? {
            KernelArg::Float(value) => Ok(value),
            other => Err(mismatch(index, "float", other)),
        }
    }

    pub fn bytes(&self, buffer: BufferHandle) -> Result<&[u8], J2kError> {
        Ok(&lookup(&*self.buffers, buffer, "host kernel")?.data)
    }

    pub fn bytes_mut(&mut self, buffer: BufferHandle) -> Result<&mut [u8], J2kError> {
        Ok(&mut lookup_mut(&mut *self.buffers, buffer, "host kernel")?.data)
    }

    pub fn read_i32(&self, buffer: BufferHandle) -> Result<Vec<i32>, J2kError> {
        Ok(bytemuck::pod_collect_to_vec(self.bytes(buffer)?))
    }

    pub fn read_f32(&self, buffer: BufferHandle) -> Result<Vec<f32>, J2kError> {
        Ok(bytemuck::pod_collect_to_vec(self.bytes(buffer)?))
    }

    /// Writes `values` starting at sample `offset`.
    pub fn write_i32(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        values: &[i32],
    ) -> Result<(), J2kError> {
        write_samples(self.bytes_mut(buffer)?, offset, bytemuck::cast_slice(values))
    }

    pub fn write_f32(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        values: &[f32],
    ) -> Result<(), J2kError> {
        write_samples(self.bytes_mut(buffer)?, offset, bytemuck::cast_slice(values))
    }
}

fn write_samples(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), J2kError> {
    let start = offset * 4;
    let end = start + bytes.len();
    if end > data.len() {
        return Err(J2kError::device(
            "host kernel",
            format!("write of {}..{} past a {} byte buffer", start, end, data.len()),
        ));
    }
    data[start..end].copy_from_slice(bytes);
    Ok(())
}

fn mismatch(index: usize, expected: &str, found: KernelArg) -> J2kError {
    J2kError::device(
        "host kernel",
        format!("argument {index} expected {expected}, found {found:?}"),
    )
}
