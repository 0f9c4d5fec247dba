//! Compute backend seam.
//!
//! The decode stages never talk to a device API directly. They compile kernels,
//! manage buffers and enqueue work through [`ComputeBackend`], which models a
//! single in-order command queue: copies and dispatches run in submission order
//! and only [`ComputeBackend::finish`] blocks the host.
//!
//! - `host`: a host-memory backend used for tests, tooling and kernel emulation.

pub mod host;

use crate::constants::SAMPLE_SIZE;
use crate::error::J2kError;

pub use host::HostBackend;

/// Opaque device buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u32);

/// Opaque compiled kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) u32);

/// Device access flags for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Narrows a host-side size or offset to the 32-bit integer a kernel argument carries.
pub(crate) fn device_int(value: usize, what: &'static str) -> Result<i32, J2kError> {
    i32::try_from(value).map_err(|_| J2kError::ResourceAllocation {
        what,
        bytes: value.saturating_mul(SAMPLE_SIZE),
    })
}

/// A single kernel argument, bound by position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Int(i32),
    Int2([i32; 2]),
    Float(f32),
    /// Work-group local memory of the given size in bytes.
    LocalBytes(usize),
}

/// Index space of a dispatch. Unused dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub dimensions: usize,
    pub global: [usize; 2],
    pub local: [usize; 2],
}

impl NdRange {
    pub fn linear(global: usize, local: usize) -> Self {
        Self {
            dimensions: 1,
            global: [global, 1],
            local: [local, 1],
        }
    }

    pub fn planar(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dimensions: 2,
            global,
            local,
        }
    }

    pub fn work_items(&self) -> usize {
        self.global[0] * self.global[1]
    }

    pub fn group_count(&self) -> [usize; 2] {
        [
            self.global[0].div_ceil(self.local[0].max(1)),
            self.global[1].div_ceil(self.local[1].max(1)),
        ]
    }
}

/// A rectangular copy between two linear buffers. All quantities are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub row_bytes: usize,
    pub rows: usize,
    pub src_pitch: usize,
    pub dst_pitch: usize,
}

impl CopyRegion {
    /// Builds a region from 32-bit sample coordinates.
    pub fn samples(
        src_origin: usize,
        dst_origin: usize,
        width: usize,
        height: usize,
        src_pitch: usize,
        dst_pitch: usize,
    ) -> Self {
        Self {
            src_offset: src_origin * SAMPLE_SIZE,
            dst_offset: dst_origin * SAMPLE_SIZE,
            row_bytes: width * SAMPLE_SIZE,
            rows: height,
            src_pitch: src_pitch * SAMPLE_SIZE,
            dst_pitch: dst_pitch * SAMPLE_SIZE,
        }
    }

    /// One past the last source byte touched.
    pub fn src_end(&self) -> usize {
        match self.rows {
            0 => self.src_offset,
            rows => self.src_offset + (rows - 1) * self.src_pitch + self.row_bytes,
        }
    }

    /// One past the last destination byte touched.
    pub fn dst_end(&self) -> usize {
        match self.rows {
            0 => self.dst_offset,
            rows => self.dst_offset + (rows - 1) * self.dst_pitch + self.row_bytes,
        }
    }
}

/// Capabilities the decode core needs from a compute device.
///
/// Every submission is asynchronous on an in-order queue. Buffers that queued work
/// may still read must not be released before [`finish`](ComputeBackend::finish).
pub trait ComputeBackend {
    /// Required alignment in bytes for host memory handed to the device.
    fn buffer_alignment(&self) -> usize;

    fn compile_kernel(&mut self, program: &str, entry_point: &str)
    -> Result<KernelHandle, J2kError>;

    fn alloc_buffer(&mut self, size: usize, access: AccessMode) -> Result<BufferHandle, J2kError>;

    /// Allocates a buffer initialised from host memory.
    fn upload_buffer(&mut self, data: &[u8], access: AccessMode)
    -> Result<BufferHandle, J2kError>;

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), J2kError>;

    /// Enqueues a zero fill of the whole buffer.
    fn fill_zero(&mut self, buffer: BufferHandle) -> Result<(), J2kError>;

    fn copy_rect(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        region: &CopyRegion,
    ) -> Result<(), J2kError>;

    fn dispatch(
        &mut self,
        kernel: KernelHandle,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<(), J2kError>;

    /// Blocks until every queued command has completed.
    fn finish(&mut self) -> Result<(), J2kError>;

    /// Blocking read of the start of a buffer into `out`.
    fn read_buffer(&mut self, buffer: BufferHandle, out: &mut [u8]) -> Result<(), J2kError>;
}

/// Releases every buffer, reporting the first failure.
pub fn release_all(
    backend: &mut dyn ComputeBackend,
    buffers: &[BufferHandle],
) -> Result<(), J2kError> {
    let mut first_error = None;
    for &buffer in buffers {
        if let Err(e) = backend.release_buffer(buffer) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Host staging memory whose start honours the device alignment.
pub struct AlignedStaging {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedStaging {
    pub fn new(len: usize, alignment: usize, what: &'static str) -> Result<Self, J2kError> {
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(J2kError::device(
                "buffer alignment",
                format!("{alignment} is not a power of two"),
            ));
        }
        let total = len
            .checked_add(alignment - 1)
            .ok_or(J2kError::ResourceAllocation { what, bytes: len })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| J2kError::ResourceAllocation { what, bytes: total })?;
        storage.resize(total, 0);

        let offset = storage.as_ptr().align_offset(alignment);
        if offset == usize::MAX || offset + len > total {
            return Err(J2kError::ResourceAllocation { what, bytes: total });
        }
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}
