//! Batched code-block decoding.
//!
//! Every code-block of a tile is decoded by one work-item. The host packs the
//! compressed bytes into fixed-size slots, describes each block with a
//! [`CodeBlockRecord`] and assigns it a disjoint range of the tile's flat
//! coefficient buffer.

use bytemuck::{Pod, Zeroable};
use log::{debug, warn};

use super::image::{CodeblockLocation, J2kTile};
use crate::compute::{
    AccessMode, AlignedStaging, BufferHandle, ComputeBackend, KernelArg, KernelHandle, NdRange,
    device_int, release_all,
};
use crate::constants::{ENTROPY_ENTRY, ENTROPY_GROUP_SIZE, ENTROPY_PROGRAM, SAMPLE_SIZE};
use crate::error::J2kError;

/// Rows per stripe of the bit-plane scan.
const STRIPE_HEIGHT: u32 = 4;

/// Everything the entropy kernel needs to know about one code-block.
#[derive(Debug, Clone, Copy)]
pub struct EntropyTask<'a> {
    pub location: CodeblockLocation,
    pub codestream: &'a [u8],
    pub significant_bits: u8,
    pub coding_passes: u8,
    pub width: u32,
    pub height: u32,
    pub nominal_width: u32,
    pub nominal_height: u32,
    pub magnitude_bits: u8,
    pub channel: u8,
    pub component: u16,
    pub decomposition_level: u8,
    pub step_size: f32,
    pub coefficients_offset: usize,
}

/// Device layout of a code-block description.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CodeBlockRecord {
    pub length: i32,
    pub significant_bits: u8,
    pub coding_passes: u8,
    pub width: u8,
    pub nominal_width: u8,
    pub height: u8,
    pub nominal_height: u8,
    pub stripe_count: u8,
    pub magnitude_bits: u8,
    pub channel: u8,
    pub component: u8,
    pub decomposition_level: u8,
    pub padding: u8,
    pub step_size: f32,
    /// Start of this block's context words in the shared state buffer.
    pub magcon_offset: i32,
    /// Start of this block's samples in the coefficient buffer.
    pub coefficients_offset: i32,
}

/// Host-side staging for one entropy dispatch.
pub struct PackedTasks {
    /// `records.len()` slots of `slot_size` bytes each.
    pub codestreams: AlignedStaging,
    pub slot_size: usize,
    pub records: Vec<CodeBlockRecord>,
    /// Bytes of `records`, aligned for upload.
    pub record_bytes: AlignedStaging,
    /// 32-bit context words needed by all blocks together.
    pub state_words: usize,
    /// Samples in the coefficient buffer.
    pub coefficient_count: usize,
}

/// Gives every code-block a disjoint slice of the tile's coefficient buffer.
///
/// Slices are sized for the nominal code-block, in canonical code-block order.
/// Returns the total number of samples.
pub fn assign_coefficient_offsets(tile: &mut J2kTile) -> usize {
    let mut offset = 0;
    for comp in &mut tile.components {
        let nominal = comp.nominal_codeblock_area();
        for res in &mut comp.resolutions {
            for sb in &mut res.subbands {
                for cblk in &mut sb.codeblocks {
                    cblk.coefficients_offset = offset;
                    offset += nominal;
                }
            }
        }
    }
    offset
}

/// Collects the decode task of every code-block in the tile.
pub fn extract_tasks(tile: &J2kTile) -> Vec<EntropyTask<'_>> {
    tile.codeblocks()
        .filter_map(|(location, cblk)| {
            let comp = tile.components.get(location.component)?;
            let res = comp.resolutions.get(location.resolution)?;
            let sb = res.subbands.get(location.subband)?;
            Some(EntropyTask {
                location,
                codestream: &cblk.compressed_data,
                significant_bits: cblk.significant_bits,
                coding_passes: cblk.coding_passes,
                width: cblk.width,
                height: cblk.height,
                nominal_width: comp.codeblock_width,
                nominal_height: comp.codeblock_height,
                magnitude_bits: sb.magnitude_bits,
                channel: sb.orientation.entropy_channel(),
                component: comp.component_index,
                decomposition_level: res.decomposition_level,
                step_size: sb.step_size,
                coefficients_offset: cblk.coefficients_offset,
            })
        })
        .collect()
}

fn narrow(value: u32, what: &'static str) -> Result<u8, J2kError> {
    u8::try_from(value).map_err(|_| J2kError::MalformedInput(what))
}

/// Builds the staging buffers for a batch of tasks.
///
/// Each codestream is copied to the start of its `slot_size` byte slot. A
/// codestream that does not fit its slot fails the whole batch.
pub fn pack_tasks(
    tasks: &[EntropyTask<'_>],
    slot_size: usize,
    alignment: usize,
) -> Result<PackedTasks, J2kError> {
    if let Some(task) = tasks.iter().find(|t| t.codestream.len() > slot_size) {
        return Err(J2kError::CodestreamTooLarge {
            length: task.codestream.len(),
            capacity: slot_size,
        });
    }

    let staging_bytes = tasks
        .len()
        .checked_mul(slot_size)
        .ok_or(J2kError::ResourceAllocation {
            what: "codestream staging",
            bytes: usize::MAX,
        })?;
    let mut codestreams = AlignedStaging::new(staging_bytes, alignment, "codestream staging")?;

    let mut records = Vec::with_capacity(tasks.len());
    let mut state_words = 0usize;
    let mut coefficient_count = 0usize;
    for (i, task) in tasks.iter().enumerate() {
        let slot = &mut codestreams.as_mut_slice()[i * slot_size..(i + 1) * slot_size];
        slot[..task.codestream.len()].copy_from_slice(task.codestream);

        debug_assert_eq!(task.coefficients_offset, coefficient_count);
        let stripes = task.height.div_ceil(STRIPE_HEIGHT);
        let magcon_offset = state_words + task.width as usize;
        state_words += task.width as usize * (stripes as usize + 2);

        records.push(CodeBlockRecord {
            length: device_int(task.codestream.len(), "code-block codestream")?,
            significant_bits: task.significant_bits,
            coding_passes: task.coding_passes,
            width: narrow(task.width, "code-block wider than 255 samples")?,
            nominal_width: narrow(task.nominal_width, "code-block wider than 255 samples")?,
            height: narrow(task.height, "code-block taller than 255 samples")?,
            nominal_height: narrow(task.nominal_height, "code-block taller than 255 samples")?,
            stripe_count: narrow(stripes, "code-block has too many stripes")?,
            magnitude_bits: task.magnitude_bits,
            channel: task.channel,
            component: narrow(task.component as u32, "component index exceeds 255")?,
            decomposition_level: task.decomposition_level,
            padding: 0,
            step_size: task.step_size,
            magcon_offset: device_int(magcon_offset, "entropy state")?,
            coefficients_offset: device_int(coefficient_count, "coefficient buffer")?,
        });
        coefficient_count += task.nominal_width as usize * task.nominal_height as usize;
    }

    let raw: &[u8] = bytemuck::cast_slice(&records);
    let mut record_bytes = AlignedStaging::new(raw.len(), alignment, "code-block records")?;
    record_bytes.as_mut_slice().copy_from_slice(raw);

    Ok(PackedTasks {
        codestreams,
        slot_size,
        records,
        record_bytes,
        state_words,
        coefficient_count,
    })
}

/// Entropy decoding stage.
pub struct EntropyDecoder {
    kernel: KernelHandle,
}

impl EntropyDecoder {
    pub fn new(backend: &mut dyn ComputeBackend) -> Result<Self, J2kError> {
        let kernel = backend.compile_kernel(ENTROPY_PROGRAM, ENTROPY_ENTRY)?;
        Ok(Self { kernel })
    }

    /// Decodes every code-block of `tile` into a fresh coefficient buffer.
    ///
    /// On success the buffer is attached to `tile.coefficients` and every
    /// temporary buffer has been released.
    pub fn decode_tile(
        &self,
        backend: &mut dyn ComputeBackend,
        tile: &mut J2kTile,
        slot_size: usize,
    ) -> Result<(), J2kError> {
        let total = assign_coefficient_offsets(tile);
        let tasks = extract_tasks(tile);
        if tasks.is_empty() {
            warn!("tile {} has no code-blocks", tile.index);
            return Ok(());
        }
        let packed = pack_tasks(&tasks, slot_size, backend.buffer_alignment())?;
        debug_assert_eq!(packed.coefficient_count, total);
        debug!(
            "tile {}: {} code-blocks, {} coefficients, {} state words",
            tile.index,
            packed.records.len(),
            total,
            packed.state_words
        );

        let coefficients = backend.alloc_buffer(total * SAMPLE_SIZE, AccessMode::ReadWrite)?;
        tile.coefficients = Some(coefficients);

        let mut transient = Vec::with_capacity(3);
        let enqueued = self.enqueue(backend, &packed, coefficients, &mut transient);
        let finished = backend.finish();
        let released = release_all(backend, &transient);
        enqueued.and(finished).and(released)
    }

    fn enqueue(
        &self,
        backend: &mut dyn ComputeBackend,
        packed: &PackedTasks,
        coefficients: BufferHandle,
        transient: &mut Vec<BufferHandle>,
    ) -> Result<(), J2kError> {
        let codestreams = backend.upload_buffer(packed.codestreams.as_slice(), AccessMode::ReadOnly)?;
        transient.push(codestreams);

        let state = backend.alloc_buffer(packed.state_words * SAMPLE_SIZE, AccessMode::ReadWrite)?;
        transient.push(state);
        backend.fill_zero(state)?;

        let records = backend.upload_buffer(packed.record_bytes.as_slice(), AccessMode::ReadOnly)?;
        transient.push(records);

        let count = packed.records.len();
        let args = [
            KernelArg::Buffer(state),
            KernelArg::Buffer(codestreams),
            KernelArg::Int(device_int(packed.slot_size, "codestream slot")?),
            KernelArg::Buffer(records),
            KernelArg::Int(device_int(count, "code-block records")?),
            KernelArg::Buffer(coefficients),
        ];
        let global = count.div_ceil(ENTROPY_GROUP_SIZE) * ENTROPY_GROUP_SIZE;
        backend.dispatch(
            self.kernel,
            &args,
            &NdRange::linear(global, ENTROPY_GROUP_SIZE),
        )
    }
}
