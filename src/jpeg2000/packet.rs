use log::trace;

use super::bit_io::J2kBitReader;
use super::image::{CodeblockLocation, J2kResolution, J2kTile};
use super::tag_tree::TagTree;
use crate::constants::INITIAL_LBLOCK;
use crate::error::J2kError;

// Zero bit-plane counts above this cannot occur with 32-bit coefficients.
const MAXIMUM_ZERO_BIT_PLANES: i32 = 64;

/// Bytes and header information one packet contributes to a code-block.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    /// First layer that includes the code-block.
    pub first_inclusion: bool,
    /// Missing most significant bit-planes, only meaningful on first inclusion.
    pub zero_bit_planes: u8,
    pub coding_passes: u8,
    pub data: &'a [u8],
}

/// Receives code-block contributions as packets are parsed.
pub trait CodeblockSink {
    fn codeblock_contribution(
        &mut self,
        location: CodeblockLocation,
        contribution: Contribution<'_>,
    ) -> Result<(), J2kError>;
}

impl<F> CodeblockSink for F
where
    F: FnMut(CodeblockLocation, Contribution<'_>) -> Result<(), J2kError>,
{
    fn codeblock_contribution(
        &mut self,
        location: CodeblockLocation,
        contribution: Contribution<'_>,
    ) -> Result<(), J2kError> {
        self(location, contribution)
    }
}

/// Appends each contribution to the matching code-block of the tile.
impl CodeblockSink for J2kTile {
    fn codeblock_contribution(
        &mut self,
        location: CodeblockLocation,
        contribution: Contribution<'_>,
    ) -> Result<(), J2kError> {
        let magnitude_bits = self
            .subband(&location)
            .ok_or(J2kError::MalformedInput("contribution for an unknown subband"))?
            .magnitude_bits;
        let cblk = self
            .codeblock_mut(&location)
            .ok_or(J2kError::MalformedInput("contribution for an unknown code-block"))?;

        if contribution.first_inclusion {
            cblk.zero_bit_planes = contribution.zero_bit_planes;
            cblk.significant_bits = magnitude_bits.saturating_sub(contribution.zero_bit_planes);
        }
        cblk.coding_passes = cblk.coding_passes.saturating_add(contribution.coding_passes);
        cblk.compressed_data.extend_from_slice(contribution.data);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BlockState {
    included: bool,
    lblock: u32,
}

#[derive(Debug, Clone)]
struct SubbandPrecinct {
    inclusion_tree: TagTree,
    zero_bp_tree: TagTree,
    blocks: Vec<BlockState>,
}

/// Packet header state of one precinct, spanning a whole resolution level.
#[derive(Debug, Clone)]
pub struct PrecinctState {
    component: usize,
    resolution: usize,
    subbands: Vec<SubbandPrecinct>,
}

impl PrecinctState {
    pub fn new(component: usize, resolution: usize, level: &J2kResolution) -> Self {
        let subbands = level
            .subbands
            .iter()
            .map(|sb| {
                let (w, h) = (sb.codeblocks_x as usize, sb.codeblocks_y as usize);
                SubbandPrecinct {
                    inclusion_tree: TagTree::new(w, h),
                    zero_bp_tree: TagTree::new(w, h),
                    blocks: vec![
                        BlockState {
                            included: false,
                            lblock: INITIAL_LBLOCK,
                        };
                        w * h
                    ],
                }
            })
            .collect();
        Self {
            component,
            resolution,
            subbands,
        }
    }

    /// Forget every inclusion, as at the start of a new tile-part sequence.
    pub fn reset(&mut self) {
        for sb in &mut self.subbands {
            sb.inclusion_tree.reset();
            sb.zero_bp_tree.reset();
            for block in &mut sb.blocks {
                block.included = false;
                block.lblock = INITIAL_LBLOCK;
            }
        }
    }
}

struct PendingBlock {
    location: CodeblockLocation,
    first_inclusion: bool,
    zero_bit_planes: u8,
    coding_passes: u8,
    length: usize,
}

/// Decodes one packet (header and body) for `layer`, handing each included code-block's
/// bytes to `sink`. Returns the number of bytes the packet occupies in `data`.
pub fn decode_packet<S>(
    data: &[u8],
    state: &mut PrecinctState,
    layer: u32,
    sink: &mut S,
) -> Result<usize, J2kError>
where
    S: CodeblockSink + ?Sized,
{
    let mut reader = J2kBitReader::new(data);

    // Zero-length packet
    if reader.read_bit()? == 0 {
        reader.align();
        return Ok(reader.position());
    }

    let mut pending = Vec::new();
    for (subband, sb) in state.subbands.iter_mut().enumerate() {
        for leaf in 0..sb.blocks.len() {
            let block = &mut sb.blocks[leaf];
            let included = if block.included {
                reader.read_bit()? == 1
            } else {
                sb.inclusion_tree.decode(&mut reader, leaf, layer as i32 + 1)?
            };
            if !included {
                continue;
            }

            let first_inclusion = !block.included;
            let zero_bit_planes = if first_inclusion {
                sb.zero_bp_tree
                    .decode_value(&mut reader, leaf, MAXIMUM_ZERO_BIT_PLANES)? as u8
            } else {
                0
            };
            block.included = true;

            let coding_passes = read_coding_passes(&mut reader)?;
            while reader.read_bit()? == 1 {
                block.lblock += 1;
            }
            let bits = block.lblock + coding_passes.ilog2();
            if bits > 32 {
                return Err(J2kError::MalformedInput("code-block length field too wide"));
            }
            let length = reader.read_bits(bits as u8)? as usize;

            pending.push(PendingBlock {
                location: CodeblockLocation {
                    component: state.component,
                    resolution: state.resolution,
                    subband,
                    codeblock: leaf,
                },
                first_inclusion,
                zero_bit_planes,
                coding_passes,
                length,
            });
        }
    }
    reader.align();

    let mut offset = reader.position();
    for block in pending {
        let end = offset + block.length;
        let body = data
            .get(offset..end)
            .ok_or(J2kError::MalformedInput("packet body truncated"))?;
        trace!(
            "layer {} {:?}: {} bytes, {} passes",
            layer, block.location, block.length, block.coding_passes
        );
        sink.codeblock_contribution(
            block.location,
            Contribution {
                first_inclusion: block.first_inclusion,
                zero_bit_planes: block.zero_bit_planes,
                coding_passes: block.coding_passes,
                data: body,
            },
        )?;
        offset = end;
    }
    Ok(offset)
}

/// Number of coding passes codeword (ISO/IEC 15444-1 Table B.4).
fn read_coding_passes(reader: &mut J2kBitReader) -> Result<u8, J2kError> {
    if reader.read_bit()? == 0 {
        return Ok(1);
    }
    if reader.read_bit()? == 0 {
        return Ok(2);
    }
    let two = reader.read_bits(2)?;
    if two != 0b11 {
        return Ok(3 + two as u8);
    }
    let five = reader.read_bits(5)?;
    if five != 0b1_1111 {
        return Ok(6 + five as u8);
    }
    Ok(37 + reader.read_bits(7)? as u8)
}
