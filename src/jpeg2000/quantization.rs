//! Subband dequantization.
//!
//! Code-block coefficients leave the entropy stage as sign-magnitude values
//! with the magnitude aligned to bit 30. Each subband is first gathered from the
//! tile's flat coefficient buffer into a contiguous staging buffer, then one
//! kernel launch per subband scales it into its place in the component plane.

use log::{debug, trace};

use super::image::{J2kSubband, J2kTile, SubbandOrientation};
use crate::coding_parameters::WaveletKind;
use crate::compute::{
    AccessMode, BufferHandle, ComputeBackend, CopyRegion, KernelArg, KernelHandle, NdRange,
    device_int, release_all,
};
use crate::constants::{
    DEQUANTIZE_BLOCK_X, DEQUANTIZE_BLOCK_Y, DEQUANTIZE_LOSSLESS_ENTRY,
    DEQUANTIZE_LOSSLESS_PROGRAM, DEQUANTIZE_LOSSY_ENTRY, DEQUANTIZE_LOSSY_PROGRAM, SAMPLE_SIZE,
};
use crate::error::J2kError;

// Bit position of the most significant magnitude bit in a decoded coefficient.
const COEFFICIENT_TOP_BIT: i32 = 31;

/// Dequantization factors of one subband.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubbandScale {
    /// Multiplier applied by the lossy kernel. Zero for reversible coding.
    pub convert_factor: f32,
    /// Right shift that drops the unused low bit-planes.
    pub shift_bits: i32,
}

/// Computes the scale of a subband at decomposition level `level` of an
/// `levels` level transform.
pub fn subband_scale(
    wavelet: WaveletKind,
    range_bits: u8,
    levels: u8,
    level: u8,
    orientation: SubbandOrientation,
    magnitude_bits: u8,
    step_size: f32,
) -> SubbandScale {
    let shift_bits = COEFFICIENT_TOP_BIT - magnitude_bits as i32;
    let convert_factor = match wavelet {
        WaveletKind::Reversible53 => 0.0,
        WaveletKind::Irreversible97 => {
            let exponent = range_bits as i32
                + orientation.gain_exponent() as i32
                + levels as i32
                - level as i32
                - shift_bits;
            (step_size as f64 * 2f64.powi(exponent)) as f32
        }
    };
    SubbandScale {
        convert_factor,
        shift_bits,
    }
}

/// Fills in `convert_factor` and `shift_bits` for every subband of the tile.
pub fn update_subband_scales(tile: &mut J2kTile, wavelet: WaveletKind, range_bits: u8) {
    for comp in &mut tile.components {
        let levels = comp.decomposition_levels;
        for res in &mut comp.resolutions {
            for sb in &mut res.subbands {
                let scale = subband_scale(
                    wavelet,
                    range_bits,
                    levels,
                    res.decomposition_level,
                    sb.orientation,
                    sb.magnitude_bits,
                    sb.step_size,
                );
                sb.convert_factor = scale.convert_factor;
                sb.shift_bits = scale.shift_bits;
            }
        }
    }
}

/// Copy regions that gather the code-blocks of `sb` into a contiguous subband buffer.
pub fn gather_regions(sb: &J2kSubband, nominal_width: u32) -> impl Iterator<Item = CopyRegion> + '_ {
    sb.codeblocks.iter().map(move |cb| {
        CopyRegion::samples(
            cb.coefficients_offset,
            cb.bounds.x0 as usize + cb.bounds.y0 as usize * sb.width as usize,
            cb.width as usize,
            cb.height as usize,
            nominal_width as usize,
            sb.width as usize,
        )
    })
}

struct StagedSubband {
    component: usize,
    resolution: usize,
    subband: usize,
    buffer: BufferHandle,
}

/// Dequantization stage.
pub struct Dequantizer {
    lossless: KernelHandle,
    lossy: KernelHandle,
}

impl Dequantizer {
    pub fn new(backend: &mut dyn ComputeBackend) -> Result<Self, J2kError> {
        Ok(Self {
            lossless: backend.compile_kernel(DEQUANTIZE_LOSSLESS_PROGRAM, DEQUANTIZE_LOSSLESS_ENTRY)?,
            lossy: backend.compile_kernel(DEQUANTIZE_LOSSY_PROGRAM, DEQUANTIZE_LOSSY_ENTRY)?,
        })
    }

    /// Scatters the tile's coefficients into its component planes.
    ///
    /// The tile coefficient buffer is released on success.
    pub fn dequantize_tile(
        &self,
        backend: &mut dyn ComputeBackend,
        tile: &mut J2kTile,
        wavelet: WaveletKind,
        range_bits: u8,
    ) -> Result<(), J2kError> {
        update_subband_scales(tile, wavelet, range_bits);
        let Some(coefficients) = tile.coefficients else {
            if tile.codeblock_count() > 0 {
                return Err(J2kError::MissingBuffer("tile coefficients"));
            }
            return Ok(());
        };
        if tile.components.iter().any(|c| c.plane.is_none()) {
            return Err(J2kError::MissingBuffer("component plane"));
        }

        let mut staged = Vec::new();
        let enqueued = self.gather(backend, tile, coefficients, &mut staged).and_then(|()| {
            self.compute(backend, tile, wavelet, &staged)
        });
        let finished = backend.finish();
        let buffers: Vec<BufferHandle> = staged.iter().map(|s| s.buffer).collect();
        let released = release_all(backend, &buffers);
        enqueued.and(finished).and(released)?;

        backend.release_buffer(coefficients)?;
        tile.coefficients = None;
        debug!("tile {}: dequantized {} subbands", tile.index, staged.len());
        Ok(())
    }

    fn gather(
        &self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        coefficients: BufferHandle,
        staged: &mut Vec<StagedSubband>,
    ) -> Result<(), J2kError> {
        for (c, comp) in tile.components.iter().enumerate() {
            for (r, res) in comp.resolutions.iter().enumerate() {
                for (s, sb) in res.subbands.iter().enumerate() {
                    if sb.is_empty() {
                        trace!("tile {} component {c}: skipping empty {:?} band", tile.index, sb.orientation);
                        continue;
                    }
                    let buffer = backend.alloc_buffer(sb.area() * SAMPLE_SIZE, AccessMode::ReadWrite)?;
                    staged.push(StagedSubband {
                        component: c,
                        resolution: r,
                        subband: s,
                        buffer,
                    });
                    for region in gather_regions(sb, comp.codeblock_width) {
                        backend.copy_rect(coefficients, buffer, &region)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn compute(
        &self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        wavelet: WaveletKind,
        staged: &[StagedSubband],
    ) -> Result<(), J2kError> {
        for entry in staged {
            let comp = &tile.components[entry.component];
            let sb = &comp.resolutions[entry.resolution].subbands[entry.subband];
            let plane = comp.plane.ok_or(J2kError::MissingBuffer("component plane"))?;

            let (kernel, scale) = match wavelet {
                WaveletKind::Reversible53 => (self.lossless, KernelArg::Int(sb.shift_bits)),
                WaveletKind::Irreversible97 => (self.lossy, KernelArg::Float(sb.convert_factor)),
            };
            let plane_offset = sb.bounds.x0 as usize + sb.bounds.y0 as usize * comp.width as usize;
            let args = [
                KernelArg::Buffer(entry.buffer),
                KernelArg::Int2([
                    device_int(sb.width as usize, "subband width")?,
                    device_int(sb.height as usize, "subband height")?,
                ]),
                KernelArg::Buffer(plane),
                KernelArg::Int(device_int(plane_offset, "subband plane offset")?),
                KernelArg::Int2([
                    device_int(comp.width as usize, "component width")?,
                    device_int(comp.height as usize, "component height")?,
                ]),
                KernelArg::Int2([comp.codeblock_width as i32, comp.codeblock_height as i32]),
                scale,
            ];
            let range = NdRange::planar(
                [
                    sb.codeblocks_x as usize * DEQUANTIZE_BLOCK_X,
                    sb.codeblocks_y as usize * DEQUANTIZE_BLOCK_Y,
                ],
                [DEQUANTIZE_BLOCK_X, DEQUANTIZE_BLOCK_Y],
            );
            backend.dispatch(kernel, &args, &range)?;
        }
        Ok(())
    }
}
