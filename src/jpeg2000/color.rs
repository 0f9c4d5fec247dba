//! Inverse multiple component transform and DC level shift.

use log::trace;

use super::image::J2kTile;
use crate::compute::{
    BufferHandle, ComputeBackend, KernelArg, KernelHandle, NdRange, device_int,
};
use crate::constants::{
    COLOR_GROUP_SIZE, DC_SHIFT_INVERSE_ENTRY, DC_SHIFT_INVERSE_PROGRAM, ICT_INVERSE_ENTRY,
    ICT_INVERSE_PROGRAM, LEVEL_SHIFT_BLOCK, LEVEL_SHIFT_PATCH, RCT_INVERSE_ENTRY,
    RCT_INVERSE_PROGRAM,
};
use crate::error::J2kError;

/// Level shift and clamping bounds for reconstructed samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
    pub level_shift: i32,
    pub min: i32,
    pub max: i32,
}

impl SampleRange {
    pub fn new(range_bits: u8, signed: bool) -> Self {
        let bits = range_bits.max(1) as u32;
        let half = 1i64 << (bits - 1);
        let (min, max) = if signed {
            (-half, half - 1)
        } else {
            (0, (1i64 << bits) - 1)
        };
        let saturate = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        Self {
            level_shift: bits as i32 - 1,
            min: saturate(min),
            max: saturate(max),
        }
    }
}

/// Colour stage of the pipeline, invoked once per tile after its wavelet synthesis.
pub trait ColorTransform {
    /// Inverse reversible component transform (YUV to RGB).
    fn decode_lossless(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError>;

    /// Inverse irreversible component transform (YCbCr to RGB).
    fn decode_lossy(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError>;

    /// Adds the DC offset back to every component plane of the tile.
    fn inverse_level_shift(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError>;
}

/// Colour transform backed by the preprocessing kernels.
pub struct KernelColorTransform {
    rct_inverse: KernelHandle,
    ict_inverse: KernelHandle,
    dc_shift_inverse: KernelHandle,
}

impl KernelColorTransform {
    pub fn new(backend: &mut dyn ComputeBackend) -> Result<Self, J2kError> {
        Ok(Self {
            rct_inverse: backend.compile_kernel(RCT_INVERSE_PROGRAM, RCT_INVERSE_ENTRY)?,
            ict_inverse: backend.compile_kernel(ICT_INVERSE_PROGRAM, ICT_INVERSE_ENTRY)?,
            dc_shift_inverse: backend.compile_kernel(DC_SHIFT_INVERSE_PROGRAM, DC_SHIFT_INVERSE_ENTRY)?,
        })
    }

    fn component_transform(
        &self,
        backend: &mut dyn ComputeBackend,
        kernel: KernelHandle,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        let [r, g, b] = three_planes(tile)?;
        let samples = tile.width as usize * tile.height as usize;
        let args = [
            KernelArg::Buffer(r),
            KernelArg::Buffer(g),
            KernelArg::Buffer(b),
            KernelArg::Int(device_int(tile.width as usize, "tile width")?),
            KernelArg::Int(device_int(tile.height as usize, "tile height")?),
            KernelArg::Int(range.level_shift),
            KernelArg::Int(range.min),
            KernelArg::Int(range.max),
        ];
        let global = samples.div_ceil(COLOR_GROUP_SIZE) * COLOR_GROUP_SIZE;
        backend.dispatch(kernel, &args, &NdRange::linear(global, COLOR_GROUP_SIZE))
    }
}

fn three_planes(tile: &J2kTile) -> Result<[BufferHandle; 3], J2kError> {
    match tile.components.as_slice() {
        [c0, c1, c2] => Ok([
            c0.plane.ok_or(J2kError::MissingBuffer("component plane"))?,
            c1.plane.ok_or(J2kError::MissingBuffer("component plane"))?,
            c2.plane.ok_or(J2kError::MissingBuffer("component plane"))?,
        ]),
        _ => Err(J2kError::MalformedInput(
            "component transform needs exactly three components",
        )),
    }
}

impl ColorTransform for KernelColorTransform {
    fn decode_lossless(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        trace!("tile {}: inverse RCT", tile.index);
        self.component_transform(backend, self.rct_inverse, tile, range)
    }

    fn decode_lossy(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        trace!("tile {}: inverse ICT", tile.index);
        self.component_transform(backend, self.ict_inverse, tile, range)
    }

    fn inverse_level_shift(
        &mut self,
        backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        let (width, height) = (tile.width as usize, tile.height as usize);
        let nd_range = NdRange::planar(
            [
                width.div_ceil(LEVEL_SHIFT_PATCH) * LEVEL_SHIFT_BLOCK,
                height.div_ceil(LEVEL_SHIFT_PATCH) * LEVEL_SHIFT_BLOCK,
            ],
            [LEVEL_SHIFT_BLOCK, LEVEL_SHIFT_BLOCK],
        );
        for comp in &tile.components {
            let plane = comp.plane.ok_or(J2kError::MissingBuffer("component plane"))?;
            let args = [
                KernelArg::Buffer(plane),
                KernelArg::Int(device_int(tile.width as usize, "tile width")?),
                KernelArg::Int(device_int(tile.height as usize, "tile height")?),
                KernelArg::Int(range.level_shift),
                KernelArg::Int(range.min),
                KernelArg::Int(range.max),
            ];
            backend.dispatch(self.dc_shift_inverse, &args, &nd_range)?;
        }
        Ok(())
    }
}
