//! Inverse discrete wavelet transform.
//!
//! Each tile-component is synthesized level by level, coarsest first, with a
//! sliding-window kernel. The kernel reads the current level from the plane
//! and writes the next larger LL into a second buffer; between levels the
//! result is copied back so the next launch sees it as its LL band.

use log::{debug, trace, warn};

use super::image::{J2kTile, J2kTileComponent};
use crate::coding_parameters::WaveletKind;
use crate::compute::{
    AccessMode, BufferHandle, ComputeBackend, CopyRegion, KernelArg, KernelHandle, NdRange,
    device_int, release_all,
};
use crate::constants::{
    DWT_ENTRY, DWT_MEDIUM_THRESHOLD, DWT_REVERSE_53_PROGRAM, DWT_REVERSE_97_PROGRAM,
    DWT_SHARED_MEMORY_BANKS, DWT_STEP_ROWS_FACTOR, DWT_WIDE_THRESHOLD, SAMPLE_SIZE,
};
use crate::error::J2kError;

/// Launch geometry of one synthesis level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformLaunch {
    pub window_width: u32,
    pub window_height: u32,
    /// Work-group scratch memory in bytes.
    pub local_bytes: usize,
    /// Window steps each work-group slides down.
    pub steps: u32,
    pub range: NdRange,
}

/// Number of taps of the synthesis filter.
pub fn impulse_diameter(wavelet: WaveletKind) -> u32 {
    match wavelet {
        WaveletKind::Reversible53 => 3,
        WaveletKind::Irreversible97 => 7,
    }
}

/// Sliding window size for a level `width` samples wide.
pub fn window_size(wavelet: WaveletKind, width: u32) -> (u32, u32) {
    match wavelet {
        _ if width >= DWT_WIDE_THRESHOLD => (192, 8),
        WaveletKind::Reversible53 if width >= DWT_MEDIUM_THRESHOLD => (128, 8),
        WaveletKind::Irreversible97 if width >= DWT_MEDIUM_THRESHOLD => (128, 6),
        WaveletKind::Reversible53 => (64, 8),
        WaveletKind::Irreversible97 => (64, 6),
    }
}

/// Scratch samples a work-group needs for one window, padded against bank conflicts.
pub fn window_scratch_samples(window_width: u32, window_height: u32, diameter: u32) -> usize {
    let banks = DWT_SHARED_MEMORY_BANKS;
    let rows = (window_height + diameter) as usize;
    let boundary = (diameter as usize + 1) / 2;
    let stride = boundary + window_width as usize / 2;
    let buffer = stride * rows;
    let padding = banks - ((buffer + banks / 2) % banks);
    2 * buffer + padding
}

pub fn plan_launch(wavelet: WaveletKind, width: u32, height: u32) -> TransformLaunch {
    let (window_width, window_height) = window_size(wavelet, width);
    let local_bytes =
        window_scratch_samples(window_width, window_height, impulse_diameter(wavelet)) * SAMPLE_SIZE;
    let steps = height.div_ceil(DWT_STEP_ROWS_FACTOR * window_height).max(1);
    let range = NdRange::planar(
        [
            width.div_ceil(window_width) as usize * window_width as usize,
            height.div_ceil(window_height * steps) as usize,
        ],
        [window_width as usize, 1],
    );
    TransformLaunch {
        window_width,
        window_height,
        local_bytes,
        steps,
        range,
    }
}

/// Inverse wavelet transform stage.
pub struct InverseTransform {
    reverse_53: KernelHandle,
    reverse_97: KernelHandle,
}

impl InverseTransform {
    pub fn new(backend: &mut dyn ComputeBackend) -> Result<Self, J2kError> {
        Ok(Self {
            reverse_53: backend.compile_kernel(DWT_REVERSE_53_PROGRAM, DWT_ENTRY)?,
            reverse_97: backend.compile_kernel(DWT_REVERSE_97_PROGRAM, DWT_ENTRY)?,
        })
    }

    /// Transforms every component of the tile.
    ///
    /// A failing component keeps its original plane and does not stop the
    /// others; the first failure is returned once all components were tried.
    pub fn transform_tile(
        &self,
        backend: &mut dyn ComputeBackend,
        tile: &mut J2kTile,
        wavelet: WaveletKind,
    ) -> Result<(), J2kError> {
        let mut first_error = None;
        let mut retired = Vec::new();
        for comp in &mut tile.components {
            match self.transform_component(backend, comp, wavelet) {
                Ok(input) => retired.extend(input),
                Err(e) => {
                    warn!(
                        "tile {} component {}: inverse transform failed: {e}",
                        tile.index, comp.component_index
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        // Replaced planes may still be read by queued launches.
        let finished = backend.finish();
        let released = release_all(backend, &retired);
        match first_error {
            Some(e) => Err(e),
            None => finished.and(released),
        }
    }

    /// Enqueues the synthesis of one component, returning the plane it replaced.
    fn transform_component(
        &self,
        backend: &mut dyn ComputeBackend,
        comp: &mut J2kTileComponent,
        wavelet: WaveletKind,
    ) -> Result<Option<BufferHandle>, J2kError> {
        if comp.decomposition_levels == 0 {
            return Ok(None);
        }
        let input = comp.plane.ok_or(J2kError::MissingBuffer("component plane"))?;
        let output = backend.alloc_buffer(comp.plane_size_bytes(), AccessMode::ReadWrite)?;

        let enqueued = backend
            .fill_zero(output)
            .and_then(|()| self.enqueue_levels(backend, comp, wavelet, input, output));
        if let Err(e) = enqueued {
            if let Err(cleanup) = backend.finish().and_then(|()| backend.release_buffer(output)) {
                warn!("releasing transform output failed: {cleanup}");
            }
            return Err(e);
        }

        comp.plane = Some(output);
        Ok(Some(input))
    }

    fn enqueue_levels(
        &self,
        backend: &mut dyn ComputeBackend,
        comp: &J2kTileComponent,
        wavelet: WaveletKind,
        input: BufferHandle,
        output: BufferHandle,
    ) -> Result<(), J2kError> {
        let kernel = match wavelet {
            WaveletKind::Reversible53 => self.reverse_53,
            WaveletKind::Irreversible97 => self.reverse_97,
        };
        let pitch = comp.width as usize;
        let last = comp.resolutions.len().saturating_sub(1);

        for res in comp.resolutions.iter().skip(1) {
            if res.width == 0 || res.height == 0 {
                trace!("resolution {} is empty", res.level);
                continue;
            }
            let launch = plan_launch(wavelet, res.width, res.height);
            debug!(
                "component {} level {}: {}x{} with {}x{} windows, {} steps",
                comp.component_index,
                res.decomposition_level,
                res.width,
                res.height,
                launch.window_width,
                launch.window_height,
                launch.steps
            );
            let args = [
                KernelArg::Int(launch.window_width as i32),
                KernelArg::Int(launch.window_height as i32),
                KernelArg::LocalBytes(launch.local_bytes),
                KernelArg::Buffer(input),
                KernelArg::Buffer(output),
                KernelArg::Int(device_int(res.width as usize, "resolution width")?),
                KernelArg::Int(device_int(res.height as usize, "resolution height")?),
                KernelArg::Int(launch.steps as i32),
            ];
            backend.dispatch(kernel, &args, &launch.range)?;

            if (res.level as usize) < last {
                let region = CopyRegion::samples(
                    0,
                    0,
                    res.width as usize,
                    res.height as usize,
                    pitch,
                    pitch,
                );
                backend.copy_rect(output, input, &region)?;
            }
        }
        Ok(())
    }
}
