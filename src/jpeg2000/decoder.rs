//! GPU decode pipeline.
//!
//! [`DecodePipeline`] drives every tile of a [`J2kImage`] through entropy
//! decoding, dequantization and wavelet synthesis on a single in-order queue,
//! then applies the colour stage to the whole image.

use std::fmt;

use bytemuck::Pod;
use log::{debug, error, info, warn};

use super::color::{ColorTransform, KernelColorTransform, SampleRange};
use super::dwt::InverseTransform;
use super::entropy::EntropyDecoder;
use super::image::{J2kImage, J2kTile};
use super::quantization::Dequantizer;
use crate::coding_parameters::{PipelineOptions, WaveletKind};
use crate::compute::{AccessMode, ComputeBackend};
use crate::error::J2kError;

/// Progress of a tile through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TileStage {
    Parsed,
    EntropyDecoded,
    Dequantized,
    Transformed,
    ColorConverted,
    Done,
}

impl fmt::Display for TileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsed => "parse",
            Self::EntropyDecoded => "entropy decode",
            Self::Dequantized => "dequantize",
            Self::Transformed => "inverse transform",
            Self::ColorConverted => "color transform",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

fn stage_failed(stage: TileStage, tile: u32) -> impl FnOnce(J2kError) -> J2kError {
    move |source| J2kError::StageFailed {
        stage,
        tile,
        source: Box::new(source),
    }
}

/// Orchestrates the decode stages over one compute backend.
pub struct DecodePipeline<B: ComputeBackend> {
    backend: B,
    options: PipelineOptions,
    entropy: Option<EntropyDecoder>,
    dequantizer: Option<Dequantizer>,
    transform: Option<InverseTransform>,
    color: Option<Box<dyn ColorTransform>>,
}

impl<B: ComputeBackend> DecodePipeline<B> {
    /// Compiles the kernels of every enabled stage.
    pub fn new(mut backend: B, options: PipelineOptions) -> Result<Self, J2kError> {
        let color: Option<Box<dyn ColorTransform>> = if options.color_transform {
            Some(Box::new(KernelColorTransform::new(&mut backend)?))
        } else {
            None
        };
        Self::build(backend, options, color)
    }

    /// Like [`new`](Self::new) but with a caller supplied colour stage.
    pub fn with_color_transform(
        backend: B,
        options: PipelineOptions,
        color: Box<dyn ColorTransform>,
    ) -> Result<Self, J2kError> {
        let color = options.color_transform.then_some(color);
        Self::build(backend, options, color)
    }

    fn build(
        mut backend: B,
        options: PipelineOptions,
        color: Option<Box<dyn ColorTransform>>,
    ) -> Result<Self, J2kError> {
        let entropy = options
            .entropy_decode
            .then(|| EntropyDecoder::new(&mut backend))
            .transpose()?;
        let dequantizer = options
            .dequantize
            .then(|| Dequantizer::new(&mut backend))
            .transpose()?;
        let transform = options
            .inverse_transform
            .then(|| InverseTransform::new(&mut backend))
            .transpose()?;
        Ok(Self {
            backend,
            options,
            entropy,
            dequantizer,
            transform,
            color,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Decodes every tile of `image` into its component planes.
    ///
    /// On failure every device buffer attached to the image is released and
    /// the error names the stage and tile that failed.
    pub fn decode(&mut self, image: &mut J2kImage) -> Result<(), J2kError> {
        match self.run(image) {
            Ok(()) => {
                info!(
                    "decoded {}x{} image, {} tile(s)",
                    image.width,
                    image.height,
                    image.tile_count()
                );
                Ok(())
            }
            Err(e) => {
                error!("decode failed: {e}");
                self.release_image(image);
                Err(e)
            }
        }
    }

    fn run(&mut self, image: &mut J2kImage) -> Result<(), J2kError> {
        if image.multi_component_transform && image.component_count != 3 {
            warn!(
                "multiple component transform signalled on {} components, ignoring it",
                image.component_count
            );
        }
        for index in 0..image.tiles.len() {
            self.decode_tile(image, index)?;
        }
        self.color_stage(image)?;
        self.backend.finish()?;
        for tile in &mut image.tiles {
            tile.stage = TileStage::Done;
        }
        Ok(())
    }

    fn decode_tile(&mut self, image: &mut J2kImage, index: usize) -> Result<(), J2kError> {
        let wavelet = image.wavelet;
        let range_bits = image.range_bits;
        let slot_size = image.parameters.codestream_capacity();
        let tile = &mut image.tiles[index];
        let id = tile.index;

        allocate_planes(&mut self.backend, tile)
            .map_err(stage_failed(TileStage::EntropyDecoded, id))?;

        if let Some(entropy) = &self.entropy {
            entropy
                .decode_tile(&mut self.backend, tile, slot_size)
                .map_err(stage_failed(TileStage::EntropyDecoded, id))?;
        }
        tile.stage = TileStage::EntropyDecoded;

        // Without the entropy stage there is nothing to scatter.
        if let Some(dequantizer) = &self.dequantizer
            && (self.entropy.is_some() || tile.coefficients.is_some())
        {
            dequantizer
                .dequantize_tile(&mut self.backend, tile, wavelet, range_bits)
                .map_err(stage_failed(TileStage::Dequantized, id))?;
        }
        if let Some(coefficients) = tile.coefficients.take() {
            debug!("tile {id}: dropping coefficients that were not dequantized");
            self.backend
                .finish()
                .and_then(|()| self.backend.release_buffer(coefficients))
                .map_err(stage_failed(TileStage::Dequantized, id))?;
        }
        tile.stage = TileStage::Dequantized;

        if let Some(transform) = &self.transform {
            transform
                .transform_tile(&mut self.backend, tile, wavelet)
                .map_err(stage_failed(TileStage::Transformed, id))?;
        }
        tile.stage = TileStage::Transformed;
        debug!("tile {id}: transformed");
        Ok(())
    }

    fn color_stage(&mut self, image: &mut J2kImage) -> Result<(), J2kError> {
        let component_transform = image.multi_component_transform && image.component_count == 3;
        let signed = image.signed;
        let range = SampleRange::new(image.range_bits, signed);
        let wavelet = image.wavelet;

        for tile in &mut image.tiles {
            if let Some(color) = self.color.as_mut() {
                let backend: &mut dyn ComputeBackend = &mut self.backend;
                let converted = if component_transform {
                    match wavelet {
                        WaveletKind::Reversible53 => color.decode_lossless(backend, tile, range),
                        WaveletKind::Irreversible97 => color.decode_lossy(backend, tile, range),
                    }
                } else if !signed {
                    color.inverse_level_shift(backend, tile, range)
                } else {
                    Ok(())
                };
                converted.map_err(stage_failed(TileStage::ColorConverted, tile.index))?;
            }
            tile.stage = TileStage::ColorConverted;
        }
        Ok(())
    }

    /// Releases every device buffer still attached to the image.
    pub fn release_image(&mut self, image: &mut J2kImage) {
        if let Err(e) = self.backend.finish() {
            warn!("finish before release failed: {e}");
        }
        for buffer in image.attached_buffers() {
            if let Err(e) = self.backend.release_buffer(buffer) {
                warn!("releasing buffer {buffer:?} failed: {e}");
            }
        }
        for tile in &mut image.tiles {
            tile.coefficients = None;
            for comp in &mut tile.components {
                comp.plane = None;
            }
        }
    }

    /// Reads a decoded 5/3 plane back to the host.
    pub fn read_plane_i32(
        &mut self,
        image: &J2kImage,
        tile: usize,
        component: usize,
    ) -> Result<Vec<i32>, J2kError> {
        self.read_plane(image, tile, component)
    }

    /// Reads a decoded 9/7 plane back to the host.
    pub fn read_plane_f32(
        &mut self,
        image: &J2kImage,
        tile: usize,
        component: usize,
    ) -> Result<Vec<f32>, J2kError> {
        self.read_plane(image, tile, component)
    }

    fn read_plane<T: Pod>(
        &mut self,
        image: &J2kImage,
        tile: usize,
        component: usize,
    ) -> Result<Vec<T>, J2kError> {
        let comp = image
            .tiles
            .get(tile)
            .and_then(|t| t.components.get(component))
            .ok_or(J2kError::MalformedInput("no such tile component"))?;
        let plane = comp.plane.ok_or(J2kError::MissingBuffer("component plane"))?;
        let mut bytes = vec![0u8; comp.plane_size_bytes()];
        self.backend.finish()?;
        self.backend.read_buffer(plane, &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

/// Gives every component of the tile a zeroed plane if it has none yet.
fn allocate_planes(backend: &mut dyn ComputeBackend, tile: &mut J2kTile) -> Result<(), J2kError> {
    for comp in &mut tile.components {
        if comp.plane.is_some() {
            continue;
        }
        let plane = backend.alloc_buffer(comp.plane_size_bytes(), AccessMode::ReadWrite)?;
        comp.plane = Some(plane);
        backend.fill_zero(plane)?;
    }
    Ok(())
}
