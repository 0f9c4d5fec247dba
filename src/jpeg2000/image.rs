use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::decoder::TileStage;
use super::math::{band_edge, ceil_div, ceil_div_pow2, grid_span};
use crate::coding_parameters::{DecodeParameters, ImageParameters, WaveletKind};
use crate::compute::BufferHandle;
use crate::constants::{
    MAXIMUM_CODEBLOCK_EXPONENT, MAXIMUM_DECOMPOSITION_LEVELS, MAXIMUM_MAGNITUDE_BITS,
    MAXIMUM_RANGE_BITS, MINIMUM_CODEBLOCK_EXPONENT, SAMPLE_SIZE,
};
use crate::error::{GeometryError, J2kError};

/// Guard bits every subband starts with.
///
/// This is an assumption, not a value read from the codestream: the geometry is built
/// before any quantization marker is parsed, so each band begins with reversible
/// defaults (see [`default_magnitude_bits`], unit step size). Callers that parse QCD/QCC
/// must apply the signalled values through [`J2kSubband::set_quantization`] before the
/// entropy stage runs, otherwise Mb and the dequantization scale follow these defaults.
pub const DEFAULT_GUARD_BITS: u8 = 2;

/// Mb a band of `orientation` starts with for `range_bits` deep samples: the reversible
/// `epsilon_b = RI + gain` with [`DEFAULT_GUARD_BITS`], until
/// [`J2kSubband::set_quantization`] replaces it.
pub fn default_magnitude_bits(range_bits: u8, orientation: SubbandOrientation) -> u32 {
    (DEFAULT_GUARD_BITS as u32 + range_bits as u32 + orientation.gain_exponent()).saturating_sub(1)
}

/// Half-open rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x0 < other.x1
            && other.x0 < self.x1
            && self.y0 < other.y1
            && other.y0 < self.y1
    }
}

/// Orientation of a wavelet subband, numbered as in the codestream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SubbandOrientation {
    /// Low-Low (base image)
    #[default]
    LL = 0,
    /// High-Low (horizontal details)
    HL = 1,
    /// Low-High (vertical details)
    LH = 2,
    /// High-High (diagonal details)
    HH = 3,
}

impl SubbandOrientation {
    /// 1 when the band is high-pass horizontally.
    pub fn horizontal_offset(self) -> u32 {
        u8::from(self) as u32 & 1
    }

    /// 1 when the band is high-pass vertically.
    pub fn vertical_offset(self) -> u32 {
        (u8::from(self) as u32 >> 1) & 1
    }

    /// Base 2 exponent of the nominal subband gain.
    pub fn gain_exponent(self) -> u32 {
        self.horizontal_offset() + self.vertical_offset()
    }

    /// Context set used by the entropy kernel. LL and LH share one.
    pub fn entropy_channel(self) -> u8 {
        match self {
            Self::LL | Self::LH => 0,
            Self::HL => 1,
            Self::HH => 2,
        }
    }
}

/// Index path to a code-block inside a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeblockLocation {
    pub component: usize,
    pub resolution: usize,
    pub subband: usize,
    pub codeblock: usize,
}

/// Decode geometry of a whole image: tiles down to code-blocks.
#[derive(Debug, Clone)]
pub struct J2kImage {
    /// Total width of the image in pixels.
    pub width: u32,
    /// Total height of the image in pixels.
    pub height: u32,
    pub component_count: u16,
    /// Bit depth of every component.
    pub range_bits: u8,
    pub signed: bool,
    pub wavelet: WaveletKind,
    pub multi_component_transform: bool,
    /// Nominal tile width. The last tile column may be narrower.
    pub tile_width: u32,
    /// Nominal tile height. The last tile row may be shorter.
    pub tile_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub parameters: DecodeParameters,
    pub tiles: Vec<J2kTile>,
}

/// A rectangular, independently decoded part of the image.
#[derive(Debug, Clone)]
pub struct J2kTile {
    /// Raster index of the tile (0-indexed).
    pub index: u32,
    /// Position on the image grid, clipped to the image.
    pub bounds: Rect,
    pub width: u32,
    pub height: u32,
    pub components: Vec<J2kTileComponent>,
    /// Flat entropy output shared by every code-block of the tile.
    pub coefficients: Option<BufferHandle>,
    pub stage: TileStage,
}

/// Component data specific to a single tile.
#[derive(Debug, Clone)]
pub struct J2kTileComponent {
    pub component_index: u16,
    pub width: u32,
    pub height: u32,
    pub decomposition_levels: u8,
    /// Nominal code-block width.
    pub codeblock_width: u32,
    /// Nominal code-block height.
    pub codeblock_height: u32,
    pub resolutions: Vec<J2kResolution>,
    /// Device image plane, one 32-bit sample per pixel.
    pub plane: Option<BufferHandle>,
}

/// A specific resolution level in the DWT decomposition.
#[derive(Debug, Clone)]
pub struct J2kResolution {
    /// Resolution index, 0 is the coarsest (LL only).
    pub level: u8,
    /// Decomposition level the subbands of this resolution belong to.
    pub decomposition_level: u8,
    /// Bounds on the reduced grid of this resolution.
    pub bounds: Rect,
    pub width: u32,
    pub height: u32,
    pub subbands: Vec<J2kSubband>,
}

/// A frequency subband within a resolution level.
#[derive(Debug, Clone)]
pub struct J2kSubband {
    pub orientation: SubbandOrientation,
    /// Placement inside the tile-component plane (Mallat layout).
    pub bounds: Rect,
    pub width: u32,
    pub height: u32,
    pub codeblocks_x: u32,
    pub codeblocks_y: u32,
    /// Mb, the number of magnitude bit-planes.
    pub magnitude_bits: u8,
    /// Step size relative to the nominal dynamic range of the band.
    pub step_size: f32,
    pub convert_factor: f32,
    pub shift_bits: i32,
    pub codeblocks: Vec<J2kCodeBlock>,
}

/// Smallest independently entropy coded unit.
#[derive(Debug, Clone, Default)]
pub struct J2kCodeBlock {
    /// Raster index within the subband.
    pub index: u32,
    /// Horizontal index of the code-block in the subband.
    pub x: u32,
    /// Vertical index of the code-block in the subband.
    pub y: u32,
    /// Bounds relative to the subband origin.
    pub bounds: Rect,
    pub width: u32,
    pub height: u32,
    /// Concatenated code-block contributions of all decoded layers.
    pub compressed_data: Vec<u8>,
    /// Number of coded bit-planes (Mb minus missing MSBs).
    pub significant_bits: u8,
    pub coding_passes: u8,
    pub zero_bit_planes: u8,
    /// Sample offset of this block inside the tile's flat coefficient buffer.
    pub coefficients_offset: usize,
}

impl J2kImage {
    /// Derives the full tile/resolution/subband/code-block tree.
    pub fn new(image: &ImageParameters, params: &DecodeParameters) -> Result<Self, J2kError> {
        validate(image, params)?;

        let (tile_width, tile_height) = match params.tile_size {
            Some((w, h)) => (w.min(image.width), h.min(image.height)),
            None => (image.width, image.height),
        };
        let tiles_x = ceil_div(image.width as u64, tile_width as u64);
        let tiles_y = ceil_div(image.height as u64, tile_height as u64);
        let tile_count = tiles_x * tiles_y;
        if tile_count > u32::MAX as u64 {
            return Err(GeometryError::TileCount(tile_count).into());
        }
        let (tiles_x, tiles_y) = (tiles_x as u32, tiles_y as u32);

        let mut tiles = Vec::new();
        reserve(&mut tiles, tile_count, "tile table")?;
        for q in 0..tiles_y {
            let (y0, y1) = grid_span(q, tile_height, image.height);
            for p in 0..tiles_x {
                let (x0, x1) = grid_span(p, tile_width, image.width);
                let bounds = Rect::new(x0, y0, x1, y1);
                tiles.push(J2kTile::new(q * tiles_x + p, bounds, image, params)?);
            }
        }

        debug!(
            "geometry: {}x{} image, {} component(s), {}x{} tiles of {}x{}, {} decomposition levels",
            image.width,
            image.height,
            image.component_count,
            tiles_x,
            tiles_y,
            tile_width,
            tile_height,
            params.decomposition_levels
        );

        Ok(Self {
            width: image.width,
            height: image.height,
            component_count: image.component_count,
            range_bits: image.range_bits,
            signed: image.signed,
            wavelet: image.wavelet,
            multi_component_transform: image.multi_component_transform,
            tile_width,
            tile_height,
            tiles_x,
            tiles_y,
            parameters: *params,
            tiles,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Device buffers still attached to the image.
    pub fn attached_buffers(&self) -> Vec<BufferHandle> {
        let mut buffers = Vec::new();
        for tile in &self.tiles {
            buffers.extend(tile.coefficients);
            buffers.extend(tile.components.iter().filter_map(|c| c.plane));
        }
        buffers
    }
}

fn validate(image: &ImageParameters, params: &DecodeParameters) -> Result<(), GeometryError> {
    if image.width == 0 || image.height == 0 {
        return Err(GeometryError::ZeroImageSize {
            width: image.width,
            height: image.height,
        });
    }
    if image.component_count == 0 {
        return Err(GeometryError::NoComponents);
    }
    if let Some((width, height)) = params.tile_size
        && (width == 0 || height == 0)
    {
        return Err(GeometryError::ZeroTileSize { width, height });
    }
    for exponent in [params.codeblock_exp_w, params.codeblock_exp_h] {
        if !(MINIMUM_CODEBLOCK_EXPONENT..=MAXIMUM_CODEBLOCK_EXPONENT).contains(&exponent) {
            return Err(GeometryError::CodeblockExponent(exponent));
        }
    }
    if params.decomposition_levels > MAXIMUM_DECOMPOSITION_LEVELS {
        return Err(GeometryError::DecompositionLevels(
            params.decomposition_levels,
        ));
    }
    if image.range_bits == 0 {
        return Err(GeometryError::RangeBits(image.range_bits));
    }
    if image.range_bits > MAXIMUM_RANGE_BITS {
        let largest = default_magnitude_bits(image.range_bits, SubbandOrientation::HH);
        return Err(GeometryError::MagnitudeBits(largest.min(255) as u8));
    }
    Ok(())
}

/// Reserves room for `count` entries, failing instead of aborting when the table cannot exist.
fn reserve<T>(table: &mut Vec<T>, count: u64, what: &'static str) -> Result<(), J2kError> {
    let failed = || J2kError::ResourceAllocation {
        what,
        bytes: usize::try_from(count)
            .unwrap_or(usize::MAX)
            .saturating_mul(size_of::<T>()),
    };
    let count = usize::try_from(count).map_err(|_| failed())?;
    table.try_reserve_exact(count).map_err(|_| failed())
}

impl J2kTile {
    fn new(
        index: u32,
        bounds: Rect,
        image: &ImageParameters,
        params: &DecodeParameters,
    ) -> Result<Self, J2kError> {
        let components = (0..image.component_count)
            .map(|c| J2kTileComponent::new(c, &bounds, image, params))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            index,
            bounds,
            width: bounds.width(),
            height: bounds.height(),
            components,
            coefficients: None,
            stage: TileStage::Parsed,
        })
    }

    pub fn codeblock_count(&self) -> usize {
        self.codeblocks().count()
    }

    /// Every code-block of the tile in component, resolution, subband, code-block order.
    pub fn codeblocks(&self) -> impl Iterator<Item = (CodeblockLocation, &J2kCodeBlock)> + '_ {
        self.components
            .iter()
            .enumerate()
            .flat_map(|(component, comp)| {
                comp.resolutions
                    .iter()
                    .enumerate()
                    .flat_map(move |(resolution, res)| {
                        res.subbands
                            .iter()
                            .enumerate()
                            .flat_map(move |(subband, sb)| {
                                sb.codeblocks.iter().enumerate().map(move |(codeblock, cb)| {
                                    (
                                        CodeblockLocation {
                                            component,
                                            resolution,
                                            subband,
                                            codeblock,
                                        },
                                        cb,
                                    )
                                })
                            })
                    })
            })
    }

    pub fn subband(&self, location: &CodeblockLocation) -> Option<&J2kSubband> {
        self.components
            .get(location.component)?
            .resolutions
            .get(location.resolution)?
            .subbands
            .get(location.subband)
    }

    pub fn codeblock_mut(&mut self, location: &CodeblockLocation) -> Option<&mut J2kCodeBlock> {
        self.components
            .get_mut(location.component)?
            .resolutions
            .get_mut(location.resolution)?
            .subbands
            .get_mut(location.subband)?
            .codeblocks
            .get_mut(location.codeblock)
    }
}

impl J2kTileComponent {
    fn new(
        component_index: u16,
        tile: &Rect,
        image: &ImageParameters,
        params: &DecodeParameters,
    ) -> Result<Self, J2kError> {
        let (codeblock_width, codeblock_height) = params.codeblock_size();
        let levels = params.decomposition_levels;
        let resolutions = (0..=levels)
            .map(|r| J2kResolution::new(r, levels, tile, image, codeblock_width, codeblock_height))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            component_index,
            width: tile.width(),
            height: tile.height(),
            decomposition_levels: levels,
            codeblock_width,
            codeblock_height,
            resolutions,
            plane: None,
        })
    }

    pub fn resolution_count(&self) -> usize {
        self.resolutions.len()
    }

    pub fn plane_size_bytes(&self) -> usize {
        self.width as usize * self.height as usize * SAMPLE_SIZE
    }

    pub fn nominal_codeblock_area(&self) -> usize {
        self.codeblock_width as usize * self.codeblock_height as usize
    }
}

impl J2kResolution {
    fn new(
        level: u8,
        levels: u8,
        tile: &Rect,
        image: &ImageParameters,
        codeblock_width: u32,
        codeblock_height: u32,
    ) -> Result<Self, J2kError> {
        let decomposition_level = if level == 0 { levels } else { levels - level + 1 };
        let shift = (levels - level) as u32;
        let bounds = Rect::new(
            ceil_div_pow2(tile.x0 as u64, shift) as u32,
            ceil_div_pow2(tile.y0 as u64, shift) as u32,
            ceil_div_pow2(tile.x1 as u64, shift) as u32,
            ceil_div_pow2(tile.y1 as u64, shift) as u32,
        );

        let orientations: &[SubbandOrientation] = if level == 0 {
            &[SubbandOrientation::LL]
        } else {
            &[
                SubbandOrientation::HL,
                SubbandOrientation::LH,
                SubbandOrientation::HH,
            ]
        };
        let subbands = orientations
            .iter()
            .map(|&o| {
                J2kSubband::new(
                    o,
                    decomposition_level as u32,
                    tile,
                    image,
                    codeblock_width,
                    codeblock_height,
                )
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            level,
            decomposition_level,
            bounds,
            width: bounds.width(),
            height: bounds.height(),
            subbands,
        })
    }
}

impl J2kSubband {
    fn new(
        orientation: SubbandOrientation,
        level: u32,
        tile: &Rect,
        image: &ImageParameters,
        codeblock_width: u32,
        codeblock_height: u32,
    ) -> Result<Self, J2kError> {
        let xob = orientation.horizontal_offset() as u64;
        let yob = orientation.vertical_offset() as u64;
        let extent = |t0: u32, t1: u32, offset: u64| {
            (band_edge(t1 as u64, level, offset) - band_edge(t0 as u64, level, offset)) as u32
        };

        let width = extent(tile.x0, tile.x1, xob);
        let height = extent(tile.y0, tile.y1, yob);
        // High-pass bands sit right of / below the low-pass band of the same level.
        let x0 = xob as u32 * extent(tile.x0, tile.x1, 0);
        let y0 = yob as u32 * extent(tile.y0, tile.y1, 0);

        let codeblocks_x = ceil_div(width as u64, codeblock_width as u64) as u32;
        let codeblocks_y = ceil_div(height as u64, codeblock_height as u64) as u32;
        let codeblock_count = codeblocks_x as u64 * codeblocks_y as u64;
        if codeblock_count > u32::MAX as u64 {
            return Err(J2kError::ResourceAllocation {
                what: "code-block table",
                bytes: (codeblock_count as usize).saturating_mul(size_of::<J2kCodeBlock>()),
            });
        }
        let mut codeblocks = Vec::new();
        reserve(&mut codeblocks, codeblock_count, "code-block table")?;
        for y in 0..codeblocks_y {
            let (y0, y1) = grid_span(y, codeblock_height, height);
            for x in 0..codeblocks_x {
                let (x0, x1) = grid_span(x, codeblock_width, width);
                let bounds = Rect::new(x0, y0, x1, y1);
                codeblocks.push(J2kCodeBlock {
                    index: y * codeblocks_x + x,
                    x,
                    y,
                    bounds,
                    width: bounds.width(),
                    height: bounds.height(),
                    ..Default::default()
                });
            }
        }
        if codeblocks.is_empty() {
            debug!("{orientation:?} band at level {level} is empty");
        }

        // Fits a byte: validation caps range_bits so the largest default is 31.
        let magnitude_bits = default_magnitude_bits(image.range_bits, orientation) as u8;

        Ok(Self {
            orientation,
            bounds: Rect::new(x0, y0, x0 + width, y0 + height),
            width,
            height,
            codeblocks_x,
            codeblocks_y,
            magnitude_bits,
            step_size: 1.0,
            convert_factor: 0.0,
            shift_bits: 0,
            codeblocks,
        })
    }

    /// Applies quantization signalling for this band: Mb = G + exponent - 1 and
    /// a step of `(1 + mantissa / 2^11) * 2^-exponent` relative to the band's dynamic range.
    pub fn set_quantization(
        &mut self,
        exponent: u8,
        mantissa: u16,
        guard_bits: u8,
    ) -> Result<(), GeometryError> {
        let magnitude_bits = (guard_bits as u32 + exponent as u32).saturating_sub(1);
        if magnitude_bits == 0 || magnitude_bits > MAXIMUM_MAGNITUDE_BITS as u32 {
            return Err(GeometryError::MagnitudeBits(magnitude_bits.min(255) as u8));
        }
        self.magnitude_bits = magnitude_bits as u8;
        self.step_size = (1.0 + mantissa as f32 / 2048.0) * 2f32.powi(-(exponent as i32));
        Ok(())
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.codeblocks.is_empty()
    }
}
