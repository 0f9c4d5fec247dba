use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::constants::DEFAULT_CODESTREAM_BYTES_PER_SAMPLE;

/// Wavelet filter signalled in the COD marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum WaveletKind {
    /// Reversible 5/3 integer filter, samples are stored as `i32`.
    Reversible53 = 0,
    /// Irreversible 9/7 floating point filter, samples are stored as `f32`.
    #[default]
    Irreversible97 = 1,
}

impl WaveletKind {
    pub fn is_lossy(self) -> bool {
        self == Self::Irreversible97
    }
}

/// Parameters read from the main header (SIZ/COD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParameters {
    pub width: u32,
    pub height: u32,
    pub component_count: u16,
    /// Bit depth of every component.
    pub range_bits: u8,
    pub signed: bool,
    pub wavelet: WaveletKind,
    /// Part 1 multiple component transform (RCT or ICT depending on `wavelet`).
    pub multi_component_transform: bool,
}

impl Default for ImageParameters {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            component_count: 1,
            range_bits: 8,
            signed: false,
            wavelet: WaveletKind::default(),
            multi_component_transform: false,
        }
    }
}

/// Coding parameters that drive the decode geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParameters {
    /// Nominal tile size; `None` decodes the whole image as a single tile.
    pub tile_size: Option<(u32, u32)>,
    pub decomposition_levels: u8,
    /// Code-block width is `1 << codeblock_exp_w`.
    pub codeblock_exp_w: u8,
    /// Code-block height is `1 << codeblock_exp_h`.
    pub codeblock_exp_h: u8,
    /// Byte slot reserved per code-block in the entropy staging buffer.
    /// `None` derives it from the nominal code-block area.
    pub max_codestream_size: Option<usize>,
}

impl Default for DecodeParameters {
    fn default() -> Self {
        Self {
            tile_size: None,
            decomposition_levels: 4,
            codeblock_exp_w: 6,
            codeblock_exp_h: 6,
            max_codestream_size: None,
        }
    }
}

impl DecodeParameters {
    pub fn codeblock_size(&self) -> (u32, u32) {
        (1 << self.codeblock_exp_w, 1 << self.codeblock_exp_h)
    }

    pub fn codestream_capacity(&self) -> usize {
        self.max_codestream_size.unwrap_or_else(|| {
            let (w, h) = self.codeblock_size();
            w as usize * h as usize * DEFAULT_CODESTREAM_BYTES_PER_SAMPLE
        })
    }
}

/// Stage switches for the decode pipeline. Disabled stages pass tiles through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub entropy_decode: bool,
    pub dequantize: bool,
    pub inverse_transform: bool,
    pub color_transform: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            entropy_decode: true,
            dequantize: true,
            inverse_transform: true,
            color_transform: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codestream_capacity() {
        let params = DecodeParameters::default();
        assert_eq!(params.codeblock_size(), (64, 64));
        assert_eq!(params.codestream_capacity(), 8192);

        let params = DecodeParameters {
            max_codestream_size: Some(16384),
            ..Default::default()
        };
        assert_eq!(params.codestream_capacity(), 16384);
    }

    #[test]
    fn test_wavelet_codes() {
        assert_eq!(WaveletKind::try_from(0u8).unwrap(), WaveletKind::Reversible53);
        assert_eq!(WaveletKind::try_from(1u8).unwrap(), WaveletKind::Irreversible97);
        assert!(WaveletKind::try_from(2u8).is_err());
        assert_eq!(u8::from(WaveletKind::Irreversible97), 1);
    }
}
