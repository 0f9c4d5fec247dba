// Kernel programs and entry points dispatched by the decode stages.
pub const ENTROPY_PROGRAM: &str = "coefficient_coder.cl";
pub const ENTROPY_ENTRY: &str = "g_decode";
pub const DEQUANTIZE_LOSSLESS_PROGRAM: &str = "quantizer_lossless_inverse.cl";
pub const DEQUANTIZE_LOSSLESS_ENTRY: &str = "subband_dequantization_lossless";
pub const DEQUANTIZE_LOSSY_PROGRAM: &str = "quantizer_lossy_inverse.cl";
pub const DEQUANTIZE_LOSSY_ENTRY: &str = "subband_dequantization_lossy";
pub const DWT_REVERSE_53_PROGRAM: &str = "dwt_r53.cl";
pub const DWT_REVERSE_97_PROGRAM: &str = "dwt_r97.cl";
pub const DWT_ENTRY: &str = "run";
pub const RCT_INVERSE_PROGRAM: &str = "preprocess_rct_inverse.cl";
pub const RCT_INVERSE_ENTRY: &str = "tcr_kernel";
pub const ICT_INVERSE_PROGRAM: &str = "preprocess_ict_inverse.cl";
pub const ICT_INVERSE_ENTRY: &str = "tci_kernel";
pub const DC_SHIFT_INVERSE_PROGRAM: &str = "preprocess_dc_level_shift_inverse.cl";
pub const DC_SHIFT_INVERSE_ENTRY: &str = "idc_level_shift_kernel";

// Every device plane stores one 32-bit sample (i32 for 5/3, f32 for 9/7).
pub const SAMPLE_SIZE: usize = 4;

// Work-items per group for the entropy kernel (one item per code-block).
pub const ENTROPY_GROUP_SIZE: usize = 32;

// Dequantization work-group tile, one group per code-block.
pub const DEQUANTIZE_BLOCK_X: usize = 16;
pub const DEQUANTIZE_BLOCK_Y: usize = 16;

// Colour transform kernels run 1-D over all samples of a tile.
pub const COLOR_GROUP_SIZE: usize = 64;

// Level shift kernels cover 32x32 patches with 16x16 groups.
pub const LEVEL_SHIFT_PATCH: usize = 32;
pub const LEVEL_SHIFT_BLOCK: usize = 16;

// Wavelet synthesis windows.
pub const DWT_WIDE_THRESHOLD: u32 = 960;
pub const DWT_MEDIUM_THRESHOLD: u32 = 480;
pub const DWT_SHARED_MEMORY_BANKS: usize = 32;
pub const DWT_STEP_ROWS_FACTOR: u32 = 15;

// ISO/IEC 15444-1 limits the code-block area to 4096 samples and each side to 2^2..2^10;
// the device record stores sides in a byte, which caps the exponent at 6.
pub const MINIMUM_CODEBLOCK_EXPONENT: u8 = 2;
pub const MAXIMUM_CODEBLOCK_EXPONENT: u8 = 6;
pub const MAXIMUM_DECOMPOSITION_LEVELS: u8 = 32;

// Decoded coefficients are 32-bit sign-magnitude, so Mb is capped at 31.
pub const MAXIMUM_MAGNITUDE_BITS: u8 = 31;
// Largest bit depth whose default HH magnitude bits (2 guard bits + depth + 2 - 1) still fit.
pub const MAXIMUM_RANGE_BITS: u8 = 28;

// Worst-case compressed bytes per code-block sample when no explicit bound is configured.
pub const DEFAULT_CODESTREAM_BYTES_PER_SAMPLE: usize = 2;

// Value held by tag tree nodes until decoding resolves them.
pub const TAG_TREE_UNKNOWN: i32 = i32::MAX;

// Packet header Lblock starts at 3 for every code-block (B.10.7.1).
pub const INITIAL_LBLOCK: u32 = 3;
