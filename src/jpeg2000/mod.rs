//! JPEG 2000 Part 1 decode core (ISO/IEC 15444-1)
//!
//! Host-side orchestration of a device decoder. The modules cover:
//!
//! - `image`: Tile, component, resolution, subband and code-block geometry.
//! - `bit_io` / `tag_tree` / `packet`: Packet header decoding into code-block contributions.
//! - `entropy`: Batched code-block decoding into a flat coefficient buffer.
//! - `quantization`: Per-subband gather and dequantization into component planes.
//! - `dwt`: Inverse 5-3 and 9-7 wavelet synthesis.
//! - `color`: Inverse component transforms and DC level shift.
//! - `decoder`: The pipeline that runs the stages tile by tile.

pub mod bit_io;
pub mod color;
pub mod decoder;
pub mod dwt;
pub mod entropy;
pub mod image;
pub mod math;
pub mod packet;
pub mod quantization;
pub mod tag_tree;
