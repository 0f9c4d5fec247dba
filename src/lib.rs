pub mod constants;
pub mod error;

pub use coding_parameters::{DecodeParameters, ImageParameters, PipelineOptions, WaveletKind};
pub use compute::{ComputeBackend, HostBackend};
pub use error::{GeometryError, J2kError};
pub use jpeg2000::decoder::{DecodePipeline, TileStage};
pub use jpeg2000::image::J2kImage;

pub mod coding_parameters;
pub mod compute;
pub mod jpeg2000;
