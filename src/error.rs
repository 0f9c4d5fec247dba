use thiserror::Error;

use crate::jpeg2000::decoder::TileStage;

/// Invalid or degenerate coding parameters, detected before any device work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Image dimensions must be non-zero (got {width}x{height})")]
    ZeroImageSize { width: u32, height: u32 },
    #[error("Image must have at least one component")]
    NoComponents,
    #[error("Tile size must be non-zero (got {width}x{height})")]
    ZeroTileSize { width: u32, height: u32 },
    #[error("Code-block exponent {0} is outside the supported range")]
    CodeblockExponent(u8),
    #[error("Unsupported number of decomposition levels: {0}")]
    DecompositionLevels(u8),
    #[error("Unsupported range bits: {0}")]
    RangeBits(u8),
    #[error("Magnitude bits {0} do not fit the 32-bit coefficient format")]
    MagnitudeBits(u8),
    #[error("Tile grid of {0} tiles exceeds the supported count")]
    TileCount(u64),
}

#[derive(Error, Debug)]
pub enum J2kError {
    #[error("Failed to allocate {bytes} bytes for {what}")]
    ResourceAllocation { what: &'static str, bytes: usize },
    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Device operation '{operation}' failed: {detail}")]
    DeviceOperation {
        operation: &'static str,
        detail: String,
    },
    #[error("Malformed input: {0}")]
    MalformedInput(&'static str),
    #[error("Code-block codestream of {length} bytes exceeds the {capacity} byte slot")]
    CodestreamTooLarge { length: usize, capacity: usize },
    #[error("Missing device buffer: {0}")]
    MissingBuffer(&'static str),
    #[error("{stage} stage failed on tile {tile}: {source}")]
    StageFailed {
        stage: TileStage,
        tile: u32,
        #[source]
        source: Box<J2kError>,
    },
}

impl J2kError {
    pub(crate) fn device(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::DeviceOperation {
            operation,
            detail: detail.into(),
        }
    }

    /// The innermost error, skipping stage context.
    pub fn root_cause(&self) -> &J2kError {
        match self {
            Self::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_resource_allocation(&self) -> bool {
        matches!(self.root_cause(), Self::ResourceAllocation { .. })
    }
}
