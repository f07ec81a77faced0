use thiserror::Error;

/// Reasons a single tile build can fail. Failures never touch the live nav-mesh.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TileGenerationError {
    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),
    #[error("Heightfield produced more than {max} layers")]
    TooManyLayers { max: usize },
    #[error("Region partitioning ran out of region ids")]
    TooManyRegions,
    #[error("Polygon mesh has {count} vertices, more than a tile can index")]
    TooManyVertices { count: usize },
    #[error("Compressed layer error: {0}")]
    Compression(#[from] CompressionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("Compressed layer data is truncated")]
    Truncated,
    #[error("Compressed layer has an invalid magic number")]
    BadMagic,
    #[error("Unsupported compressed layer version {0}")]
    UnsupportedVersion(u32),
    #[error("Decompressed size mismatch, expected {expected} bytes but got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Errors while decoding one of the binary blobs (navigation tiles, geometry & voxel caches).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("Unexpected end of data")]
    UnexpectedEnd,
    #[error("Invalid magic number")]
    BadMagic,
    #[error("Unsupported data version {0}")]
    UnsupportedVersion(u32),
    #[error("Negative element count {0}")]
    NegativeCount(i32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NavMeshError {
    #[error("Tile limit reached ({max_tiles} tiles)")]
    TileLimitReached { max_tiles: usize },
    #[error("Tile ({x},{y}:{layer}) already exists")]
    TileAlreadyExists { x: i32, y: i32, layer: u8 },
    #[error("Invalid tile data: {0}")]
    InvalidTileData(#[from] BlobError),
}
