//! Compressed layer storage.
//!
//! A compressed layer is a plain header followed by the run-length encoded height, area & connection grids.
//! The encoded grids start with their 4-byte uncompressed size.

use bevy::math::IVec2;

use crate::{
    blob::{BlobReader, BlobWriter},
    coords::BoundingBox,
    error::{BlobError, CompressionError},
    layers::{HeightfieldLayer, LayerHeader},
    Area,
};

const LAYER_MAGIC: u32 = u32::from_le_bytes(*b"NVLR");
const LAYER_VERSION: u32 = 1;

/// Longest run a single control byte can describe.
const MAX_RUN: usize = 129;
const MIN_RUN: usize = 2;
const MAX_LITERALS: usize = 128;

/// One compressed walkable layer of a tile.
///
/// Owns its data. It is moved from the tile generator to the manager's layer cache and back; never copied.
#[derive(Debug, PartialEq)]
pub struct CompressedLayer {
    layer_index: u8,
    bounds: BoundingBox,
    data: Box<[u8]>,
}

impl CompressedLayer {
    pub(crate) fn from_raw(layer_index: u8, bounds: BoundingBox, data: Box<[u8]>) -> Self {
        Self {
            layer_index,
            bounds,
            data,
        }
    }

    pub fn layer_index(&self) -> u8 {
        self.layer_index
    }

    /// World space bounds, vertically padded by the agent's max step height.
    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }
}

fn truncated(_: BlobError) -> CompressionError {
    CompressionError::Truncated
}

/// Run-length encodes ``bytes``.
///
/// Control byte ``c < 128`` is followed by ``c + 1`` literal bytes, otherwise the next byte repeats ``c - 126`` times.
pub(crate) fn rle_compress(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() / 4 + 8);
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());

    let mut literal_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let mut run = 1;
        while i + run < bytes.len() && run < MAX_RUN && bytes[i + run] == bytes[i] {
            run += 1;
        }

        if run >= MIN_RUN {
            flush_literals(&mut out, &bytes[literal_start..i]);
            out.push((run + 126) as u8);
            out.push(bytes[i]);
            i += run;
            literal_start = i;
        } else {
            i += 1;
        }
    }
    flush_literals(&mut out, &bytes[literal_start..]);

    out
}

fn flush_literals(out: &mut Vec<u8>, literals: &[u8]) {
    for chunk in literals.chunks(MAX_LITERALS) {
        out.push((chunk.len() - 1) as u8);
        out.extend_from_slice(chunk);
    }
}

/// Decodes data written by [rle_compress]. Data claiming to be larger than ``max_len`` is rejected before allocating.
pub(crate) fn rle_decompress(bytes: &[u8], max_len: usize) -> Result<Vec<u8>, CompressionError> {
    let mut reader = BlobReader::new(bytes);
    let expected = reader.u32().map_err(truncated)? as usize;
    if expected > max_len {
        return Err(CompressionError::SizeMismatch {
            expected: max_len,
            actual: expected,
        });
    }

    let mut out = Vec::with_capacity(expected);
    while !reader.remaining().is_empty() {
        let control = usize::from(reader.u8().map_err(truncated)?);
        if control < MAX_LITERALS {
            out.extend_from_slice(reader.take(control + 1).map_err(truncated)?);
        } else {
            let value = reader.u8().map_err(truncated)?;
            out.resize(out.len() + control - 126, value);
        }

        if out.len() > expected {
            break;
        }
    }

    if out.len() != expected {
        return Err(CompressionError::SizeMismatch {
            expected,
            actual: out.len(),
        });
    }

    Ok(out)
}

pub(crate) fn compress_layer(layer: &HeightfieldLayer, world_bounds: BoundingBox) -> CompressedLayer {
    let header = &layer.header;
    let cell_count = layer.heights.len();

    let mut writer = BlobWriter::with_capacity(64 + cell_count);
    writer.u32(LAYER_MAGIC);
    writer.u32(LAYER_VERSION);
    writer.i32(header.tile.x);
    writer.i32(header.tile.y);
    writer.u8(header.layer);
    writer.vec3(header.bmin);
    writer.vec3(header.bmax);
    for value in [
        header.hmin,
        header.hmax,
        header.width,
        header.height,
        header.min_x,
        header.max_x,
        header.min_y,
        header.max_y,
    ] {
        writer.u16(value);
    }

    let mut grids = Vec::with_capacity(cell_count * 3);
    grids.extend_from_slice(&layer.heights);
    grids.extend(layer.areas.iter().map(|area| area.0));
    grids.extend_from_slice(&layer.cons);
    writer.bytes(&rle_compress(&grids));

    CompressedLayer::from_raw(header.layer, world_bounds, writer.into_inner().into_boxed_slice())
}

pub(crate) fn decompress_layer(compressed: &CompressedLayer) -> Result<HeightfieldLayer, CompressionError> {
    let mut reader = BlobReader::new(compressed.data());
    if reader.u32().map_err(truncated)? != LAYER_MAGIC {
        return Err(CompressionError::BadMagic);
    }
    let version = reader.u32().map_err(truncated)?;
    if version != LAYER_VERSION {
        return Err(CompressionError::UnsupportedVersion(version));
    }

    let tile = IVec2::new(reader.i32().map_err(truncated)?, reader.i32().map_err(truncated)?);
    let layer = reader.u8().map_err(truncated)?;
    let bmin = reader.vec3().map_err(truncated)?;
    let bmax = reader.vec3().map_err(truncated)?;
    let mut values = [0u16; 8];
    for value in values.iter_mut() {
        *value = reader.u16().map_err(truncated)?;
    }
    let [hmin, hmax, width, height, min_x, max_x, min_y, max_y] = values;

    let cell_count = usize::from(width) * usize::from(height);
    let grids = rle_decompress(reader.remaining(), cell_count * 3)?;
    if grids.len() != cell_count * 3 {
        return Err(CompressionError::SizeMismatch {
            expected: cell_count * 3,
            actual: grids.len(),
        });
    }

    Ok(HeightfieldLayer {
        header: LayerHeader {
            tile,
            layer,
            bmin,
            bmax,
            hmin,
            hmax,
            width,
            height,
            min_x,
            max_x,
            min_y,
            max_y,
        },
        heights: grids[..cell_count].to_vec(),
        areas: grids[cell_count..cell_count * 2].iter().map(|area| Area(*area)).collect(),
        cons: grids[cell_count * 2..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use bevy::math::Vec3;

    use super::*;
    use crate::layers::EMPTY_HEIGHT;

    const MAX_TEST_LEN: usize = 1 << 16;

    #[test]
    fn runs_shrink_and_restore() {
        let mut bytes = vec![7u8; 300];
        bytes.extend([1, 2, 3, 4, 5]);
        bytes.extend(vec![0u8; 40]);

        let compressed = rle_compress(&bytes);
        assert!(compressed.len() < 20);
        assert_eq!(rle_decompress(&compressed, MAX_TEST_LEN).expect("decompress"), bytes);
    }

    #[test]
    fn long_literal_runs_are_chunked() {
        let bytes: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();

        let compressed = rle_compress(&bytes);
        assert_eq!(rle_decompress(&compressed, MAX_TEST_LEN).expect("decompress"), bytes);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let compressed = rle_compress(&[9u8; 64]);

        assert_eq!(
            rle_decompress(&compressed[..4], MAX_TEST_LEN),
            Err(CompressionError::SizeMismatch {
                expected: 64,
                actual: 0
            })
        );
        assert_eq!(
            rle_decompress(&compressed[..compressed.len() - 1], MAX_TEST_LEN),
            Err(CompressionError::Truncated)
        );
        assert_eq!(rle_decompress(&compressed[..2], MAX_TEST_LEN), Err(CompressionError::Truncated));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut compressed = rle_compress(&[1u8; 16]);
        compressed[..4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert_eq!(
            rle_decompress(&compressed, 16),
            Err(CompressionError::SizeMismatch {
                expected: 16,
                actual: u32::MAX as usize
            })
        );
        assert_eq!(rle_decompress(&rle_compress(&[1u8; 16]), 16).map(|bytes| bytes.len()), Ok(16));
    }

    #[test]
    fn layer_survives_compression() {
        let width = 4;
        let layer = HeightfieldLayer {
            header: LayerHeader {
                tile: IVec2::new(-3, 7),
                layer: 2,
                bmin: Vec3::new(1.0, 2.0, 3.0),
                bmax: Vec3::new(5.0, 6.0, 7.0),
                hmin: 10,
                hmax: 12,
                width,
                height: width,
                min_x: 0,
                max_x: 3,
                min_y: 1,
                max_y: 3,
            },
            heights: (0..16).map(|i| if i < 4 { EMPTY_HEIGHT } else { 2 }).collect(),
            areas: (0..16).map(|i| if i < 4 { Area::NULL } else { Area::WALKABLE }).collect(),
            cons: vec![0b1111; 16],
        };
        let bounds = BoundingBox::new(Vec3::ZERO, Vec3::ONE);

        let compressed = compress_layer(&layer, bounds);
        assert_eq!(compressed.layer_index(), 2);
        assert_eq!(compressed.bounds(), &bounds);
        assert_eq!(decompress_layer(&compressed).expect("decompress"), layer);

        let corrupt = CompressedLayer::from_raw(2, bounds, vec![0; 12].into_boxed_slice());
        assert_eq!(decompress_layer(&corrupt), Err(CompressionError::BadMagic));
    }
}
