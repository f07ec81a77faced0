//! Rasterized spans of static geometry cached per tile.

use std::sync::Mutex;

use bevy::{
    log::error,
    math::{IVec2, Vec3},
    transform::components::Transform,
};

use crate::{
    blob::{BlobReader, BlobWriter},
    coords::BoundingBox,
    error::BlobError,
    geometry_export::GeometryCache,
    heightfields::{rasterize_geometry, SolidHeightfield},
    settings::BuildConfig,
    Area,
};

/// One solid span of a padded tile heightfield.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedSpan {
    pub x: u16,
    /// Row along generation space Z.
    pub z: u16,
    pub min: u16,
    pub max: u16,
    pub area: Area,
}

#[derive(Clone, Debug, PartialEq)]
struct CachedTile {
    tile: IVec2,
    spans: Vec<CachedSpan>,
}

/// Voxel cache of one element.
///
/// Serialized as an ``i32`` tile count followed by ``{tile_x: i32, tile_y: i32, num_spans: i32}`` records, each directly
/// followed by its spans ``{x: u16, y: u16, min: u16, max: u16, area: u8, pad: u8}``.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoxelCache {
    tiles: Vec<CachedTile>,
}

impl VoxelCache {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Cached spans of ``tile``, if any.
    pub fn get(&self, tile: IVec2) -> Option<&[CachedSpan]> {
        self.tiles
            .iter()
            .find(|cached| cached.tile == tile)
            .map(|cached| cached.spans.as_slice())
    }

    /// Stores the spans of ``tile``, replacing earlier ones.
    pub fn store(&mut self, tile: IVec2, spans: Vec<CachedSpan>) {
        if let Some(cached) = self.tiles.iter_mut().find(|cached| cached.tile == tile) {
            cached.spans = spans;
        } else {
            self.tiles.push(CachedTile { tile, spans });
        }
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let span_count: usize = self.tiles.iter().map(|cached| cached.spans.len()).sum();
        let mut writer = BlobWriter::with_capacity(4 + self.tiles.len() * 12 + span_count * 10);

        writer.i32(self.tiles.len() as i32);
        for cached in self.tiles.iter() {
            writer.i32(cached.tile.x);
            writer.i32(cached.tile.y);
            writer.i32(cached.spans.len() as i32);
            for span in cached.spans.iter() {
                writer.u16(span.x);
                writer.u16(span.z);
                writer.u16(span.min);
                writer.u16(span.max);
                writer.u8(span.area.0);
                writer.u8(0);
            }
        }

        writer.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = BlobReader::new(bytes);
        let tile_count = reader.count()?;

        let mut tiles = Vec::with_capacity(tile_count.min(1024));
        for _ in 0..tile_count {
            let tile = IVec2::new(reader.i32()?, reader.i32()?);
            let span_count = reader.count()?;

            let mut spans = Vec::with_capacity(span_count.min(1 << 16));
            for _ in 0..span_count {
                let x = reader.u16()?;
                let z = reader.u16()?;
                let min = reader.u16()?;
                let max = reader.u16()?;
                let area = Area(reader.u8()?);
                reader.u8()?;

                spans.push(CachedSpan { x, z, min, max, area });
            }

            tiles.push(CachedTile { tile, spans });
        }

        Ok(Self { tiles })
    }
}

/// Pool of scratch heightfields used while preparing voxel caches.
///
/// A heightfield is checked out by exactly one tile at a time & returned when the guard is dropped.
#[derive(Default)]
pub(crate) struct RasterizationScratchPool {
    free: Mutex<Vec<SolidHeightfield>>,
}

impl RasterizationScratchPool {
    pub fn checkout(&self) -> ScratchHeightfield<'_> {
        let heightfield = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(error) => {
                error!("Rasterization scratch pool lock poisoned: {error}");
                None
            }
        };

        ScratchHeightfield {
            heightfield: heightfield.unwrap_or_default(),
            pool: self,
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or_default()
    }
}

/// Heightfield checked out from a [RasterizationScratchPool].
pub(crate) struct ScratchHeightfield<'a> {
    heightfield: SolidHeightfield,
    pool: &'a RasterizationScratchPool,
}

impl std::ops::Deref for ScratchHeightfield<'_> {
    type Target = SolidHeightfield;

    fn deref(&self) -> &Self::Target {
        &self.heightfield
    }
}

impl std::ops::DerefMut for ScratchHeightfield<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.heightfield
    }
}

impl Drop for ScratchHeightfield<'_> {
    fn drop(&mut self) {
        let heightfield = std::mem::take(&mut self.heightfield);
        match self.pool.free.lock() {
            Ok(mut free) => free.push(heightfield),
            Err(error) => error!("Rasterization scratch pool lock poisoned: {error}"),
        }
    }
}

/// Generation space bounds of a tile's heightfield including its border.
pub(crate) fn padded_tile_bounds(config: &BuildConfig, tile: IVec2, total_bounds: &BoundingBox) -> BoundingBox {
    let border = f32::from(config.border_size) * config.cell_size;
    let recast = config.tile_bounds(tile, total_bounds).to_recast();

    BoundingBox::new(
        recast.min - Vec3::new(border, 0.0, border),
        recast.max + Vec3::new(border, 0.0, border),
    )
}

/// Rasterizes an element's geometry for one tile into cacheable spans.
///
/// ``instances`` are applied one after another. Without any the geometry is rasterized as is.
pub(crate) fn prepare_voxel_cache(
    pool: &RasterizationScratchPool,
    geometry: &GeometryCache,
    instances: &[Transform],
    tile: IVec2,
    total_bounds: &BoundingBox,
    config: &BuildConfig,
) -> Vec<CachedSpan> {
    #[cfg(feature = "trace")]
    let _span = bevy::log::info_span!("prepare_voxel_cache").entered();

    let bounds = padded_tile_bounds(config, tile, total_bounds);
    let side = config.tile_side_with_border();

    let mut heightfield = pool.checkout();
    heightfield.reset(side, side, bounds.min, bounds.max, config.cell_size, config.cell_height);

    if instances.is_empty() {
        rasterize_geometry(
            &mut heightfield,
            geometry,
            None,
            config.walkable_slope_angle,
            config.walkable_climb,
        );
    }
    for instance in instances.iter() {
        rasterize_geometry(
            &mut heightfield,
            geometry,
            Some(instance),
            config.walkable_slope_angle,
            config.walkable_climb,
        );
    }

    let width = heightfield.width;
    heightfield
        .columns
        .iter()
        .enumerate()
        .flat_map(|(index, column)| {
            column.iter().map(move |span| CachedSpan {
                x: (index % width) as u16,
                z: (index / width) as u16,
                min: span.min,
                max: span.max,
                area: span.area,
            })
        })
        .collect()
}

/// Adds cached spans to a heightfield of the same layout.
pub(crate) fn add_cached_spans(heightfield: &mut SolidHeightfield, spans: &[CachedSpan], merge_threshold: u16) {
    for span in spans.iter() {
        let (x, z) = (usize::from(span.x), usize::from(span.z));
        if x >= heightfield.width || z >= heightfield.height {
            continue;
        }

        heightfield.add_span(x, z, span.min, span.max, span.area, merge_threshold);
    }
}

#[cfg(test)]
mod tests {
    use bevy::math::Vec3;

    use super::*;
    use crate::{
        geometry_export::{CollisionShape, GeometryExport},
        settings::NavMeshSettings,
    };

    fn span(x: u16, z: u16) -> CachedSpan {
        CachedSpan {
            x,
            z,
            min: 1,
            max: 4,
            area: Area::WALKABLE,
        }
    }

    #[test]
    fn lookup_and_replace_by_tile() {
        let mut cache = VoxelCache::default();
        assert!(cache.get(IVec2::ZERO).is_none());

        cache.store(IVec2::new(1, 2), vec![span(0, 0)]);
        cache.store(IVec2::new(-1, 0), vec![span(3, 3), span(4, 3)]);
        cache.store(IVec2::new(1, 2), vec![span(5, 5)]);

        assert_eq!(cache.tile_count(), 2);
        assert_eq!(cache.get(IVec2::new(1, 2)), Some(&[span(5, 5)][..]));
        assert_eq!(cache.get(IVec2::new(-1, 0)).map(<[_]>::len), Some(2));
    }

    #[test]
    fn blob_layout() {
        let mut cache = VoxelCache::default();
        cache.store(IVec2::new(7, -3), vec![span(1, 2), span(2, 2)]);

        let bytes = cache.to_bytes();
        assert_eq!(bytes.len(), 4 + 12 + 2 * 10);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(-3i32).to_le_bytes());

        assert_eq!(VoxelCache::from_bytes(&bytes), Ok(cache));
        assert_eq!(
            VoxelCache::from_bytes(&bytes[..bytes.len() - 3]),
            Err(BlobError::UnexpectedEnd)
        );
        assert_eq!(
            VoxelCache::from_bytes(&(-1i32).to_le_bytes()),
            Err(BlobError::NegativeCount(-1))
        );
    }

    #[test]
    fn scratch_heightfields_return_to_pool() {
        let pool = RasterizationScratchPool::default();
        {
            let _a = pool.checkout();
            let _b = pool.checkout();
            assert_eq!(pool.free_count(), 0);
        }
        assert_eq!(pool.free_count(), 2);

        let _c = pool.checkout();
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn prepared_spans_match_direct_rasterization() {
        let settings = NavMeshSettings::from_agent(0.5, 2.0)
            .with_cell_size(0.5, 0.25)
            .with_tile_size(8.0);
        let config = BuildConfig::from_settings(&settings).expect("valid settings");
        let total = BoundingBox::new(Vec3::new(-20.0, -20.0, -5.0), Vec3::new(20.0, 20.0, 5.0));

        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::Box {
                half_extents: Vec3::new(3.0, 3.0, 0.5),
            },
            &Transform::from_xyz(4.0, -4.0, 0.0),
        );
        let geometry = export.finish();

        let pool = RasterizationScratchPool::default();
        let spans = prepare_voxel_cache(&pool, &geometry, &[], IVec2::ZERO, &total, &config);
        assert!(!spans.is_empty());
        assert_eq!(pool.free_count(), 1);

        let bounds = padded_tile_bounds(&config, IVec2::ZERO, &total);
        let side = config.tile_side_with_border();
        let mut direct = SolidHeightfield::new(side, side, bounds.min, bounds.max, config.cell_size, config.cell_height);
        rasterize_geometry(&mut direct, &geometry, None, config.walkable_slope_angle, config.walkable_climb);

        let mut cached = SolidHeightfield::new(side, side, bounds.min, bounds.max, config.cell_size, config.cell_height);
        add_cached_spans(&mut cached, &spans, config.walkable_climb);
        assert_eq!(cached.columns, direct.columns);
    }
}
