use std::sync::{Arc, RwLock};

use bevy::{log::debug, platform::collections::HashMap, prelude::Resource};

use crate::{error::NavMeshError, tile_blob::NavigationTile};

/// Salted reference to a tile in a [TiledNavMesh].
///
/// From the most significant bit: 16 bits of salt, 30 bits of tile index & 18 bits of polygon index. A reference
/// to a removed tile never matches the tile stored in its slot later because the salt changes on removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileRef(pub u64);

pub const SALT_BITS: u32 = 16;
pub const TILE_BITS: u32 = 30;
pub const POLY_BITS: u32 = 64 - SALT_BITS - TILE_BITS;

impl TileRef {
    pub(crate) fn encode(salt: u16, tile_index: u32, poly_index: u32) -> Self {
        Self(
            (u64::from(salt) << (POLY_BITS + TILE_BITS))
                | ((u64::from(tile_index) & ((1 << TILE_BITS) - 1)) << POLY_BITS)
                | (u64::from(poly_index) & ((1 << POLY_BITS) - 1)),
        )
    }

    pub fn salt(&self) -> u16 {
        (self.0 >> (POLY_BITS + TILE_BITS)) as u16
    }

    pub fn tile_index(&self) -> u32 {
        ((self.0 >> POLY_BITS) & ((1 << TILE_BITS) - 1)) as u32
    }

    pub fn poly_index(&self) -> u32 {
        (self.0 & ((1 << POLY_BITS) - 1)) as u32
    }
}

struct MeshTile {
    data: Box<[u8]>,
    decoded: NavigationTile,
}

struct TileSlot {
    salt: u16,
    tile: Option<MeshTile>,
}

/// Live, tiled nav-mesh. Owns the navigation tile data of every layer of every tile.
///
/// Only mutated by the generator's control side when it merges finished builds.
pub struct TiledNavMesh {
    max_tiles: usize,
    max_polys_per_tile: usize,
    slots: Vec<TileSlot>,
    free_slots: Vec<u32>,
    /// (tile x, tile y, layer) -> slot index.
    lookup: HashMap<(i32, i32, u8), u32>,
}

impl Default for TiledNavMesh {
    fn default() -> Self {
        Self::new(0, 1 << POLY_BITS)
    }
}

impl TiledNavMesh {
    pub fn new(max_tiles: usize, max_polys_per_tile: usize) -> Self {
        Self {
            max_tiles: max_tiles.min(1 << TILE_BITS),
            max_polys_per_tile: max_polys_per_tile.min(1 << POLY_BITS),
            slots: Vec::new(),
            free_slots: Vec::new(),
            lookup: HashMap::default(),
        }
    }

    pub fn max_tiles(&self) -> usize {
        self.max_tiles
    }

    pub fn max_polys_per_tile(&self) -> usize {
        self.max_polys_per_tile
    }

    pub fn tile_count(&self) -> usize {
        self.lookup.len()
    }

    /// Takes ownership of navigation tile data and inserts it.
    pub fn add_tile(&mut self, data: Box<[u8]>) -> Result<TileRef, NavMeshError> {
        let decoded = NavigationTile::from_bytes(&data)?;
        let key = (decoded.header.tile.x, decoded.header.tile.y, decoded.header.layer);

        if self.lookup.contains_key(&key) {
            return Err(NavMeshError::TileAlreadyExists {
                x: key.0,
                y: key.1,
                layer: key.2,
            });
        }

        let index = match self.free_slots.pop() {
            Some(index) => index,
            None if self.slots.len() < self.max_tiles => {
                self.slots.push(TileSlot { salt: 1, tile: None });
                (self.slots.len() - 1) as u32
            }
            None => {
                return Err(NavMeshError::TileLimitReached {
                    max_tiles: self.max_tiles,
                })
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.tile = Some(MeshTile { data, decoded });
        self.lookup.insert(key, index);

        let tile_ref = TileRef::encode(slot.salt, index, 0);
        debug!("Added tile ({},{}:{}) as {:?}", key.0, key.1, key.2, tile_ref);

        Ok(tile_ref)
    }

    /// Removes a tile, handing back its data. ``None`` if the reference is stale.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Option<Box<[u8]>> {
        let index = tile_ref.tile_index();
        let slot = self.slots.get_mut(index as usize)?;
        if slot.salt != tile_ref.salt() {
            return None;
        }

        let tile = slot.tile.take()?;
        // Zero is never a valid salt.
        slot.salt = slot.salt.wrapping_add(1).max(1);
        self.free_slots.push(index);

        let header = &tile.decoded.header;
        self.lookup.remove(&(header.tile.x, header.tile.y, header.layer));
        debug!(
            "Removed tile ({},{}:{}) {:?}",
            header.tile.x, header.tile.y, header.layer, tile_ref
        );

        Some(tile.data)
    }

    pub fn get_tile_at(&self, x: i32, y: i32, layer: u8) -> Option<TileRef> {
        let index = *self.lookup.get(&(x, y, layer))?;

        Some(TileRef::encode(self.slots[index as usize].salt, index, 0))
    }

    /// References of every layer at a tile coordinate, sorted by layer.
    pub fn tiles_at(&self, x: i32, y: i32) -> Vec<TileRef> {
        let mut layers: Vec<(u8, TileRef)> = self
            .lookup
            .iter()
            .filter(|((tile_x, tile_y, _), _)| *tile_x == x && *tile_y == y)
            .map(|((_, _, layer), index)| {
                (*layer, TileRef::encode(self.slots[*index as usize].salt, *index, 0))
            })
            .collect();
        layers.sort_unstable_by_key(|(layer, _)| *layer);

        layers.into_iter().map(|(_, tile_ref)| tile_ref).collect()
    }

    fn mesh_tile(&self, tile_ref: TileRef) -> Option<&MeshTile> {
        let slot = self.slots.get(tile_ref.tile_index() as usize)?;
        if slot.salt != tile_ref.salt() {
            return None;
        }

        slot.tile.as_ref()
    }

    pub fn tile(&self, tile_ref: TileRef) -> Option<&NavigationTile> {
        self.mesh_tile(tile_ref).map(|tile| &tile.decoded)
    }

    pub fn tile_data(&self, tile_ref: TileRef) -> Option<&[u8]> {
        self.mesh_tile(tile_ref).map(|tile| &*tile.data)
    }

    pub fn is_valid(&self, tile_ref: TileRef) -> bool {
        self.mesh_tile(tile_ref).is_some()
    }

    pub fn tiles(&self) -> impl Iterator<Item = (TileRef, &NavigationTile)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.tile
                .as_ref()
                .map(|tile| (TileRef::encode(slot.salt, index as u32, 0), &tile.decoded))
        })
    }
}

/// Shared handle to the live nav-mesh.
#[derive(Default, Resource, Clone)]
pub struct NavMesh(Arc<RwLock<TiledNavMesh>>);

impl NavMesh {
    pub fn new(tiled_nav_mesh: TiledNavMesh) -> Self {
        Self(Arc::new(RwLock::new(tiled_nav_mesh)))
    }

    pub fn get(&self) -> Arc<RwLock<TiledNavMesh>> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use bevy::math::{IVec2, UVec3, Vec3};
    use smallvec::smallvec;

    use super::*;
    use crate::{
        mesher::{build_clusters, EdgeConnection, PolyMesh},
        tile_blob::{create_navigation_tile_data, NavTileBuildParams},
        Area,
    };

    fn tile_data(x: i32, y: i32, layer: u8) -> Box<[u8]> {
        let mesh = PolyMesh {
            vertices: vec![UVec3::new(0, 0, 2), UVec3::new(2, 0, 0), UVec3::new(0, 0, 0)],
            polygons: vec![smallvec![0, 1, 2]],
            edges: vec![smallvec![EdgeConnection::None; 3]],
            regions: vec![1],
            areas: vec![Area::WALKABLE],
            flags: vec![1],
        };
        let clusters = build_clusters(&mesh);

        create_navigation_tile_data(&NavTileBuildParams {
            tile: IVec2::new(x, y),
            layer,
            bmin: Vec3::ZERO,
            bmax: Vec3::ONE,
            cell_size: 0.5,
            cell_height: 0.5,
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.5,
            poly_mesh: &mesh,
            detail_mesh: None,
            clusters: &clusters,
            off_mesh_connections: &[],
        })
        .expect("tile data")
    }

    #[test]
    fn references_round_trip() {
        let tile_ref = TileRef::encode(0xbeef, (1 << TILE_BITS) - 1, 12345);

        assert_eq!(tile_ref.salt(), 0xbeef);
        assert_eq!(tile_ref.tile_index(), (1 << TILE_BITS) - 1);
        assert_eq!(tile_ref.poly_index(), 12345);
    }

    #[test]
    fn add_lookup_and_remove() {
        let mut nav_mesh = TiledNavMesh::new(4, 16);

        let a = nav_mesh.add_tile(tile_data(0, 0, 0)).expect("room for tile");
        let b = nav_mesh.add_tile(tile_data(0, 0, 1)).expect("room for tile");
        nav_mesh.add_tile(tile_data(1, 0, 0)).expect("room for tile");

        assert_eq!(nav_mesh.tile_count(), 3);
        assert_eq!(nav_mesh.tiles_at(0, 0), vec![a, b]);
        assert_eq!(nav_mesh.get_tile_at(0, 0, 1), Some(b));
        assert_eq!(
            nav_mesh.add_tile(tile_data(0, 0, 1)),
            Err(NavMeshError::TileAlreadyExists { x: 0, y: 0, layer: 1 })
        );

        assert!(nav_mesh.remove_tile(a).is_some());
        assert!(!nav_mesh.is_valid(a));
        assert!(nav_mesh.remove_tile(a).is_none());
        assert_eq!(nav_mesh.tiles_at(0, 0), vec![b]);

        // The freed slot is reused with a new salt.
        let c = nav_mesh.add_tile(tile_data(5, 5, 0)).expect("room for tile");
        assert_eq!(c.tile_index(), a.tile_index());
        assert_ne!(c, a);
        assert_eq!(nav_mesh.tile(c).map(|tile| tile.header.tile), Some(IVec2::new(5, 5)));
    }

    #[test]
    fn tile_limit_is_enforced() {
        let mut nav_mesh = TiledNavMesh::new(1, 16);
        nav_mesh.add_tile(tile_data(0, 0, 0)).expect("room for tile");

        assert_eq!(
            nav_mesh.add_tile(tile_data(1, 0, 0)),
            Err(NavMeshError::TileLimitReached { max_tiles: 1 })
        );
        assert!(matches!(
            nav_mesh.add_tile(vec![1, 2, 3].into_boxed_slice()),
            Err(NavMeshError::InvalidTileData(_))
        ));
    }
}
