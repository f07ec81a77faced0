//! Binary navigation tile data.
//!
//! A tile is written once by a tile generator and handed to the [TiledNavMesh](crate::tiles::TiledNavMesh) as an
//! owned blob. [NavigationTile] decodes it again for inspection.
//!
//! Layout (little-endian): header, vertices, polygons, detail sub-meshes, detail vertices, detail triangles,
//! off-mesh connections, polygon clusters & cluster links.

use bevy::math::{IVec2, Vec3};
use smallvec::SmallVec;

use crate::{
    blob::{BlobReader, BlobWriter},
    detail_mesh::DetailMesh,
    error::{BlobError, TileGenerationError},
    mesher::{ClusterSet, EdgeConnection, PolyMesh, MAX_MESH_VERTICES},
    offmesh::{OffMeshConnection, OffMeshConnectionKind},
    settings::MAX_VERTICES_PER_POLYGON,
    Area,
};

const TILE_MAGIC: u32 = u32::from_le_bytes(*b"NVTL");
const TILE_VERSION: u32 = 1;

/// Neighbour value of an edge without a neighbour.
pub const NO_NEIGHBOUR: u16 = 0;
/// Set on neighbour values of edges leading to another tile. The low bits hold the direction.
pub const EXTERNAL_LINK: u16 = 0x8000;

const OFF_MESH_BIDIRECTIONAL: u8 = 1 << 0;
/// Side value of an off-mesh end point that lies inside the tile.
pub const OFF_MESH_SIDE_INSIDE: u8 = 0xff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolygonKind {
    Ground,
    /// Two vertex polygon standing in for an off-mesh connection.
    OffMeshConnection,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileHeader {
    pub tile: IVec2,
    pub layer: u8,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Generation space bounds.
    pub bmin: Vec3,
    pub bmax: Vec3,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NavPolygon {
    pub vertices: SmallVec<[u16; MAX_VERTICES_PER_POLYGON]>,
    /// Per edge: [NO_NEIGHBOUR], index of the neighbouring polygon + 1, or [EXTERNAL_LINK] | direction.
    pub neighbours: SmallVec<[u16; MAX_VERTICES_PER_POLYGON]>,
    pub flags: u16,
    pub area: Area,
    pub kind: PolygonKind,
}

/// Triangles of one ground polygon.
///
/// Triangle indices below the polygon's vertex count refer to the polygon's vertices, the rest to
/// ``detail_vertices[vertex_base + index - polygon vertex count]``.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetailMeshRange {
    pub vertex_base: u32,
    pub triangle_base: u32,
    pub vertex_count: u8,
    pub triangle_count: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OffMeshConnectionData {
    /// Generation space ``[a0, a1, b0, b1]``.
    pub vertices: [Vec3; 4],
    pub radius: f32,
    /// Polygon representing the connection in this tile.
    pub polygon: u16,
    pub bidirectional: bool,
    pub segment: bool,
    /// Side of the tile the end point lies on, [OFF_MESH_SIDE_INSIDE] if inside.
    pub side: u8,
    pub user_id: u32,
}

/// Decoded navigation tile.
#[derive(Clone, Debug, PartialEq)]
pub struct NavigationTile {
    pub header: TileHeader,
    /// Generation space.
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<NavPolygon>,
    pub detail_meshes: Vec<DetailMeshRange>,
    pub detail_vertices: Vec<Vec3>,
    pub detail_triangles: Vec<[u8; 4]>,
    pub off_mesh_connections: Vec<OffMeshConnectionData>,
    pub cluster_count: u16,
    pub poly_clusters: Vec<u16>,
    pub cluster_links: Vec<[u16; 2]>,
}

impl NavigationTile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = BlobReader::new(bytes);
        if reader.u32()? != TILE_MAGIC {
            return Err(BlobError::BadMagic);
        }
        let version = reader.u32()?;
        if version != TILE_VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }

        let tile = IVec2::new(reader.i32()?, reader.i32()?);
        let layer = reader.u8()?;
        let vertex_count = reader.count()?;
        let polygon_count = reader.count()?;
        let detail_mesh_count = reader.count()?;
        let detail_vertex_count = reader.count()?;
        let detail_triangle_count = reader.count()?;
        let off_mesh_count = reader.count()?;
        let cluster_count = reader.u16()?;
        let cluster_link_count = reader.count()?;
        let walkable_height = reader.f32()?;
        let walkable_radius = reader.f32()?;
        let walkable_climb = reader.f32()?;
        let bmin = reader.vec3()?;
        let bmax = reader.vec3()?;

        // Counts come from the data itself, cap pre-allocation by what the data could hold.
        let remaining = reader.remaining().len();
        let capacity = |count: usize| count.min(remaining);

        let mut vertices = Vec::with_capacity(capacity(vertex_count));
        for _ in 0..vertex_count {
            vertices.push(reader.vec3()?);
        }

        let mut polygons = Vec::with_capacity(capacity(polygon_count));
        for _ in 0..polygon_count {
            let count = usize::from(reader.u8()?).min(MAX_VERTICES_PER_POLYGON);
            let area = Area(reader.u8()?);
            let kind = match reader.u8()? {
                0 => PolygonKind::Ground,
                _ => PolygonKind::OffMeshConnection,
            };
            let flags = reader.u16()?;

            let mut polygon_vertices = SmallVec::new();
            let mut neighbours = SmallVec::new();
            for i in 0..MAX_VERTICES_PER_POLYGON {
                let vertex = reader.u16()?;
                if i < count {
                    polygon_vertices.push(vertex);
                }
            }
            for i in 0..MAX_VERTICES_PER_POLYGON {
                let neighbour = reader.u16()?;
                if i < count {
                    neighbours.push(neighbour);
                }
            }

            polygons.push(NavPolygon {
                vertices: polygon_vertices,
                neighbours,
                flags,
                area,
                kind,
            });
        }

        let mut detail_meshes = Vec::with_capacity(capacity(detail_mesh_count));
        for _ in 0..detail_mesh_count {
            detail_meshes.push(DetailMeshRange {
                vertex_base: reader.u32()?,
                triangle_base: reader.u32()?,
                vertex_count: reader.u8()?,
                triangle_count: reader.u8()?,
            });
        }

        let mut detail_vertices = Vec::with_capacity(capacity(detail_vertex_count));
        for _ in 0..detail_vertex_count {
            detail_vertices.push(reader.vec3()?);
        }

        let mut detail_triangles = Vec::with_capacity(capacity(detail_triangle_count));
        for _ in 0..detail_triangle_count {
            let mut triangle = [0; 4];
            triangle.copy_from_slice(reader.take(4)?);
            detail_triangles.push(triangle);
        }

        let mut off_mesh_connections = Vec::with_capacity(capacity(off_mesh_count));
        for _ in 0..off_mesh_count {
            let vertices = [reader.vec3()?, reader.vec3()?, reader.vec3()?, reader.vec3()?];
            let radius = reader.f32()?;
            let polygon = reader.u16()?;
            let flags = reader.u8()?;
            let segment = reader.u8()? != 0;
            let side = reader.u8()?;
            let user_id = reader.u32()?;

            off_mesh_connections.push(OffMeshConnectionData {
                vertices,
                radius,
                polygon,
                bidirectional: flags & OFF_MESH_BIDIRECTIONAL != 0,
                segment,
                side,
                user_id,
            });
        }

        let mut poly_clusters = Vec::with_capacity(capacity(detail_mesh_count));
        for _ in 0..detail_mesh_count {
            poly_clusters.push(reader.u16()?);
        }

        let mut cluster_links = Vec::with_capacity(capacity(cluster_link_count));
        for _ in 0..cluster_link_count {
            cluster_links.push([reader.u16()?, reader.u16()?]);
        }

        Ok(Self {
            header: TileHeader {
                tile,
                layer,
                walkable_height,
                walkable_radius,
                walkable_climb,
                bmin,
                bmax,
            },
            vertices,
            polygons,
            detail_meshes,
            detail_vertices,
            detail_triangles,
            off_mesh_connections,
            cluster_count,
            poly_clusters,
            cluster_links,
        })
    }

    pub fn ground_polygon_count(&self) -> usize {
        self.polygons
            .iter()
            .filter(|polygon| polygon.kind == PolygonKind::Ground)
            .count()
    }

    /// Area of the ground polygons projected on the XZ-plane in square world units.
    pub fn walkable_area(&self) -> f32 {
        self.polygons
            .iter()
            .filter(|polygon| polygon.kind == PolygonKind::Ground)
            .map(|polygon| {
                let mut area = 0.0;
                for i in 0..polygon.vertices.len() {
                    let a = self.vertices[usize::from(polygon.vertices[i])];
                    let b = self.vertices[usize::from(polygon.vertices[(i + 1) % polygon.vertices.len()])];
                    area += a.x * b.z - b.x * a.z;
                }

                area.abs() * 0.5
            })
            .sum()
    }
}

/// Everything needed to write one navigation tile.
pub(crate) struct NavTileBuildParams<'a> {
    pub tile: IVec2,
    pub layer: u8,
    /// Generation space origin & extent of the layer grid.
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub poly_mesh: &'a PolyMesh,
    pub detail_mesh: Option<&'a DetailMesh>,
    pub clusters: &'a ClusterSet,
    pub off_mesh_connections: &'a [OffMeshConnection],
}

/// Which side of the tile a point lies outside of, [OFF_MESH_SIDE_INSIDE] if inside.
fn classify_off_mesh_point(point: Vec3, bmin: Vec3, bmax: Vec3) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0;
    if point.x >= bmax.x {
        outcode |= XP;
    }
    if point.z >= bmax.z {
        outcode |= ZP;
    }
    if point.x < bmin.x {
        outcode |= XM;
    }
    if point.z < bmin.z {
        outcode |= ZM;
    }

    match outcode {
        XP => 0,
        _ if outcode == XP | ZP => 1,
        ZP => 2,
        _ if outcode == XM | ZP => 3,
        XM => 4,
        _ if outcode == XM | ZM => 5,
        ZM => 6,
        _ if outcode == XP | ZM => 7,
        _ => OFF_MESH_SIDE_INSIDE,
    }
}

/// Serializes a finished layer into navigation tile data.
///
/// Only off-mesh connections starting inside the tile are stored. Their end points are indexed after the mesh's
/// vertices, which fails the tile when they don't all fit in 16 bits.
pub(crate) fn create_navigation_tile_data(params: &NavTileBuildParams) -> Result<Box<[u8]>, TileGenerationError> {
    #[cfg(feature = "trace")]
    let _span = bevy::log::info_span!("create_navigation_tile_data").entered();

    let mesh = params.poly_mesh;
    let to_generation_space = |vertex: bevy::math::UVec3| {
        params.bmin
            + Vec3::new(
                vertex.x as f32 * params.cell_size,
                vertex.y as f32 * params.cell_height,
                vertex.z as f32 * params.cell_size,
            )
    };

    let off_mesh_connections: Vec<&OffMeshConnection> = params
        .off_mesh_connections
        .iter()
        .filter(|connection| {
            let start = connection.start();
            classify_off_mesh_point(start, params.bmin, params.bmax) == OFF_MESH_SIDE_INSIDE
                && start.y >= params.bmin.y - params.walkable_climb
                && start.y <= params.bmax.y + params.walkable_climb
        })
        .collect();

    let ground_polygons = mesh.polygons.len();
    let vertex_count = mesh.vertices.len() + off_mesh_connections.len() * 2;
    if vertex_count > MAX_MESH_VERTICES {
        return Err(TileGenerationError::TooManyVertices { count: vertex_count });
    }
    let polygon_count = ground_polygons + off_mesh_connections.len();

    // Polygons without a detail mesh get a triangle fan.
    let (detail_vertex_count, detail_triangle_count) = match params.detail_mesh {
        Some(detail) => (
            detail
                .meshes
                .iter()
                .zip(mesh.polygons.iter())
                .map(|(sub_mesh, polygon)| (sub_mesh.vertex_count as usize).saturating_sub(polygon.len()))
                .sum(),
            detail.triangles.len(),
        ),
        None => (0, mesh.polygons.iter().map(|polygon| polygon.len() - 2).sum()),
    };

    let mut writer = BlobWriter::with_capacity(128 + vertex_count * 12 + polygon_count * 29 + detail_triangle_count * 4);
    writer.u32(TILE_MAGIC);
    writer.u32(TILE_VERSION);
    writer.i32(params.tile.x);
    writer.i32(params.tile.y);
    writer.u8(params.layer);
    writer.i32(vertex_count as i32);
    writer.i32(polygon_count as i32);
    writer.i32(ground_polygons as i32);
    writer.i32(detail_vertex_count as i32);
    writer.i32(detail_triangle_count as i32);
    writer.i32(off_mesh_connections.len() as i32);
    writer.u16(params.clusters.cluster_count);
    writer.i32(params.clusters.links.len() as i32);
    writer.f32(params.walkable_height);
    writer.f32(params.walkable_radius);
    writer.f32(params.walkable_climb);
    writer.vec3(params.bmin);
    writer.vec3(params.bmax);

    // Vertices.
    for vertex in mesh.vertices.iter() {
        writer.vec3(to_generation_space(*vertex));
    }
    for connection in off_mesh_connections.iter() {
        writer.vec3(connection.vertices[0]);
        writer.vec3(connection.vertices[2]);
    }

    // Polygons.
    for (((polygon, edges), area), flags) in mesh
        .polygons
        .iter()
        .zip(mesh.edges.iter())
        .zip(mesh.areas.iter())
        .zip(mesh.flags.iter())
    {
        writer.u8(polygon.len() as u8);
        writer.u8(area.0);
        writer.u8(0);
        writer.u16(*flags);
        for i in 0..MAX_VERTICES_PER_POLYGON {
            writer.u16(polygon.get(i).map_or(u16::MAX, |index| *index as u16));
        }
        for i in 0..MAX_VERTICES_PER_POLYGON {
            let neighbour = match edges.get(i) {
                Some(EdgeConnection::Internal(other)) => other + 1,
                Some(EdgeConnection::External(direction)) => EXTERNAL_LINK | u16::from(direction.index()),
                Some(EdgeConnection::None) | None => NO_NEIGHBOUR,
            };
            writer.u16(neighbour);
        }
    }
    for (i, connection) in off_mesh_connections.iter().enumerate() {
        let first = (mesh.vertices.len() + i * 2) as u16;
        writer.u8(2);
        writer.u8(connection.area.0);
        writer.u8(1);
        writer.u16(connection.flags);
        for j in 0..MAX_VERTICES_PER_POLYGON {
            writer.u16(if j < 2 { first + j as u16 } else { u16::MAX });
        }
        for _ in 0..MAX_VERTICES_PER_POLYGON {
            writer.u16(NO_NEIGHBOUR);
        }
    }

    // Detail sub-meshes, vertices & triangles.
    match params.detail_mesh {
        Some(detail) => {
            let mut vertex_base = 0u32;
            for (sub_mesh, polygon) in detail.meshes.iter().zip(mesh.polygons.iter()) {
                let extra = sub_mesh.vertex_count.saturating_sub(polygon.len() as u32);
                writer.u32(vertex_base);
                writer.u32(sub_mesh.triangle_base);
                writer.u8(sub_mesh.vertex_count as u8);
                writer.u8(sub_mesh.triangle_count as u8);
                vertex_base += extra;
            }
            for (sub_mesh, polygon) in detail.meshes.iter().zip(mesh.polygons.iter()) {
                let start = (sub_mesh.vertex_base as usize + polygon.len()).min(detail.vertices.len());
                let end = (sub_mesh.vertex_base + sub_mesh.vertex_count) as usize;
                for vertex in detail.vertices[start..end.max(start)].iter() {
                    writer.vec3(to_generation_space(*vertex));
                }
            }
            for [a, b, c] in detail.triangles.iter() {
                writer.bytes(&[*a, *b, *c, 0]);
            }
        }
        None => {
            let mut triangle_base = 0u32;
            for polygon in mesh.polygons.iter() {
                let triangles = polygon.len() as u32 - 2;
                writer.u32(0);
                writer.u32(triangle_base);
                writer.u8(polygon.len() as u8);
                writer.u8(triangles as u8);
                triangle_base += triangles;
            }
            for polygon in mesh.polygons.iter() {
                for i in 2..polygon.len() {
                    writer.bytes(&[0, (i - 1) as u8, i as u8, 0]);
                }
            }
        }
    }

    // Off-mesh connections.
    for (i, connection) in off_mesh_connections.iter().enumerate() {
        for vertex in connection.vertices {
            writer.vec3(vertex);
        }
        writer.f32(connection.snap_radius);
        writer.u16((ground_polygons + i) as u16);
        writer.u8(if connection.bidirectional {
            OFF_MESH_BIDIRECTIONAL
        } else {
            0
        });
        writer.u8(u8::from(connection.kind == OffMeshConnectionKind::Segment));
        writer.u8(classify_off_mesh_point(connection.vertices[2], params.bmin, params.bmax));
        writer.u32(connection.user_id);
    }

    // Clusters.
    for polygon in 0..ground_polygons {
        writer.u16(params.clusters.poly_clusters.get(polygon).copied().unwrap_or_default());
    }
    for [a, b] in params.clusters.links.iter() {
        writer.u16(*a);
        writer.u16(*b);
    }

    Ok(writer.into_inner().into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use bevy::math::UVec3;
    use smallvec::smallvec;

    use super::*;
    use crate::mesher::{build_clusters, EdgeConnectionDirection};

    fn two_squares() -> PolyMesh {
        PolyMesh {
            vertices: vec![
                UVec3::new(0, 0, 4),
                UVec3::new(4, 0, 4),
                UVec3::new(4, 0, 0),
                UVec3::new(0, 0, 0),
                UVec3::new(8, 0, 4),
                UVec3::new(8, 0, 0),
            ],
            polygons: vec![smallvec![0, 1, 2, 3], smallvec![1, 4, 5, 2]],
            edges: vec![
                smallvec![
                    EdgeConnection::None,
                    EdgeConnection::Internal(1),
                    EdgeConnection::None,
                    EdgeConnection::External(EdgeConnectionDirection::XNegative)
                ],
                smallvec![
                    EdgeConnection::None,
                    EdgeConnection::None,
                    EdgeConnection::None,
                    EdgeConnection::Internal(0)
                ],
            ],
            regions: vec![1, 2],
            areas: vec![Area::WALKABLE, Area(3)],
            flags: vec![1, 2],
        }
    }

    fn params<'a>(
        mesh: &'a PolyMesh,
        clusters: &'a ClusterSet,
        off_mesh_connections: &'a [OffMeshConnection],
    ) -> NavTileBuildParams<'a> {
        NavTileBuildParams {
            tile: IVec2::new(2, -1),
            layer: 1,
            bmin: Vec3::new(10.0, 1.0, 20.0),
            bmax: Vec3::new(14.0, 3.0, 24.0),
            cell_size: 0.5,
            cell_height: 0.25,
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.5,
            poly_mesh: mesh,
            detail_mesh: None,
            clusters,
            off_mesh_connections,
        }
    }

    #[test]
    fn written_tile_decodes() {
        let mesh = two_squares();
        let clusters = build_clusters(&mesh);
        let data = create_navigation_tile_data(&params(&mesh, &clusters, &[])).expect("tile data");

        let tile = NavigationTile::from_bytes(&data).expect("valid tile");
        assert_eq!(tile.header.tile, IVec2::new(2, -1));
        assert_eq!(tile.header.layer, 1);
        assert_eq!(tile.vertices.len(), 6);
        assert_eq!(tile.vertices[1], Vec3::new(12.0, 1.0, 22.0));
        assert_eq!(tile.polygons.len(), 2);
        assert_eq!(tile.polygons[0].neighbours.as_slice(), &[0, 2, 0, EXTERNAL_LINK]);
        assert_eq!(tile.polygons[1].area, Area(3));
        assert_eq!(tile.polygons[1].flags, 2);
        // Fan triangulation without a detail mesh.
        assert_eq!(tile.detail_triangles.len(), 4);
        assert_eq!(tile.poly_clusters.len(), 2);
        assert!((tile.walkable_area() - 8.0).abs() < 1e-5);
    }

    #[test]
    fn only_off_mesh_connections_starting_inside_are_kept() {
        let mesh = two_squares();
        let clusters = build_clusters(&mesh);
        let connection = |start: Vec3| OffMeshConnection {
            kind: OffMeshConnectionKind::Point,
            vertices: [start, start, Vec3::new(30.0, 1.0, 21.0), Vec3::new(30.0, 1.0, 21.0)],
            bidirectional: true,
            snap_radius: 0.5,
            user_id: 3,
            area: Area::WALKABLE,
            flags: 1,
        };
        let connections = [
            connection(Vec3::new(11.0, 1.0, 21.0)),
            connection(Vec3::new(40.0, 1.0, 21.0)),
            connection(Vec3::new(11.0, 10.0, 21.0)),
        ];

        let data = create_navigation_tile_data(&params(&mesh, &clusters, &connections)).expect("tile data");
        let tile = NavigationTile::from_bytes(&data).expect("valid tile");

        assert_eq!(tile.off_mesh_connections.len(), 1);
        assert_eq!(tile.polygons.len(), 3);
        assert_eq!(tile.ground_polygon_count(), 2);
        let off_mesh = &tile.off_mesh_connections[0];
        assert_eq!(off_mesh.polygon, 2);
        assert_eq!(off_mesh.side, 0);
        assert!(off_mesh.bidirectional);
        assert_eq!(tile.polygons[2].kind, PolygonKind::OffMeshConnection);
    }

    #[test]
    fn corrupt_tiles_are_rejected() {
        let mesh = two_squares();
        let clusters = build_clusters(&mesh);
        let data = create_navigation_tile_data(&params(&mesh, &clusters, &[])).expect("tile data");

        assert_eq!(NavigationTile::from_bytes(&data[..data.len() - 1]), Err(BlobError::UnexpectedEnd));
        assert_eq!(NavigationTile::from_bytes(&[0; 16]), Err(BlobError::BadMagic));
    }

    #[test]
    fn off_mesh_end_points_count_towards_vertex_limit() {
        let mut mesh = two_squares();
        // Leave room for fewer end points than the connection needs.
        mesh.vertices
            .extend((mesh.vertices.len()..MAX_MESH_VERTICES - 1).map(|i| UVec3::new(i as u32 % 8, 0, 2)));
        let clusters = build_clusters(&mesh);
        let start = Vec3::new(11.0, 1.0, 21.0);
        let connections = [OffMeshConnection {
            kind: OffMeshConnectionKind::Point,
            vertices: [start, start, Vec3::new(13.0, 1.0, 23.0), Vec3::new(13.0, 1.0, 23.0)],
            bidirectional: false,
            snap_radius: 0.5,
            user_id: 0,
            area: Area::WALKABLE,
            flags: 1,
        }];

        assert!(create_navigation_tile_data(&params(&mesh, &clusters, &[])).is_ok());
        assert_eq!(
            create_navigation_tile_data(&params(&mesh, &clusters, &connections)),
            Err(TileGenerationError::TooManyVertices {
                count: MAX_MESH_VERTICES + 1
            })
        );
    }
}
