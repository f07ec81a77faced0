use bevy::{
    log::warn,
    math::{IVec2, UVec2, UVec3, UVec4},
    platform::collections::HashMap,
};
use smallvec::SmallVec;

use crate::{
    contour::{calc_area_of_polygon_2d, portal_direction, Contour, ContourSet},
    error::TileGenerationError,
    intersect, intersect_prop, left, left_on,
    settings::MAX_VERTICES_PER_POLYGON,
    Area,
};

pub(crate) type Polygon = SmallVec<[u32; MAX_VERTICES_PER_POLYGON]>;

/// Convex polygons of one layer in layer-local cell coordinates.
#[derive(Default, Debug)]
pub(crate) struct PolyMesh {
    pub vertices: Vec<UVec3>,
    pub polygons: Vec<Polygon>,
    /// For each polygon edge points to a polygon (if any) that shares the edge.
    pub edges: Vec<SmallVec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>>,
    pub regions: Vec<u16>,
    pub areas: Vec<Area>,
    pub flags: Vec<u16>,
}

impl PolyMesh {
    pub fn polygon_count(&self) -> usize {
        self.polygons.len()
    }
}

const VERTEX_BUCKET_COUNT: usize = 1 << 12; // 4 096
/// Vertices are indexed with 16 bits in the tile data, the last value is reserved.
pub(crate) const MAX_MESH_VERTICES: usize = 0xfffe;
const INDEX_MASK: u32 = 0x0fffffff;
const FLAG_CAN_REMOVE: u32 = 0x80000000;

pub(crate) fn build_poly_mesh(contour_set: &ContourSet, max_verts_per_poly: usize) -> Result<PolyMesh, TileGenerationError> {
    #[cfg(feature = "trace")]
    let _span = bevy::log::info_span!("build_poly_mesh").entered();

    let max_verts_per_poly = max_verts_per_poly.clamp(3, MAX_VERTICES_PER_POLYGON);

    // Holes left unmerged wind the other way & would fill the area they cut out.
    let is_outline =
        |contour: &&Contour| contour.vertices.len() >= 3 && calc_area_of_polygon_2d(&contour.vertices) > 0;

    let mut max_vertices = 0;
    let mut max_tris = 0;
    let mut max_verts_per_contour = 0;

    for contour in contour_set.contours.iter().filter(is_outline) {
        max_vertices += contour.vertices.len();
        max_tris += contour.vertices.len() - 2;
        max_verts_per_contour = contour.vertices.len().max(max_verts_per_contour);
    }

    let mut poly_mesh = PolyMesh {
        vertices: Vec::with_capacity(max_vertices),
        polygons: Vec::with_capacity(max_tris),
        ..Default::default()
    };

    let mut first_vertex = vec![-1; VERTEX_BUCKET_COUNT];
    let mut next_vertex = vec![0; max_vertices];

    let mut indices = Vec::with_capacity(max_verts_per_contour);
    let mut vertex_map = Vec::with_capacity(max_verts_per_contour);
    let mut triangles = Vec::with_capacity(max_verts_per_contour * 3);
    let mut polygons: Vec<Polygon> = Vec::with_capacity(max_verts_per_contour + 1);
    // Portal edges keyed by their mesh vertices.
    let mut portal_edges: HashMap<(u32, u32), u8> = HashMap::default();

    for contour in contour_set.contours.iter().filter(is_outline) {
        indices.clear();
        triangles.clear();
        polygons.clear();
        vertex_map.clear();

        indices.extend(0..contour.vertices.len() as u32);

        if !triangulate(&contour.vertices, &mut indices, &mut triangles) {
            warn!("Triangulation failed for contour of region {}.", contour.region);
        }

        for vertex in contour.vertices.iter() {
            let index = add_vertex(
                vertex.truncate(),
                &mut poly_mesh.vertices,
                &mut first_vertex,
                &mut next_vertex,
            );
            vertex_map.push(index);
        }

        for (i, vertex) in contour.vertices.iter().enumerate() {
            if let Some(dir) = portal_direction(vertex.w) {
                let next = vertex_map[(i + 1) % vertex_map.len()];
                portal_edges.insert((vertex_map[i], next), dir);
            }
        }

        for triangle in triangles.chunks_exact(3) {
            let [a, b, c] = [
                vertex_map[triangle[0] as usize],
                vertex_map[triangle[1] as usize],
                vertex_map[triangle[2] as usize],
            ];

            if a != b && a != c && b != c {
                polygons.push(SmallVec::from_slice(&[a, b, c]));
            }
        }

        if polygons.is_empty() {
            continue;
        }

        if max_verts_per_poly > 3 {
            merge_polygons(&mut polygons, &poly_mesh.vertices, max_verts_per_poly);
        }

        // Store polygons.
        for polygon in polygons.drain(..) {
            poly_mesh.polygons.push(polygon);
            poly_mesh.regions.push(contour.region);
            poly_mesh.areas.push(contour.area);
        }
    }

    if poly_mesh.vertices.len() > MAX_MESH_VERTICES {
        return Err(TileGenerationError::TooManyVertices {
            count: poly_mesh.vertices.len(),
        });
    }

    // For each edge, find other polygon that shares that edge.
    build_mesh_adjacency(&poly_mesh.polygons, poly_mesh.vertices.len(), &mut poly_mesh.edges);

    // Edges along portals connect to whatever lies in that direction.
    for (polygon, edges) in poly_mesh.polygons.iter().zip(poly_mesh.edges.iter_mut()) {
        for (index, edge) in edges.iter_mut().enumerate() {
            let EdgeConnection::None = edge else {
                continue;
            };

            let vertex_a = polygon[index];
            let vertex_b = polygon[(index + 1) % polygon.len()];
            if let Some(dir) = portal_edges.get(&(vertex_a, vertex_b)) {
                *edge = EdgeConnection::External(EdgeConnectionDirection::from_index(*dir));
            }
        }
    }

    poly_mesh.flags = vec![0; poly_mesh.polygons.len()];

    Ok(poly_mesh)
}

/// Greedily merges triangles of one contour into convex polygons, longest shared edge first.
fn merge_polygons(polygons: &mut Vec<Polygon>, vertices: &[UVec3], max_verts_per_poly: usize) {
    loop {
        let mut best_merge_value = 0;
        let mut best = None;

        for a in 0..polygons.len() {
            for b in a + 1..polygons.len() {
                if let Some((value, edge_a, edge_b)) =
                    get_poly_merge_value(&polygons[a], &polygons[b], vertices, max_verts_per_poly)
                {
                    if value > best_merge_value {
                        best_merge_value = value;
                        best = Some((a, b, edge_a, edge_b));
                    }
                }
            }
        }

        let Some((a, b, edge_a, edge_b)) = best else {
            break;
        };

        let polygon_a = &polygons[a];
        let polygon_b = &polygons[b];
        let mut merged = Polygon::new();
        for i in 0..polygon_a.len() - 1 {
            merged.push(polygon_a[(edge_a + 1 + i) % polygon_a.len()]);
        }
        for i in 0..polygon_b.len() - 1 {
            merged.push(polygon_b[(edge_b + 1 + i) % polygon_b.len()]);
        }

        polygons[a] = merged;
        polygons.swap_remove(b);
    }
}

/// Returns the squared length of the shared edge if ``a`` & ``b`` can be merged into one convex polygon.
fn get_poly_merge_value(
    a: &[u32],
    b: &[u32],
    vertices: &[UVec3],
    max_verts_per_poly: usize,
) -> Option<(u32, usize, usize)> {
    if a.len() + b.len() - 2 > max_verts_per_poly {
        return None;
    }

    // Check if the polygons share an edge.
    let ordered = |x: u32, y: u32| if x > y { (y, x) } else { (x, y) };
    let (edge_a, edge_b) = (0..a.len()).find_map(|i| {
        let edge = ordered(a[i], a[(i + 1) % a.len()]);

        (0..b.len())
            .find(|j| ordered(b[*j], b[(j + 1) % b.len()]) == edge)
            .map(|j| (i, j))
    })?;

    // Check that the merged polygon would be convex.
    let vertex = |index: u32| vertices[index as usize].as_ivec3().extend(0);
    let convex_a = left(
        vertex(a[(edge_a + a.len() - 1) % a.len()]),
        vertex(a[edge_a]),
        vertex(b[(edge_b + 2) % b.len()]),
    );
    let convex_b = left(
        vertex(b[(edge_b + b.len() - 1) % b.len()]),
        vertex(b[edge_b]),
        vertex(a[(edge_a + 2) % a.len()]),
    );
    if !convex_a || !convex_b {
        return None;
    }

    let start = vertices[a[edge_a] as usize];
    let end = vertices[a[(edge_a + 1) % a.len()] as usize];
    let delta_x = start.x.abs_diff(end.x);
    let delta_z = start.z.abs_diff(end.z);

    Some((delta_x * delta_x + delta_z * delta_z, edge_a, edge_b))
}

/// Cardinal direction of a portal edge. Matches the neighbour directions of the heightfields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeConnectionDirection {
    XNegative,
    ZPositive,
    XPositive,
    ZNegative,
}
impl EdgeConnectionDirection {
    pub fn from_index(index: u8) -> Self {
        match index & 0b11 {
            0 => EdgeConnectionDirection::XNegative,
            1 => EdgeConnectionDirection::ZPositive,
            2 => EdgeConnectionDirection::XPositive,
            _ => EdgeConnectionDirection::ZNegative,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            EdgeConnectionDirection::XNegative => 0,
            EdgeConnectionDirection::ZPositive => 1,
            EdgeConnectionDirection::XPositive => 2,
            EdgeConnectionDirection::ZNegative => 3,
        }
    }

    /// Neighbouring tile coordinate in generation space tile axes.
    pub fn offset(&self, coordinate: IVec2) -> IVec2 {
        match self {
            EdgeConnectionDirection::XNegative => coordinate - IVec2::X,
            EdgeConnectionDirection::ZPositive => coordinate + IVec2::Y,
            EdgeConnectionDirection::XPositive => coordinate + IVec2::X,
            EdgeConnectionDirection::ZNegative => coordinate - IVec2::Y,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeConnection {
    None,
    Internal(u16),
    External(EdgeConnectionDirection),
}

#[derive(Debug)]
struct Edge {
    // The vertices that make up this edge.
    vertices: [u32; 2],
    // The index of the edge in respective polygon.
    edge_in_polygon: [usize; 2],
    // The polygons that this edge makes up.
    polygon: [usize; 2],
}

fn build_mesh_adjacency(
    polygons: &[Polygon],
    vertex_count: usize,
    in_edges: &mut Vec<SmallVec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>>,
) {
    let max_edge_count: usize = polygons.iter().map(|polygon| polygon.len()).sum();

    let mut first_edge = vec![None; vertex_count];
    let mut next_edge = vec![None; max_edge_count];
    let mut edges = Vec::with_capacity(max_edge_count);

    for (i, indices) in polygons.iter().enumerate() {
        for (j, current) in indices.iter().enumerate() {
            let next = indices[(j + 1) % indices.len()];
            if *current < next {
                let edge = Edge {
                    vertices: [*current, next],
                    edge_in_polygon: [j, 0],
                    polygon: [i, i],
                };

                next_edge[edges.len()] = first_edge[*current as usize];
                first_edge[*current as usize] = Some(edges.len());
                edges.push(edge);
            }
        }
    }

    for (i, indices) in polygons.iter().enumerate() {
        for (j, current) in indices.iter().enumerate() {
            let next = indices[(j + 1) % indices.len()];
            if *current > next {
                let mut edge_iter = first_edge[next as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vertices[1] == *current && edge.polygon[0] == edge.polygon[1] {
                        edge.polygon[1] = i;
                        edge.edge_in_polygon[1] = j;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    in_edges.clear();
    in_edges.extend(
        polygons
            .iter()
            .map(|polygon| SmallVec::from_elem(EdgeConnection::None, polygon.len())),
    );
    for edge in edges.iter() {
        if edge.polygon[0] != edge.polygon[1] {
            let polygon_one = edge.polygon[0];
            let polygon_two = edge.polygon[1];
            in_edges[polygon_one][edge.edge_in_polygon[0]] = EdgeConnection::Internal(polygon_two as u16);
            in_edges[polygon_two][edge.edge_in_polygon[1]] = EdgeConnection::Internal(polygon_one as u16);
        }
    }
}

/// Groups polygons for hierarchical path searches. One cluster per region.
#[derive(Default, Debug, PartialEq)]
pub(crate) struct ClusterSet {
    pub cluster_count: u16,
    /// Cluster of each polygon.
    pub poly_clusters: Vec<u16>,
    /// Pairs of clusters sharing at least one polygon edge. Sorted & unique.
    pub links: Vec<[u16; 2]>,
}

pub(crate) fn build_clusters(poly_mesh: &PolyMesh) -> ClusterSet {
    let mut region_clusters: HashMap<u16, u16> = HashMap::default();
    let poly_clusters: Vec<u16> = poly_mesh
        .regions
        .iter()
        .map(|region| {
            let next = region_clusters.len() as u16;
            *region_clusters.entry(*region).or_insert(next)
        })
        .collect();

    let mut links = Vec::new();
    for (polygon, edges) in poly_mesh.edges.iter().enumerate() {
        for edge in edges.iter() {
            let EdgeConnection::Internal(other) = edge else {
                continue;
            };

            let (from, to) = (poly_clusters[polygon], poly_clusters[usize::from(*other)]);
            if from != to {
                links.push([from, to]);
            }
        }
    }
    links.sort_unstable();
    links.dedup();

    ClusterSet {
        cluster_count: region_clusters.len() as u16,
        poly_clusters,
        links,
    }
}

fn compute_vertex_hash(x: u64, z: u64) -> u64 {
    const HASH_X: u64 = 0x8da6b343; // Large multiplicative constants,
    const HASH_Z: u64 = 0xcb1ab31f; // arbitrarily chosen primes.

    let hash = x.wrapping_mul(HASH_X).wrapping_add(z.wrapping_mul(HASH_Z));

    hash & (VERTEX_BUCKET_COUNT - 1) as u64 // Wrap it.
}

fn add_vertex(vertex: UVec3, vertices: &mut Vec<UVec3>, first_vertex: &mut [i32], next_vertex: &mut [i32]) -> u32 {
    let bucket = compute_vertex_hash(vertex.x.into(), vertex.z.into()) as usize;
    let mut i = first_vertex[bucket];

    while i != -1 {
        let other_vertex = vertices[i as usize];
        if other_vertex.x == vertex.x && other_vertex.y.abs_diff(vertex.y) <= 1 && other_vertex.z == vertex.z {
            return i as u32;
        }
        i = next_vertex[i as usize];
    }

    let i = vertices.len();
    vertices.push(vertex);
    next_vertex[i] = first_vertex[bucket];
    first_vertex[bucket] = i as i32;
    i as u32
}

#[inline]
fn point(vertices: &[UVec4], index: u32) -> UVec4 {
    vertices[(index & INDEX_MASK) as usize]
}

/// Ear clipping. Returns false if the polygon couldn't be fully triangulated, ``triangles`` then holds what could be.
fn triangulate(vertices: &[UVec4], indices: &mut Vec<u32>, triangles: &mut Vec<u32>) -> bool {
    for i in 0..indices.len() {
        let next = (i + 1) % indices.len();
        let next_next = (next + 1) % indices.len();

        if diagonal(i, next_next, vertices, indices) {
            indices[next] |= FLAG_CAN_REMOVE;
        }
    }

    while indices.len() > 3 {
        let mut min_len = u32::MAX;
        let mut min_index = None;

        for i in 0..indices.len() {
            let next = (i + 1) % indices.len();
            if indices[next] & FLAG_CAN_REMOVE != 0 {
                let point_a = point(vertices, indices[i]);
                let point_b = point(vertices, indices[(next + 1) % indices.len()]);

                let delta = UVec2::new(point_b.x.abs_diff(point_a.x), point_b.z.abs_diff(point_a.z));
                let square_length = delta.x * delta.x + delta.y * delta.y;

                if square_length < min_len {
                    min_len = square_length;
                    min_index = Some(i);
                }
            }
        }

        if min_index.is_none() {
            // Try a looser diagonal test to recover from overlapping segments.
            for i in 0..indices.len() {
                let next = (i + 1) % indices.len();
                let next_next = (next + 1) % indices.len();
                if diagonal_loose(i, next_next, vertices, indices) {
                    let point_a = point(vertices, indices[i]);
                    let point_b = point(vertices, indices[(next_next + 1) % indices.len()]);

                    let delta = UVec2::new(point_b.x.abs_diff(point_a.x), point_b.z.abs_diff(point_a.z));
                    let square_length = delta.x * delta.x + delta.y * delta.y;

                    if square_length < min_len {
                        min_len = square_length;
                        min_index = Some(i);
                    }
                }
            }
        }

        let Some(i) = min_index else {
            return false;
        };

        let next = {
            let next = (i + 1) % indices.len();
            let next_next = (next + 1) % indices.len();

            triangles.push(indices[i] & INDEX_MASK);
            triangles.push(indices[next] & INDEX_MASK);
            triangles.push(indices[next_next] & INDEX_MASK);

            indices.remove(next);

            if next >= indices.len() {
                0
            } else {
                next
            }
        };

        let i = (indices.len() + next - 1) % indices.len();
        let prev = (indices.len() + i - 1) % indices.len();
        let next_next = (next + 1) % indices.len();

        if diagonal(prev, next, vertices, indices) {
            indices[i] |= FLAG_CAN_REMOVE;
        } else {
            indices[i] &= INDEX_MASK;
        }

        if diagonal(i, next_next, vertices, indices) {
            indices[next] |= FLAG_CAN_REMOVE;
        } else {
            indices[next] &= INDEX_MASK;
        }
    }

    triangles.push(indices[0] & INDEX_MASK);
    triangles.push(indices[1] & INDEX_MASK);
    triangles.push(indices[2] & INDEX_MASK);
    indices.clear();

    true
}

fn vec_equal(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}

/// Whether the diagonal ``i``-``j`` lies inside the polygon near vertex ``i``.
///
/// ``strict`` excludes diagonals collinear with the neighbouring edges.
fn in_cone(i: usize, j: usize, vertices: &[UVec4], indices: &[u32], strict: bool) -> bool {
    let point_i = point(vertices, indices[i]).as_ivec4();
    let point_j = point(vertices, indices[j]).as_ivec4();
    let point_i_next = point(vertices, indices[(i + 1) % indices.len()]).as_ivec4();
    let point_i_prev = point(vertices, indices[(indices.len() + i - 1) % indices.len()]).as_ivec4();

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if left_on(point_i_prev, point_i, point_i_next) {
        return if strict {
            left(point_i, point_j, point_i_prev) && left(point_j, point_i, point_i_next)
        } else {
            left_on(point_i, point_j, point_i_prev) && left_on(point_j, point_i, point_i_next)
        };
    }

    // Assume (i-1,i,i+1) not collinear.
    !(left_on(point_i, point_j, point_i_next) && left_on(point_j, point_i, point_i_prev))
}

/// Whether ``i``-``j`` is a proper internal or external diagonal, ignoring edges incident to either end.
fn diagonalie(i: usize, j: usize, vertices: &[UVec4], indices: &[u32], strict: bool) -> bool {
    let diagonal_one = point(vertices, indices[i]);
    let diagonal_two = point(vertices, indices[j]);

    for edge in 0..indices.len() {
        let next_edge = (edge + 1) % indices.len();

        if edge == i || next_edge == i || edge == j || next_edge == j {
            continue;
        }

        let point_one = point(vertices, indices[edge]);
        let point_two = point(vertices, indices[next_edge]);

        if vec_equal(diagonal_one, point_one)
            || vec_equal(diagonal_two, point_one)
            || vec_equal(diagonal_one, point_two)
            || vec_equal(diagonal_two, point_two)
        {
            continue;
        }

        let (a, b, c, d) = (
            diagonal_one.as_ivec4(),
            diagonal_two.as_ivec4(),
            point_one.as_ivec4(),
            point_two.as_ivec4(),
        );
        let intersects = if strict {
            intersect(a, b, c, d)
        } else {
            intersect_prop(a, b, c, d)
        };
        if intersects {
            return false;
        }
    }

    true
}

fn diagonal(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    in_cone(i, j, vertices, indices, true) && diagonalie(i, j, vertices, indices, true)
}

fn diagonal_loose(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    in_cone(i, j, vertices, indices, false) && diagonalie(i, j, vertices, indices, false)
}
