use std::cmp::Ordering;

use bevy::{
    log::warn,
    math::{IVec2, UVec2, UVec4},
};

use crate::{
    get_neighbour_index,
    heightfields::{OpenSpan, OpenTile},
    in_cone, intersect, Area,
};

/// Marks an edge leading to another layer or a neighbouring tile. The direction is stored at [PORTAL_DIR_SHIFT].
pub(crate) const FLAG_PORTAL: u32 = 0x10000;
pub(crate) const PORTAL_DIR_SHIFT: u32 = 17;
pub(crate) const MASK_CONTOUR_REGION: u32 = 0xffff;
/// Marks an edge between spans of different areas.
pub(crate) const FLAG_AREA_BORDER: u32 = 0x80000;
/// Everything that identifies what lies on the other side of an edge.
const MASK_CONTOUR_EDGE: u32 =
    MASK_CONTOUR_REGION | FLAG_PORTAL | (0b11 << PORTAL_DIR_SHIFT) | FLAG_AREA_BORDER;

/// Whether an edge is a wall or separates two areas. Only those are tessellated.
#[inline]
fn is_tessellated_edge(edge: u32) -> bool {
    edge & (MASK_CONTOUR_REGION | FLAG_PORTAL) == 0 || edge & FLAG_AREA_BORDER != 0
}

/// Returns the portal direction of a contour vertex's outgoing edge, if it is a portal.
#[inline]
pub(crate) fn portal_direction(vertex_flags: u32) -> Option<u8> {
    (vertex_flags & FLAG_PORTAL != 0).then_some(((vertex_flags >> PORTAL_DIR_SHIFT) & 0b11) as u8)
}

#[derive(Default, Clone, Debug)]
pub(crate) struct Contour {
    /// ``(x, y, z, flags)`` where flags describe the edge to the next vertex.
    pub vertices: Vec<UVec4>,
    pub region: u16,
    /// Unlike [OpenSpan] this can't be null as null spans are ignored when generating contours.
    pub area: Area,
}

#[derive(Default, Debug)]
pub(crate) struct ContourSet {
    pub contours: Vec<Contour>,
    pub width: usize,
    pub height: usize,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ContourSettings {
    /// Maximum deviation from the raw contour in cells.
    pub max_error: f32,
    /// Maximum length of a wall edge in cells. Zero disables splitting.
    pub max_edge_len: u16,
}

#[derive(Clone)]
struct ContourHole {
    contour: usize,
    min_x: u32,
    min_z: u32,
    left_most_vertex: u32,
}

#[derive(Default, Clone)]
struct ContourRegion {
    outline: Option<usize>,
    holes: Vec<ContourHole>,
}

/// Traces the outline of every region of a layer.
pub(crate) fn build_contours(open_tile: &OpenTile, settings: ContourSettings) -> ContourSet {
    #[cfg(feature = "trace")]
    let _span = bevy::log::info_span!("build_contours").entered();

    let mut contour_set = ContourSet {
        contours: Vec::with_capacity(usize::from(open_tile.max_regions).max(8)),
        width: open_tile.width,
        height: open_tile.height,
    };

    // Mark boundaries.
    let mut boundary_flags = vec![0u8; open_tile.span_count];
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let mut connected = 0;

            for dir in 0..4 {
                let other_region = open_tile
                    .neighbour(cell_index, span, dir)
                    .map_or(0, |(_, other)| other.region);

                if span.region == other_region {
                    connected |= 1 << dir;
                }
            }

            boundary_flags[span.tile_index] = connected ^ 0b1111; // Flip so we mark unconnected sides.
        }
    }

    let mut vertices = Vec::with_capacity(256);
    let mut simplified_vertices = Vec::with_capacity(64);

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            if boundary_flags[span.tile_index] == 0 || boundary_flags[span.tile_index] == 0b1111 {
                boundary_flags[span.tile_index] = 0;
                continue;
            }
            if span.region == 0 {
                continue;
            }
            let area = open_tile.areas[span.tile_index];
            if area == Area::NULL {
                continue;
            }

            vertices.clear();
            simplified_vertices.clear();

            walk_contour(cell_index, span_index, open_tile, &mut boundary_flags, &mut vertices);

            simplify_contour(
                &vertices,
                &mut simplified_vertices,
                settings.max_error,
                settings.max_edge_len,
            );

            remove_degenerate_segments(&mut simplified_vertices);

            if simplified_vertices.len() >= 3 {
                contour_set.contours.push(Contour {
                    vertices: simplified_vertices.clone(),
                    region: span.region,
                    area,
                });
            }
        }
    }

    merge_holes(&mut contour_set, open_tile.max_regions);

    contour_set
}

/// Merges hole contours (clockwise winding) into the outline of their region.
fn merge_holes(contour_set: &mut ContourSet, max_regions: u16) {
    let has_holes = contour_set
        .contours
        .iter()
        .any(|contour| calc_area_of_polygon_2d(&contour.vertices) < 0);
    if !has_holes {
        return;
    }

    let mut regions = vec![ContourRegion::default(); usize::from(max_regions) + 1];
    for (i, contour) in contour_set.contours.iter().enumerate() {
        let Some(region) = regions.get_mut(usize::from(contour.region)) else {
            continue;
        };

        if calc_area_of_polygon_2d(&contour.vertices) < 0 {
            region.holes.push(ContourHole {
                contour: i,
                min_x: contour.vertices[0].x,
                min_z: contour.vertices[0].z,
                left_most_vertex: 0,
            });
        } else if region.outline.is_some() {
            warn!("Multiple outlines for region {}.", contour.region);
        } else {
            region.outline = Some(i);
        }
    }

    let mut merged_holes = vec![false; contour_set.contours.len()];
    for region in regions.iter_mut().filter(|region| !region.holes.is_empty()) {
        let Some(outline) = region.outline else {
            warn!("Region with holes has no outline, dropping its holes.");
            for hole in region.holes.iter() {
                merged_holes[hole.contour] = true;
            }
            continue;
        };

        merge_region_holes(&mut contour_set.contours, outline, &mut region.holes);
        for hole in region.holes.iter() {
            merged_holes[hole.contour] = true;
        }
    }

    let mut index = 0;
    contour_set.contours.retain(|_| {
        let keep = !merged_holes[index];
        index += 1;
        keep
    });
}

#[derive(Default, Clone, Copy)]
struct PotentialDiagonal {
    vertex: u32,
    distance: u32,
}

fn merge_region_holes(contours: &mut [Contour], outline_index: usize, holes: &mut [ContourHole]) {
    // Find left-most vertex
    for hole in holes.iter_mut() {
        for (i, vertex) in contours[hole.contour].vertices.iter().enumerate() {
            if vertex.x < hole.min_x || (vertex.x == hole.min_x && vertex.z < hole.min_z) {
                hole.min_x = vertex.x;
                hole.min_z = vertex.z;
                hole.left_most_vertex = i as u32;
            }
        }
    }

    holes.sort_by(|a, b| match a.min_x.cmp(&b.min_x) {
        Ordering::Equal => a.min_z.cmp(&b.min_z),
        ordering => ordering,
    });

    let max_vertices = contours[outline_index].vertices.len()
        + holes
            .iter()
            .map(|hole| contours[hole.contour].vertices.len())
            .sum::<usize>();
    let mut diagonals = Vec::with_capacity(max_vertices);

    for hole_i in 0..holes.len() {
        let hole = &contours[holes[hole_i].contour];
        let outline = &contours[outline_index];

        let mut index = None;
        let mut best_vertex = holes[hole_i].left_most_vertex;

        for _ in 0..hole.vertices.len() {
            // Find potential diagonals.
            diagonals.clear();
            let corner_vertex = hole.vertices[best_vertex as usize];
            for i in 0..outline.vertices.len() {
                if in_cone(i, &outline.vertices, corner_vertex) {
                    let delta_x = outline.vertices[i].x.abs_diff(corner_vertex.x);
                    let delta_z = outline.vertices[i].z.abs_diff(corner_vertex.z);
                    diagonals.push(PotentialDiagonal {
                        vertex: i as u32,
                        distance: delta_x * delta_x + delta_z * delta_z,
                    });
                }
            }

            diagonals.sort_by(|a, b| a.distance.cmp(&b.distance));

            // Find non-intersecting diagonals.
            index = diagonals
                .iter()
                .find(|potential_diagonal| {
                    let vertex = outline.vertices[potential_diagonal.vertex as usize];

                    !intersect_segment_contour(
                        vertex,
                        corner_vertex,
                        Some(potential_diagonal.vertex as usize),
                        &outline.vertices,
                    ) && !holes[hole_i..].iter().any(|other_hole| {
                        intersect_segment_contour(vertex, corner_vertex, None, &contours[other_hole.contour].vertices)
                    })
                })
                .map(|potential_diagonal| potential_diagonal.vertex);

            if index.is_some() {
                break;
            }

            best_vertex = (best_vertex + 1) % hole.vertices.len() as u32;
        }

        let Some(index) = index else {
            warn!("Failed to find merge points for contour hole.");
            continue;
        };

        let merged = merge_contours(
            &contours[outline_index].vertices,
            &contours[holes[hole_i].contour].vertices,
            index as usize,
            best_vertex as usize,
        );
        contours[outline_index].vertices = merged;
    }
}

/// Joins ``source`` into ``target`` through the diagonal between ``index_a`` & ``index_b``.
fn merge_contours(target: &[UVec4], source: &[UVec4], index_a: usize, index_b: usize) -> Vec<UVec4> {
    let mut vertices = Vec::with_capacity(target.len() + source.len() + 2);

    for i in 0..=target.len() {
        vertices.push(target[(index_a + i) % target.len()]);
    }

    for i in 0..=source.len() {
        vertices.push(source[(index_b + i) % source.len()]);
    }

    vertices
}

pub(crate) fn calc_area_of_polygon_2d(vertices: &[UVec4]) -> i32 {
    let mut area = 0;
    for i in 0..vertices.len() {
        let previous = vertices[i].as_ivec4();
        let next = vertices[(i + 1) % vertices.len()].as_ivec4();

        area += next.x * previous.z - previous.x * next.z;
    }

    (area + 1) / 2
}

/// Whether the segment ``point``-``corner`` crosses any edge of ``vertices``.
///
/// Edges touching ``skip_vertex`` are ignored.
fn intersect_segment_contour(point: UVec4, corner: UVec4, skip_vertex: Option<usize>, vertices: &[UVec4]) -> bool {
    for i in 0..vertices.len() {
        let next = (i + 1) % vertices.len();

        if skip_vertex.is_some_and(|skip| i == skip || next == skip) {
            continue;
        }

        let point_i = vertices[i];
        let point_next = vertices[next];

        let same = |a: UVec4, b: UVec4| a.x == b.x && a.z == b.z;
        if same(point, point_i) || same(corner, point_i) || same(point, point_next) || same(corner, point_next) {
            continue;
        }

        if intersect(
            point.as_ivec4(),
            corner.as_ivec4(),
            point_i.as_ivec4(),
            point_next.as_ivec4(),
        ) {
            return true;
        }
    }

    false
}

/// Whether the side ``dir`` of a cell faces the edge of the layer grid.
#[inline]
fn is_layer_edge(open_tile: &OpenTile, cell_index: usize, dir: u8) -> bool {
    let column = cell_index % open_tile.width;
    let row = cell_index / open_tile.width;

    match dir {
        0 => column == 0,
        1 => row + 1 == open_tile.height,
        2 => column + 1 == open_tile.width,
        _ => row == 0,
    }
}

fn walk_contour(
    mut cell_index: usize,
    mut span_index: usize,
    tile: &OpenTile,
    boundary_flags: &mut [u8],
    contour: &mut Vec<u32>,
) {
    let mut dir = 0u8;
    while (boundary_flags[tile.cells[cell_index].spans[span_index].tile_index] & (1 << dir)) == 0 {
        dir += 1;
    }
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;

    // Bounded by every side of every span being visited once.
    for _ in 0..tile.span_count * 4 + 4 {
        let row = cell_index / tile.width;
        let column = cell_index % tile.width;

        let span = &tile.cells[cell_index].spans[span_index];
        if boundary_flags[span.tile_index] & (1 << dir) > 0 {
            // Direction is unconnected.
            let height = get_corner_height(cell_index, span, tile, dir);

            let edge = match tile.neighbour(cell_index, span, dir.into()) {
                Some((_, other)) if tile.areas[other.tile_index] != tile.areas[span.tile_index] => {
                    u32::from(other.region) | FLAG_AREA_BORDER
                }
                Some((_, other)) => u32::from(other.region),
                None => {
                    let portal = tile.portals.get(span.tile_index).copied().unwrap_or_default() & (1 << dir) != 0;
                    if portal || is_layer_edge(tile, cell_index, dir) {
                        FLAG_PORTAL | (u32::from(dir) << PORTAL_DIR_SHIFT)
                    } else {
                        0
                    }
                }
            };

            let px = match dir {
                1 | 2 => column + 1,
                _ => column,
            } as u32;
            let pz = match dir {
                0 | 1 => row + 1,
                _ => row,
            } as u32;
            contour.extend_from_slice(&[px, u32::from(height), pz, edge]);

            boundary_flags[span.tile_index] &= !(1 << dir);
            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            let Some(index) = span.neighbours[dir as usize] else {
                warn!("Contour walk hit an unconnected side flagged as connected.");
                return;
            };
            span_index = index.into();

            cell_index = get_neighbour_index(tile.width, cell_index, dir.into());
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            return;
        }
    }

    warn!("Contour walk did not return to its start.");
}

fn get_corner_height(cell_index: usize, span: &OpenSpan, tile: &OpenTile, dir: u8) -> u16 {
    let next_dir = (dir + 1) & 0x3;
    let mut height = span.min;

    if let Some((other_cell_index, other_span)) = tile.neighbour(cell_index, span, dir.into()) {
        height = height.max(other_span.min);

        if let Some((_, diagonal)) = tile.neighbour(other_cell_index, other_span, next_dir.into()) {
            height = height.max(diagonal.min);
        }
    }

    if let Some((other_cell_index, other_span)) = tile.neighbour(cell_index, span, next_dir.into()) {
        height = height.max(other_span.min);

        if let Some((_, diagonal)) = tile.neighbour(other_cell_index, other_span, dir.into()) {
            height = height.max(diagonal.min);
        }
    }

    height
}

fn simplify_contour(points: &[u32], simplified: &mut Vec<UVec4>, max_error: f32, max_edge_len: u16) {
    let point_count = points.len() / 4;
    if point_count == 0 {
        return;
    }
    let edge = |i: usize| points[i * 4 + 3] & MASK_CONTOUR_EDGE;

    let has_connections = (0..point_count).any(|i| edge(i) != 0);

    if has_connections {
        // Keep every point where what lies across the edge changes.
        for i in 0..point_count {
            let next = (i + 1) % point_count;

            if edge(i) != edge(next) {
                simplified.push(UVec4::new(points[i * 4], points[i * 4 + 1], points[i * 4 + 2], i as u32));
            }
        }
    }

    // A single neighbour all around gives no fixed points, start from two corners & tessellate every edge.
    let uniform = simplified.is_empty();
    if uniform {
        let mut lower_left = 0;
        let mut upper_right = 0;

        for i in 0..point_count {
            let x = points[i * 4];
            let z = points[i * 4 + 2];
            let (ll_x, ll_z) = (points[lower_left * 4], points[lower_left * 4 + 2]);
            let (ur_x, ur_z) = (points[upper_right * 4], points[upper_right * 4 + 2]);

            if x < ll_x || (x == ll_x && z < ll_z) {
                lower_left = i;
            }
            if x > ur_x || (x == ur_x && z > ur_z) {
                upper_right = i;
            }
        }

        for i in [lower_left, upper_right] {
            simplified.push(UVec4::new(points[i * 4], points[i * 4 + 1], points[i * 4 + 2], i as u32));
        }
    }

    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();

        let mut a = simplified[i];
        let mut b = simplified[next];

        let (mut c_i, c_increments, end_i) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            let c_increments = 1;
            let c_i = (a.w + c_increments) % point_count as u32;
            (c_i, c_increments, b.w)
        } else {
            let c_increments = (point_count - 1) as u32;
            let c_i = (b.w + c_increments) % point_count as u32;

            std::mem::swap(&mut a.x, &mut b.x);
            std::mem::swap(&mut a.z, &mut b.z);
            (c_i, c_increments, a.w)
        };

        let mut max_deviation = 0.0;
        let mut max_i = None;

        // Only tesselate wall & area edges.
        if uniform || is_tessellated_edge(edge(c_i as usize)) {
            while c_i != end_i {
                let deviation = point_distance_from_segment(
                    UVec2::new(points[(c_i * 4) as usize], points[(c_i * 4 + 2) as usize]).as_ivec2(),
                    UVec2::new(a.x, a.z).as_ivec2(),
                    UVec2::new(b.x, b.z).as_ivec2(),
                );
                if deviation > max_deviation {
                    max_deviation = deviation;
                    max_i = Some(c_i);
                }
                c_i = (c_i + c_increments) % point_count as u32;
            }
        }

        match max_i {
            Some(max_i) if max_deviation > max_error * max_error => {
                let max_i = max_i as usize;
                simplified.insert(
                    i + 1,
                    UVec4::new(points[max_i * 4], points[max_i * 4 + 1], points[max_i * 4 + 2], max_i as u32),
                );
            }
            _ => i += 1,
        }
    }

    // Split long edges.
    if max_edge_len > 0 {
        let max_edge_len_sqr = u32::from(max_edge_len) * u32::from(max_edge_len);
        let mut i = 0;
        while i < simplified.len() {
            let a = simplified[i];
            let b = simplified[(i + 1) % simplified.len()];

            let next_original_point_index = (a.w as usize + 1) % point_count;

            let mut max_i = None;
            if is_tessellated_edge(edge(next_original_point_index)) {
                let delta_x = b.x.abs_diff(a.x);
                let delta_z = b.z.abs_diff(a.z);

                if delta_x * delta_x + delta_z * delta_z > max_edge_len_sqr {
                    let n = if b.w < a.w {
                        b.w as usize + point_count - a.w as usize
                    } else {
                        (b.w - a.w) as usize
                    };

                    if n > 1 {
                        let half = if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            n / 2
                        } else {
                            (n + 1) / 2
                        };
                        max_i = Some((a.w as usize + half) % point_count);
                    }
                }
            }

            if let Some(max_i) = max_i {
                simplified.insert(
                    i + 1,
                    UVec4::new(points[max_i * 4], points[max_i * 4 + 1], points[max_i * 4 + 2], max_i as u32),
                );
            } else {
                i += 1;
            }
        }
    }

    // Store what lies across the outgoing edge of each vertex.
    for point in simplified.iter_mut() {
        let next = (point.w as usize + 1) % point_count;
        point.w = points[next * 4 + 3];
    }
}

pub(crate) fn point_distance_from_segment(point: IVec2, seg_a: IVec2, seg_b: IVec2) -> f32 {
    let segment_delta = (seg_b - seg_a).as_vec2();
    let point_delta = (point - seg_a).as_vec2();

    let d = segment_delta.length_squared();
    let mut t = segment_delta.dot(point_delta);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let delta_x = seg_a.x as f32 + t * segment_delta.x - point.x as f32;
    let delta_y = seg_a.y as f32 + t * segment_delta.y - point.y as f32;

    delta_x * delta_x + delta_y * delta_y
}

/// Removes adjacent vertices which are equal on the XZ-plane.
fn remove_degenerate_segments(simplified: &mut Vec<UVec4>) {
    let mut i = 0;
    while i < simplified.len() && simplified.len() > 1 {
        let next = (i + 1) % simplified.len();

        let a = simplified[i];
        let b = simplified[next];

        if a.x == b.x && a.z == b.z {
            simplified.remove(i);
        } else {
            i += 1;
        }
    }
}
