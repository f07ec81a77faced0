use bevy::{math::Vec3, transform::components::Transform};
use smallvec::SmallVec;

use crate::{
    coords::{recast_to_world, world_to_recast, BoundingBox},
    geometry_export::GeometryCache,
    get_neighbour_index, Area,
};

pub(crate) const SPAN_MAX_HEIGHT: u16 = u16::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HeightSpan {
    pub min: u16,
    pub max: u16,
    pub area: Area,
}

/// Solid voxel representation of a tile. Spans in a column are sorted bottom to top and never overlap.
#[derive(Default)]
pub(crate) struct SolidHeightfield {
    pub width: usize,
    pub height: usize,
    /// Generation space bounds.
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    pub columns: Vec<SmallVec<[HeightSpan; 2]>>, // len = width * height. Laid out X to Z.
}

impl SolidHeightfield {
    pub fn new(width: usize, height: usize, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Self {
        let mut heightfield = Self::default();
        heightfield.reset(width, height, bmin, bmax, cs, ch);

        heightfield
    }

    /// Clears all spans & resizes while keeping allocations around.
    pub fn reset(&mut self, width: usize, height: usize, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) {
        self.width = width;
        self.height = height;
        self.bmin = bmin;
        self.bmax = bmax;
        self.cell_size = cs;
        self.cell_height = ch;

        for column in self.columns.iter_mut() {
            column.clear();
        }
        self.columns.resize(width * height, SmallVec::new());
    }

    pub fn span_count(&self) -> usize {
        self.columns.iter().map(|column| column.len()).sum()
    }

    /// Adds a span, merging it with any span it overlaps.
    ///
    /// When the tops of two merged spans are within ``merge_threshold`` the higher area wins.
    pub fn add_span(
        &mut self,
        x: usize,
        z: usize,
        min: u16,
        max: u16,
        area: Area,
        merge_threshold: u16,
    ) {
        let column = &mut self.columns[x + z * self.width];
        let mut new_span = HeightSpan { min, max, area };

        let mut i = 0;
        while i < column.len() {
            let current = column[i];
            if current.min > new_span.max {
                break;
            }
            if current.max < new_span.min {
                i += 1;
                continue;
            }

            new_span.min = new_span.min.min(current.min);
            new_span.max = new_span.max.max(current.max);
            if current.max.abs_diff(new_span.max) <= merge_threshold {
                new_span.area = new_span.area.max(current.area);
            }
            column.remove(i);
        }

        column.insert(i, new_span);
    }
}

/// Walkable open space above a solid span.
#[derive(Default, Clone, Debug)]
pub(crate) struct OpenSpan {
    pub min: u16,
    pub max: Option<u16>,
    pub neighbours: [Option<u16>; 4],
    pub tile_index: usize, // The index of this span in the whole tile.
    pub region: u16,
}

#[derive(Default, Clone, Debug)]
pub(crate) struct OpenCell {
    pub spans: Vec<OpenSpan>,
}

/// Compact heightfield. Only holds walkable spans & their connections.
#[derive(Default, Debug)]
pub(crate) struct OpenTile {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<OpenCell>, // len = width * height. Laid out X to Z.
    pub areas: Vec<Area>,     // Indexed by tile_index.
    pub distances: Vec<u16>,  // Distances used in watershed. Indexed by tile_index.
    pub max_distance: u16,
    pub span_count: usize,
    pub max_regions: u16,
    /// Per span bitmask of directions whose missing neighbour lies across a tile portal.
    pub portals: Vec<u8>,
}

impl OpenTile {
    #[inline]
    pub fn neighbour(&self, cell_index: usize, span: &OpenSpan, dir: usize) -> Option<(usize, &OpenSpan)> {
        let span_index = span.neighbours[dir]?;
        let other_cell = get_neighbour_index(self.width, cell_index, dir);

        Some((other_cell, &self.cells[other_cell].spans[span_index as usize]))
    }
}

/// Divides a convex polygon along ``clip_line`` on ``axis``.
///
/// Returns the part on the lower side of the line & the remainder.
fn divide_polygon(vertices: &[Vec3], clip_line: f32, axis: usize) -> (SmallVec<[Vec3; 8]>, SmallVec<[Vec3; 8]>) {
    let mut polygon_a = SmallVec::new();
    let mut polygon_b = SmallVec::new();

    let mut delta_from_line: SmallVec<[f32; 8]> = SmallVec::with_capacity(vertices.len());
    delta_from_line.extend(vertices.iter().map(|vertex| clip_line - vertex[axis]));

    for i in 0..vertices.len() {
        let j = (vertices.len() - 1 + i) % vertices.len(); // j is i-1 wrapped.

        let in_a = delta_from_line[j] >= 0.0;
        let in_b = delta_from_line[i] >= 0.0;

        if in_a != in_b {
            // Slide the vertex along to the edge.
            let slide = delta_from_line[j] / (delta_from_line[j] - delta_from_line[i]);
            let point = vertices[j] + (vertices[i] - vertices[j]) * slide;
            polygon_a.push(point);
            polygon_b.push(point);

            if delta_from_line[i] > 0.0 {
                polygon_a.push(vertices[i]);
            } else if delta_from_line[i] < 0.0 {
                polygon_b.push(vertices[i]);
            }
        } else {
            if delta_from_line[i] >= 0.0 {
                polygon_a.push(vertices[i]);

                if delta_from_line[i] != 0.0 {
                    continue;
                }
            }
            polygon_b.push(vertices[i]);
        }
    }

    (polygon_a, polygon_b)
}

/// Whether a triangle's slope is walkable. ``walkable_threshold`` is the cosine of the max slope.
#[inline]
fn is_walkable_triangle(triangle: &[Vec3; 3], walkable_threshold: f32) -> bool {
    let normal = (triangle[1] - triangle[0])
        .cross(triangle[2] - triangle[0])
        .normalize_or_zero();

    normal.y > walkable_threshold
}

pub(crate) fn rasterize_triangle(
    heightfield: &mut SolidHeightfield,
    triangle: &[Vec3; 3],
    area: Area,
    merge_threshold: u16,
) {
    let triangle_bounds = BoundingBox::from_points(triangle.iter().copied());
    let field_bounds = BoundingBox::new(heightfield.bmin, heightfield.bmax);
    if !triangle_bounds.intersects(&field_bounds) {
        return;
    }

    let width = heightfield.width as i32;
    let height = heightfield.height as i32;
    let cell_size = heightfield.cell_size;
    let inverse_cell_size = 1.0 / cell_size;
    let inverse_cell_height = 1.0 / heightfield.cell_height;
    let field_height = heightfield.bmax.y - heightfield.bmin.y;

    let z_0 = (((triangle_bounds.min.z - heightfield.bmin.z) * inverse_cell_size).floor() as i32)
        .clamp(-1, height - 1);
    let z_1 = (((triangle_bounds.max.z - heightfield.bmin.z) * inverse_cell_size).floor() as i32)
        .clamp(0, height - 1);

    let mut remainder: SmallVec<[Vec3; 8]> = SmallVec::from_slice(triangle);
    for z in z_0..=z_1 {
        let row_clip = heightfield.bmin.z + (z + 1) as f32 * cell_size;
        let (row, rest) = divide_polygon(&remainder, row_clip, 2);
        remainder = rest;

        if row.len() < 3 || z < 0 {
            continue;
        }

        let mut min_x = row[0].x;
        let mut max_x = row[0].x;
        for vertex in row.iter().skip(1) {
            min_x = min_x.min(vertex.x);
            max_x = max_x.max(vertex.x);
        }
        let x_0 = (((min_x - heightfield.bmin.x) * inverse_cell_size).floor() as i32).clamp(-1, width - 1);
        let x_1 = (((max_x - heightfield.bmin.x) * inverse_cell_size).floor() as i32).clamp(0, width - 1);

        let mut row_remainder = row;
        for x in x_0..=x_1 {
            let column_clip = heightfield.bmin.x + (x + 1) as f32 * cell_size;
            let (cell, rest) = divide_polygon(&row_remainder, column_clip, 0);
            row_remainder = rest;

            if cell.len() < 3 || x < 0 {
                continue;
            }

            let mut span_min = cell[0].y;
            let mut span_max = cell[0].y;
            for vertex in cell.iter().skip(1) {
                span_min = span_min.min(vertex.y);
                span_max = span_max.max(vertex.y);
            }
            span_min -= heightfield.bmin.y;
            span_max -= heightfield.bmin.y;

            // Skip the span if it is outside the heightfield bbox
            if span_max < 0.0 || span_min > field_height {
                continue;
            }
            let span_min = span_min.max(0.0);
            let span_max = span_max.min(field_height);

            let min = ((span_min * inverse_cell_height).floor() as i64)
                .clamp(0, i64::from(SPAN_MAX_HEIGHT)) as u16;
            let max = ((span_max * inverse_cell_height).ceil() as i64)
                .clamp(i64::from(min) + 1, i64::from(SPAN_MAX_HEIGHT)) as u16;

            heightfield.add_span(x as usize, z as usize, min, max, area, merge_threshold);
        }
    }
}

/// Rasterizes every triangle of ``geometry``. Triangles steeper than the slope are rasterized as [Area::NULL].
///
/// ``instance`` is a world space transform applied on top of the cached geometry. Returns the number of triangles rasterized.
pub(crate) fn rasterize_geometry(
    heightfield: &mut SolidHeightfield,
    geometry: &GeometryCache,
    instance: Option<&Transform>,
    walkable_slope_angle: f32,
    merge_threshold: u16,
) -> usize {
    let slope = geometry.slope_override().unwrap_or(walkable_slope_angle);
    let walkable_threshold = slope.to_radians().cos();

    let mut count = 0;
    for mut triangle in geometry.triangles() {
        if let Some(transform) = instance {
            for vertex in triangle.iter_mut() {
                *vertex = world_to_recast(transform.transform_point(recast_to_world(*vertex)));
            }
        }

        let area = if is_walkable_triangle(&triangle, walkable_threshold) {
            Area::WALKABLE
        } else {
            Area::NULL
        };
        rasterize_triangle(heightfield, &triangle, area, merge_threshold);
        count += 1;
    }

    count
}

/// Lets walkable spans "climb" onto low obstacles like curbs.
pub(crate) fn filter_low_hanging_walkable_obstacles(heightfield: &mut SolidHeightfield, walkable_climb: u16) {
    for column in heightfield.columns.iter_mut() {
        let mut previous_walkable = false;
        let mut previous_area = Area::NULL;
        let mut previous_max = 0;

        for span in column.iter_mut() {
            let walkable = span.area != Area::NULL;
            if !walkable && previous_walkable && span.max.abs_diff(previous_max) <= walkable_climb {
                span.area = previous_area;
            }

            previous_walkable = walkable;
            previous_area = span.area;
            previous_max = span.max;
        }
    }
}

/// Marks spans next to drops larger than ``walkable_climb`` as unwalkable. Cells outside the heightfield count as drops.
pub(crate) fn filter_ledge_spans(heightfield: &mut SolidHeightfield, walkable_height: u16, walkable_climb: u16) {
    let width = heightfield.width;
    let height = heightfield.height;
    let max_height = i32::from(SPAN_MAX_HEIGHT);
    let walkable_climb = i32::from(walkable_climb);
    let walkable_height = i32::from(walkable_height);

    let mut unwalkable = Vec::new();
    for z in 0..height {
        for x in 0..width {
            let column = &heightfield.columns[x + z * width];
            for (i, span) in column.iter().enumerate() {
                if span.area == Area::NULL {
                    continue;
                }

                let bottom = i32::from(span.max);
                let top = column.get(i + 1).map_or(max_height, |next| i32::from(next.min));

                let mut min_height = max_height;
                let mut accessible_min = bottom;
                let mut accessible_max = bottom;

                for (dx, dz) in [(-1, 0), (0, 1), (1, 0), (0, -1)] {
                    let nx = x as i32 + dx;
                    let nz = z as i32 + dz;
                    if nx < 0 || nz < 0 || nx >= width as i32 || nz >= height as i32 {
                        min_height = min_height.min(-walkable_climb - bottom);
                        continue;
                    }
                    let neighbour_column = &heightfield.columns[nx as usize + nz as usize * width];

                    // From minus infinity to the first span.
                    let neighbour_bottom = -walkable_climb;
                    let neighbour_top = neighbour_column
                        .first()
                        .map_or(max_height, |first| i32::from(first.min));
                    if top.min(neighbour_top) - bottom.max(neighbour_bottom) > walkable_height {
                        min_height = min_height.min(neighbour_bottom - bottom);
                    }

                    for (j, neighbour) in neighbour_column.iter().enumerate() {
                        let neighbour_bottom = i32::from(neighbour.max);
                        let neighbour_top = neighbour_column
                            .get(j + 1)
                            .map_or(max_height, |next| i32::from(next.min));

                        if top.min(neighbour_top) - bottom.max(neighbour_bottom) > walkable_height {
                            min_height = min_height.min(neighbour_bottom - bottom);

                            if (neighbour_bottom - bottom).abs() <= walkable_climb {
                                accessible_min = accessible_min.min(neighbour_bottom);
                                accessible_max = accessible_max.max(neighbour_bottom);
                            }
                        }
                    }
                }

                if min_height < -walkable_climb || accessible_max - accessible_min > walkable_climb {
                    unwalkable.push((x + z * width, i));
                }
            }
        }
    }

    for (column, span) in unwalkable {
        heightfield.columns[column][span].area = Area::NULL;
    }
}

/// Marks spans without enough clearance above them as unwalkable.
pub(crate) fn filter_walkable_low_height_spans(heightfield: &mut SolidHeightfield, walkable_height: u16) {
    for column in heightfield.columns.iter_mut() {
        for i in 0..column.len() {
            let top = column
                .get(i + 1)
                .map_or(u32::from(SPAN_MAX_HEIGHT), |next| u32::from(next.min));
            if top.saturating_sub(u32::from(column[i].max)) < u32::from(walkable_height) {
                column[i].area = Area::NULL;
            }
        }
    }
}

/// Marks walkable spans outside of every inclusion box as unwalkable.
///
/// ``inclusion_bounds`` are in generation space & already expanded by the agent radius.
pub(crate) fn apply_voxel_filter(heightfield: &mut SolidHeightfield, inclusion_bounds: &[BoundingBox]) {
    let cs = heightfield.cell_size;
    let ch = heightfield.cell_height;
    let bmin = heightfield.bmin;
    let width = heightfield.width;

    for (column_index, column) in heightfield.columns.iter_mut().enumerate() {
        let x = (column_index % width) as f32;
        let z = (column_index / width) as f32;

        for span in column.iter_mut().filter(|span| span.area != Area::NULL) {
            let span_bounds = BoundingBox::new(
                Vec3::new(bmin.x + x * cs, bmin.y + f32::from(span.min) * ch, bmin.z + z * cs),
                Vec3::new(
                    bmin.x + (x + 1.0) * cs,
                    bmin.y + f32::from(span.max) * ch,
                    bmin.z + (z + 1.0) * cs,
                ),
            );

            if !inclusion_bounds.iter().any(|bounds| bounds.intersects(&span_bounds)) {
                span.area = Area::NULL;
            }
        }
    }
}

/// Builds the open (compact) heightfield from the walkable spans of a solid heightfield.
pub(crate) fn build_open_tile(heightfield: &SolidHeightfield, walkable_height: u16, walkable_climb: u16) -> OpenTile {
    let mut open_tile = OpenTile {
        width: heightfield.width,
        height: heightfield.height,
        cells: vec![OpenCell::default(); heightfield.width * heightfield.height],
        ..Default::default()
    };

    // First we create open spaces.
    for (cell, column) in open_tile.cells.iter_mut().zip(heightfield.columns.iter()) {
        for (i, span) in column.iter().enumerate() {
            if span.area == Area::NULL {
                continue;
            }

            cell.spans.push(OpenSpan {
                min: span.max,
                max: column.get(i + 1).map(|next| next.min),
                tile_index: open_tile.span_count,
                ..Default::default()
            });
            open_tile.areas.push(span.area);
            open_tile.span_count += 1;
        }
    }

    link_neighbours(&mut open_tile, walkable_height, walkable_climb);

    open_tile.distances = vec![0; open_tile.span_count];
    open_tile.portals = vec![0; open_tile.span_count];

    open_tile
}

/// Connects spans to spans in neighbouring cells that can be stepped to without hitting our head.
pub(crate) fn link_neighbours(open_tile: &mut OpenTile, walkable_height: u16, walkable_climb: u16) {
    let width = open_tile.width;
    let height = open_tile.height;

    for cell_index in 0..open_tile.cells.len() {
        let row = cell_index / width;
        let column = cell_index % width;

        for span_index in 0..open_tile.cells[cell_index].spans.len() {
            let (span_min, span_max) = {
                let span = &open_tile.cells[cell_index].spans[span_index];
                (span.min, span.max.unwrap_or(u16::MAX))
            };

            let mut neighbours = [None; 4];
            for (dir, neighbour) in neighbours.iter_mut().enumerate() {
                let contained = match dir {
                    0 => column > 0,
                    1 => row + 1 < height,
                    2 => column + 1 < width,
                    _ => row > 0,
                };
                if !contained {
                    continue;
                }

                let other_cell = &open_tile.cells[get_neighbour_index(width, cell_index, dir)];
                *neighbour = other_cell
                    .spans
                    .iter()
                    .position(|other| {
                        let bottom = span_min.max(other.min);
                        let top = span_max.min(other.max.unwrap_or(u16::MAX));

                        top.saturating_sub(bottom) >= walkable_height
                            && other.min.abs_diff(span_min) <= walkable_climb
                    })
                    .map(|index| index as u16);
            }

            open_tile.cells[cell_index].spans[span_index].neighbours = neighbours;
        }
    }
}

/// Computes the distance (in half cells) of every walkable span to the closest boundary.
///
/// ``is_boundary`` decides which neighbouring areas count as a boundary.
fn calculate_boundary_distances(open_tile: &OpenTile, is_boundary: impl Fn(Area, Area) -> bool, max: u16) -> Vec<u16> {
    let mut distances = vec![max; open_tile.span_count];

    // Mark boundary cells.
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let area = open_tile.areas[span.tile_index];
            if area == Area::NULL {
                distances[span.tile_index] = 0;
                continue;
            }

            let connected = (0..4)
                .filter(|dir| {
                    open_tile
                        .neighbour(cell_index, span, *dir)
                        .is_some_and(|(_, other)| !is_boundary(area, open_tile.areas[other.tile_index]))
                })
                .count();

            if connected != 4 {
                distances[span.tile_index] = 0;
            }
        }
    }

    let width = open_tile.width;
    let height = open_tile.height;

    // Pass 1: (-1, 0) & (0, -1)
    for z in 0..height {
        for x in 0..width {
            let cell_index = x + z * width;
            for span in open_tile.cells[cell_index].spans.iter() {
                let mut distance = distances[span.tile_index];

                for (dir, diagonal_dir) in [(0, 3), (3, 2)] {
                    let Some((other_cell, other)) = open_tile.neighbour(cell_index, span, dir) else {
                        continue;
                    };
                    distance = distance.min(distances[other.tile_index].saturating_add(2));

                    if let Some((_, diagonal)) = open_tile.neighbour(other_cell, other, diagonal_dir) {
                        distance = distance.min(distances[diagonal.tile_index].saturating_add(3));
                    }
                }

                distances[span.tile_index] = distance;
            }
        }
    }

    // Pass 2: (1, 0) & (0, 1)
    for z in (0..height).rev() {
        for x in (0..width).rev() {
            let cell_index = x + z * width;
            for span in open_tile.cells[cell_index].spans.iter() {
                let mut distance = distances[span.tile_index];

                for (dir, diagonal_dir) in [(2, 1), (1, 0)] {
                    let Some((other_cell, other)) = open_tile.neighbour(cell_index, span, dir) else {
                        continue;
                    };
                    distance = distance.min(distances[other.tile_index].saturating_add(2));

                    if let Some((_, diagonal)) = open_tile.neighbour(other_cell, other, diagonal_dir) {
                        distance = distance.min(distances[diagonal.tile_index].saturating_add(3));
                    }
                }

                distances[span.tile_index] = distance.min(max);
            }
        }
    }

    distances
}

/// Removes walkable area that is within ``walkable_radius`` of an edge.
pub(crate) fn erode_walkable_area(open_tile: &mut OpenTile, walkable_radius: u16) {
    let distances = calculate_boundary_distances(
        open_tile,
        |_, other| other == Area::NULL,
        u16::from(u8::MAX),
    );

    let threshold = walkable_radius * 2;
    for (area, distance) in open_tile.areas.iter_mut().zip(distances) {
        if distance < threshold {
            *area = Area::NULL;
        }
    }
}

/// Marks walkable spans with less than ``height_threshold`` of clearance as ``low_area``.
pub(crate) fn mark_low_areas(open_tile: &mut OpenTile, height_threshold: u16, low_area: Area) {
    for cell in open_tile.cells.iter() {
        for span in cell.spans.iter() {
            let area = &mut open_tile.areas[span.tile_index];
            if *area == Area::NULL {
                continue;
            }

            let clearance = span.max.map_or(u16::MAX, |max| max.saturating_sub(span.min));
            if clearance < height_threshold {
                *area = low_area;
            }
        }
    }
}

/// Marks low areas, then erodes treating them as walkable.
///
/// The low areas are removed later on so erosion next to them doesn't eat into walkable ground.
pub(crate) fn erode_walkable_and_low_areas(
    open_tile: &mut OpenTile,
    walkable_radius: u16,
    height_threshold: u16,
    low_area: Area,
) {
    mark_low_areas(open_tile, height_threshold, low_area);
    erode_walkable_area(open_tile, walkable_radius);
}

/// Replaces ``from`` with ``to`` for every span inside a generation space box.
pub(crate) fn replace_box_area(
    open_tile: &mut OpenTile,
    heightfield_min: Vec3,
    cell_size: f32,
    cell_height: f32,
    bounds: &BoundingBox,
    from: Area,
    to: Area,
) {
    let min_x = ((bounds.min.x - heightfield_min.x) / cell_size).floor().max(0.0) as usize;
    let min_z = ((bounds.min.z - heightfield_min.z) / cell_size).floor().max(0.0) as usize;
    let max_x = (((bounds.max.x - heightfield_min.x) / cell_size).ceil().max(0.0) as usize).min(open_tile.width);
    let max_z = (((bounds.max.z - heightfield_min.z) / cell_size).ceil().max(0.0) as usize).min(open_tile.height);
    let min_y = (bounds.min.y - heightfield_min.y) / cell_height;
    let max_y = (bounds.max.y - heightfield_min.y) / cell_height;

    for z in min_z..max_z {
        for x in min_x..max_x {
            for span in open_tile.cells[x + z * open_tile.width].spans.iter() {
                let y = f32::from(span.min);
                if y < min_y || y > max_y {
                    continue;
                }

                let area = &mut open_tile.areas[span.tile_index];
                if *area == from {
                    *area = to;
                }
            }
        }
    }
}

/// Calculates the distance field used by watershed partitioning.
pub(crate) fn calculate_distance_field(open_tile: &mut OpenTile) {
    let distances = calculate_boundary_distances(open_tile, |area, other| area != other, u16::MAX);

    open_tile.max_distance = distances.iter().copied().max().unwrap_or(0);

    // Box blur.
    let threshold = 2;
    let mut blurred = distances.clone();
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let distance = distances[span.tile_index];
            if distance <= threshold {
                continue;
            }

            let mut total = u32::from(distance);
            for dir in 0..4 {
                let Some((other_cell, other)) = open_tile.neighbour(cell_index, span, dir) else {
                    total += u32::from(distance) * 2;
                    continue;
                };
                total += u32::from(distances[other.tile_index]);

                let next_dir = (dir + 1) & 0x3;
                total += open_tile
                    .neighbour(other_cell, other, next_dir)
                    .map_or(u32::from(distance), |(_, diagonal)| u32::from(distances[diagonal.tile_index]));
            }

            blurred[span.tile_index] = ((total + 5) / 9) as u16;
        }
    }

    open_tile.distances = blurred;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_field(size: usize) -> SolidHeightfield {
        let mut heightfield = SolidHeightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 10.0, size as f32),
            1.0,
            0.5,
        );
        for z in 0..size {
            for x in 0..size {
                heightfield.add_span(x, z, 0, 2, Area::WALKABLE, 1);
            }
        }

        heightfield
    }

    #[test]
    fn overlapping_spans_merge() {
        let mut heightfield = SolidHeightfield::new(1, 1, Vec3::ZERO, Vec3::ONE * 10.0, 1.0, 1.0);
        heightfield.add_span(0, 0, 0, 2, Area::NULL, 1);
        heightfield.add_span(0, 0, 5, 6, Area::WALKABLE, 1);
        heightfield.add_span(0, 0, 1, 3, Area::WALKABLE, 1);

        let column = &heightfield.columns[0];
        assert_eq!(column.len(), 2);
        assert_eq!(
            column[0],
            HeightSpan {
                min: 0,
                max: 3,
                area: Area::WALKABLE
            }
        );
        assert_eq!(column[1].min, 5);
    }

    #[test]
    fn divide_polygon_splits_triangle() {
        let triangle = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
        ];
        let (left, right) = divide_polygon(&triangle, 1.0, 0);

        assert!(left.iter().all(|vertex| vertex.x <= 1.0));
        assert!(right.iter().all(|vertex| vertex.x >= 1.0));
        assert_eq!(left.len(), 4);
        assert_eq!(right.len(), 3);
    }

    #[test]
    fn rasterized_quad_covers_cells() {
        let mut heightfield = SolidHeightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 0.5);
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(4.0, 1.0, 0.0);
        let c = Vec3::new(4.0, 1.0, 4.0);
        let d = Vec3::new(0.0, 1.0, 4.0);
        rasterize_triangle(&mut heightfield, &[a, d, c], Area::WALKABLE, 1);
        rasterize_triangle(&mut heightfield, &[a, c, b], Area::WALKABLE, 1);

        assert_eq!(heightfield.span_count(), 16);
        assert!(heightfield
            .columns
            .iter()
            .all(|column| column[0].min == 2 && column[0].max == 3));

        // Upwards facing.
        assert!(is_walkable_triangle(&[a, d, c], 0.5));
        assert!(!is_walkable_triangle(&[a, c, d], 0.5));
    }

    #[test]
    fn ledges_at_the_edge_are_removed() {
        let mut heightfield = flat_field(5);
        filter_ledge_spans(&mut heightfield, 2, 1);

        for z in 0..5 {
            for x in 0..5 {
                let edge = x == 0 || z == 0 || x == 4 || z == 4;
                let area = heightfield.columns[x + z * 5][0].area;
                assert_eq!(area == Area::NULL, edge, "cell {x},{z}");
            }
        }
    }

    #[test]
    fn low_hanging_obstacles_become_walkable() {
        let mut heightfield = SolidHeightfield::new(1, 1, Vec3::ZERO, Vec3::ONE * 10.0, 1.0, 1.0);
        heightfield.add_span(0, 0, 0, 2, Area::WALKABLE, 0);
        heightfield.add_span(0, 0, 3, 4, Area::NULL, 0);
        filter_low_hanging_walkable_obstacles(&mut heightfield, 2);

        assert_eq!(heightfield.columns[0][1].area, Area::WALKABLE);
    }

    #[test]
    fn low_clearance_spans_are_filtered() {
        let mut heightfield = SolidHeightfield::new(1, 1, Vec3::ZERO, Vec3::ONE * 10.0, 1.0, 1.0);
        heightfield.add_span(0, 0, 0, 2, Area::WALKABLE, 0);
        heightfield.add_span(0, 0, 4, 5, Area::WALKABLE, 0);
        filter_walkable_low_height_spans(&mut heightfield, 3);

        assert_eq!(heightfield.columns[0][0].area, Area::NULL);
        assert_eq!(heightfield.columns[0][1].area, Area::WALKABLE);
    }

    #[test]
    fn voxel_filter_keeps_included_spans() {
        let mut heightfield = flat_field(4);
        let inclusion = BoundingBox::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.5, 5.0, 4.0));
        apply_voxel_filter(&mut heightfield, &[inclusion]);

        for (index, column) in heightfield.columns.iter().enumerate() {
            assert_eq!(column[0].area == Area::WALKABLE, index % 4 < 2, "column {index}");
        }
    }

    #[test]
    fn erosion_shrinks_walkable_area() {
        let heightfield = flat_field(9);
        let mut open_tile = build_open_tile(&heightfield, 2, 1);
        assert_eq!(open_tile.span_count, 81);

        erode_walkable_area(&mut open_tile, 2);

        let walkable = open_tile.areas.iter().filter(|area| **area != Area::NULL).count();
        // Only the inner 5x5 cells are at least two cells away from the edge.
        assert_eq!(walkable, 25);
    }

    #[test]
    fn replace_box_area_only_touches_matching_area() {
        let heightfield = flat_field(4);
        let mut open_tile = build_open_tile(&heightfield, 2, 1);
        open_tile.areas[0] = Area::LOW_HEIGHT;
        open_tile.areas[5] = Area::LOW_HEIGHT;

        let bounds = BoundingBox::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 5.0, 1.0));
        replace_box_area(&mut open_tile, Vec3::ZERO, 1.0, 0.5, &bounds, Area::LOW_HEIGHT, Area::NULL);

        assert_eq!(open_tile.areas[0], Area::NULL);
        assert_eq!(open_tile.areas[5], Area::LOW_HEIGHT);
        assert_eq!(open_tile.areas[1], Area::WALKABLE);
    }

    #[test]
    fn distance_field_peaks_in_the_middle() {
        let heightfield = flat_field(9);
        let mut open_tile = build_open_tile(&heightfield, 2, 1);
        calculate_distance_field(&mut open_tile);

        let center = open_tile.cells[4 + 4 * 9].spans[0].tile_index;
        let corner = open_tile.cells[0].spans[0].tile_index;
        assert!(open_tile.distances[center] > open_tile.distances[corner]);
        assert!(open_tile.max_distance >= open_tile.distances[center]);
    }
}
