//! Partitions an [OpenTile] into regions: connected areas that can be turned into simple contours.
//!
//! Three methods are available:
//! - Watershed: floods a distance field from its peaks. Produces the nicest regions.
//! - Monotone: sweeps rows merging spans with the row before them. Fast, no distance field required.
//! - Chunky: monotone sweeps restricted to fixed size chunks so regions stay small.

use crate::{
    error::TileGenerationError,
    heightfields::{calculate_distance_field, OpenSpan, OpenTile},
    settings::PartitioningMethod,
    Area,
};

/// Region thresholds in cells.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RegionSettings {
    /// Connected groups of regions with fewer spans than this are removed.
    pub min_region_area: u32,
    /// Regions with fewer spans than this get merged into their neighbours if possible.
    pub merge_region_area: u32,
}

#[derive(Default, Clone, Copy)]
struct LevelStackEntry {
    cell_index: u32,
    span_index: u32,
    index: i32,
}

const EXPAND_ITERS: u16 = 8;
const LOG_NB_STACKS: i32 = 3;
const NB_STACKS: i32 = 1 << LOG_NB_STACKS; // 8.

/// Largest usable region id.
const MAX_REGION_ID: u16 = u16::MAX - 1;

pub(crate) fn build_regions(
    open_tile: &mut OpenTile,
    method: PartitioningMethod,
    chunk_size: u16,
    settings: RegionSettings,
) -> Result<(), TileGenerationError> {
    let mut regions = match method {
        PartitioningMethod::Watershed => {
            calculate_distance_field(open_tile);
            watershed_regions(open_tile)?
        }
        PartitioningMethod::Monotone => sweep_regions(open_tile, None)?,
        PartitioningMethod::Chunky => sweep_regions(open_tile, Some(usize::from(chunk_size.max(1))))?,
    };

    // Merge regions and filter out small ones.
    let mut region_count = regions.iter().copied().max().map_or(1, |max| max + 1);
    merge_regions(settings, &mut regions, &mut region_count, open_tile);

    // Write results into spans.
    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.region = regions[span.tile_index];
        }
    }

    open_tile.max_regions = region_count;

    Ok(())
}

fn watershed_regions(open_tile: &OpenTile) -> Result<Vec<u16>, TileGenerationError> {
    let mut regions = vec![0; open_tile.span_count];
    let mut distances = vec![0; open_tile.span_count];
    let mut dirty_entries = Vec::with_capacity(512);

    let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS as usize] = Default::default();
    for stack in level_stacks.iter_mut() {
        stack.reserve(256);
    }
    let mut stack = Vec::with_capacity(256);

    let mut region_id = 1;
    let mut level = (open_tile.max_distance.saturating_add(1)) & !1u16; // Rounded.

    let mut stack_id = -1;
    while level > 0 {
        level = level.saturating_sub(2);
        stack_id = (stack_id + 1) & (NB_STACKS - 1);

        if stack_id == 0 {
            // Sort cells by level.
            sort_cells_by_level(level, open_tile, &mut level_stacks, &regions);
        } else {
            // append stacks
            let prev_stack = (stack_id - 1) as usize;
            let next_stack = stack_id as usize;
            for i in 0..level_stacks[prev_stack].len() {
                let index = level_stacks[prev_stack][i].index;
                if index < 0 || regions[index as usize] != 0 {
                    continue;
                }

                level_stacks[next_stack].push(level_stacks[prev_stack][i]);
            }
        }

        expand_regions(
            Some(EXPAND_ITERS),
            open_tile,
            &mut regions,
            &mut distances,
            &mut level_stacks[stack_id as usize],
            &mut dirty_entries,
        );

        // Mark new regions with IDs.
        for entry in level_stacks[stack_id as usize].iter() {
            if entry.index >= 0
                && regions[entry.index as usize] == 0
                && flood_region(*entry, level, region_id, open_tile, &mut regions, &mut distances, &mut stack)
            {
                if region_id == MAX_REGION_ID {
                    return Err(TileGenerationError::TooManyRegions);
                }
                region_id += 1;
            }
        }
    }

    // Expand regions until no empty connected cells are found.
    stack.clear();
    for (c_i, cell) in open_tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if regions[span.tile_index] == 0 && open_tile.areas[span.tile_index] != Area::NULL {
                stack.push(LevelStackEntry {
                    cell_index: c_i as u32,
                    span_index: s_i as u32,
                    index: span.tile_index as i32,
                });
            }
        }
    }
    expand_regions(None, open_tile, &mut regions, &mut distances, &mut stack, &mut dirty_entries);

    Ok(regions)
}

#[derive(Default, Clone, Copy)]
struct SweepSpan {
    /// Region id given to the sweep after the row is done.
    id: u16,
    /// Number of spans connecting the sweep to ``neighbour``.
    samples: u16,
    /// Region in the previous row. ``None`` when the sweep touches more than one.
    neighbour: Option<u16>,
}

/// Monotone partitioning. Runs of spans along X are joined with the region below them when that region only touches this run.
///
/// With ``chunk_size`` set, connections crossing a chunk's edge are ignored.
fn sweep_regions(open_tile: &OpenTile, chunk_size: Option<usize>) -> Result<Vec<u16>, TileGenerationError> {
    let mut regions = vec![0u16; open_tile.span_count];
    let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(open_tile.width);
    let mut previous_count: Vec<u16> = Vec::with_capacity(256);

    let mut region_id: u16 = 1;
    for z in 0..open_tile.height {
        previous_count.clear();
        previous_count.resize(usize::from(region_id) + 1, 0);
        sweeps.clear();
        sweeps.push(SweepSpan::default()); // Sweep ids start at 1.

        let crosses_chunk_z = chunk_size.is_some_and(|size| z % size == 0);

        for x in 0..open_tile.width {
            let cell_index = x + z * open_tile.width;
            let crosses_chunk_x = chunk_size.is_some_and(|size| x % size == 0);

            for span in open_tile.cells[cell_index].spans.iter() {
                let area = open_tile.areas[span.tile_index];
                if area == Area::NULL {
                    continue;
                }

                // -X
                let mut sweep_id = open_tile
                    .neighbour(cell_index, span, 0)
                    .filter(|(_, other)| !crosses_chunk_x && open_tile.areas[other.tile_index] == area)
                    .map_or(0, |(_, other)| regions[other.tile_index]);

                if sweep_id == 0 {
                    if sweeps.len() > usize::from(MAX_REGION_ID) {
                        return Err(TileGenerationError::TooManyRegions);
                    }
                    sweep_id = sweeps.len() as u16;
                    sweeps.push(SweepSpan {
                        id: 0,
                        samples: 0,
                        neighbour: Some(0),
                    });
                }

                // -Z
                if let Some((_, other)) = open_tile
                    .neighbour(cell_index, span, 3)
                    .filter(|(_, other)| !crosses_chunk_z && open_tile.areas[other.tile_index] == area)
                {
                    let other_region = regions[other.tile_index];
                    let sweep = &mut sweeps[usize::from(sweep_id)];
                    if other_region != 0 {
                        match sweep.neighbour {
                            Some(neighbour) if neighbour == 0 || neighbour == other_region => {
                                sweep.neighbour = Some(other_region);
                                sweep.samples += 1;
                                previous_count[usize::from(other_region)] += 1;
                            }
                            _ => sweep.neighbour = None,
                        }
                    }
                }

                regions[span.tile_index] = sweep_id;
            }
        }

        // Create unique IDs.
        for sweep in sweeps.iter_mut().skip(1) {
            match sweep.neighbour {
                Some(neighbour)
                    if neighbour != 0 && previous_count[usize::from(neighbour)] == sweep.samples =>
                {
                    sweep.id = neighbour;
                }
                _ => {
                    if region_id == MAX_REGION_ID {
                        return Err(TileGenerationError::TooManyRegions);
                    }
                    sweep.id = region_id;
                    region_id += 1;
                }
            }
        }

        // Remap the row from sweep ids to region ids.
        for cell in open_tile.cells[z * open_tile.width..(z + 1) * open_tile.width].iter() {
            for span in cell.spans.iter() {
                let sweep_id = regions[span.tile_index];
                if sweep_id > 0 && usize::from(sweep_id) < sweeps.len() {
                    regions[span.tile_index] = sweeps[usize::from(sweep_id)].id;
                }
            }
        }
    }

    Ok(regions)
}

fn sort_cells_by_level(start_level: u16, open_tile: &OpenTile, stacks: &mut [Vec<LevelStackEntry>], regions: &[u16]) {
    let start_level = (start_level >> 1) as i32;

    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for (c_i, cell) in open_tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if open_tile.areas[span.tile_index] == Area::NULL || regions[span.tile_index] != 0 {
                continue;
            }

            let level = (open_tile.distances[span.tile_index] >> 1) as i32;
            let stack_id = (start_level - level).max(0);
            if stack_id >= NB_STACKS {
                continue;
            }

            stacks[stack_id as usize].push(LevelStackEntry {
                cell_index: c_i as u32,
                span_index: s_i as u32,
                index: span.tile_index as i32,
            });
        }
    }
}

struct DirtyEntry {
    index: usize,
    region: u16,
    distance: u16,
}

/// Grows existing regions into the unassigned spans of ``level_stack``.
///
/// Runs until nothing changes or ``max_iterations`` is reached.
fn expand_regions(
    max_iterations: Option<u16>,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    level_stack: &mut [LevelStackEntry],
    dirty_entries: &mut Vec<DirtyEntry>,
) {
    for entry in level_stack
        .iter_mut()
        .filter(|entry| entry.index >= 0 && regions[entry.index as usize] != 0)
    {
        entry.index = -1;
    }

    let mut iter = 0;
    loop {
        let mut failed = 0;
        dirty_entries.clear();

        for entry in level_stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }

            let mut new_region = regions[entry.index as usize];
            let mut distance = u16::MAX;
            let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
            let area = tile.areas[span.tile_index];

            for dir in 0..4 {
                let Some((_, other_span)) = tile.neighbour(entry.cell_index as usize, span, dir) else {
                    continue;
                };
                if tile.areas[other_span.tile_index] != area {
                    continue;
                }

                let other_region = regions[other_span.tile_index];
                let other_distance = distances[other_span.tile_index].saturating_add(2);
                if other_region > 0 && other_distance < distance {
                    new_region = other_region;
                    distance = other_distance;
                }
            }

            if new_region != 0 {
                entry.index = -1;
                dirty_entries.push(DirtyEntry {
                    index: span.tile_index,
                    region: new_region,
                    distance,
                });
            } else {
                failed += 1;
            }
        }

        // Copy entries that differ to keep them in sync.
        for entry in dirty_entries.iter() {
            regions[entry.index] = entry.region;
            distances[entry.index] = entry.distance;
        }

        if failed == level_stack.len() {
            break;
        }

        iter += 1;
        if max_iterations.is_some_and(|max| iter >= max) {
            break;
        }
    }
}

fn flood_region(
    entry: LevelStackEntry,
    level: u16,
    region_id: u16,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    stack.clear();
    stack.push(entry);

    let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
    let area = tile.areas[span.tile_index];

    regions[entry.index as usize] = region_id;
    distances[entry.index as usize] = 0;

    let lev = level.saturating_sub(2);
    let mut expanded_any = false;

    while let Some(entry) = stack.pop() {
        let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];

        // Stop at spans touching another region, including diagonally.
        let has_adjacent_region = (0..4).any(|dir| {
            let Some((other_cell_index, other_span)) = tile.neighbour(entry.cell_index as usize, span, dir) else {
                return false;
            };
            if tile.areas[other_span.tile_index] != area {
                return false;
            }

            let other_region = regions[other_span.tile_index];
            if other_region != 0 && other_region != region_id {
                return true;
            }

            tile.neighbour(other_cell_index, other_span, (dir + 1) & 0x3)
                .is_some_and(|(_, diagonal)| {
                    let diagonal_region = regions[diagonal.tile_index];
                    tile.areas[diagonal.tile_index] == area
                        && diagonal_region != 0
                        && diagonal_region != region_id
                })
        });

        if has_adjacent_region {
            regions[entry.index as usize] = 0;
            continue;
        }

        expanded_any = true;

        // Expand neighbours.
        for dir in 0..4 {
            let Some(span_index) = span.neighbours[dir] else {
                continue;
            };
            let Some((other_cell_index, other_span)) = tile.neighbour(entry.cell_index as usize, span, dir) else {
                continue;
            };
            if tile.areas[other_span.tile_index] != area {
                continue;
            }

            if tile.distances[other_span.tile_index] >= lev && regions[other_span.tile_index] == 0 {
                regions[other_span.tile_index] = region_id;
                distances[other_span.tile_index] = 0;
                stack.push(LevelStackEntry {
                    cell_index: other_cell_index as u32,
                    span_index: span_index.into(),
                    index: other_span.tile_index as i32,
                })
            }
        }
    }

    expanded_any
}

struct Region {
    id: u16,
    span_count: usize,
    remap: bool,
    visited: bool,
    overlap: bool,
    floors: Vec<u16>,
    connections: Vec<u16>,
    area: Area,
}

fn merge_regions(settings: RegionSettings, source_regions: &mut [u16], max_region_id: &mut u16, tile: &OpenTile) {
    let mut regions: Vec<Region> = (0..*max_region_id)
        .map(|id| Region {
            id,
            span_count: 0,
            remap: false,
            visited: false,
            overlap: false,
            floors: Vec::with_capacity(4),
            connections: Vec::with_capacity(4),
            area: Area::NULL,
        })
        .collect();

    for (c_i, cell) in tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            let region_id = source_regions[span.tile_index];
            if region_id == 0 || region_id >= *max_region_id {
                continue;
            }

            let region = &mut regions[region_id as usize];
            region.span_count += 1;

            // Update floors
            for other_span in cell.spans.iter().filter(|other| other.tile_index != span.tile_index) {
                let other_region_id = source_regions[other_span.tile_index];
                if other_region_id == 0 || other_region_id >= *max_region_id {
                    continue;
                }
                region.overlap |= other_region_id == region_id;

                if !region.floors.contains(&other_region_id) {
                    region.floors.push(other_region_id);
                }
            }

            // Contour already exists.
            if !region.connections.is_empty() {
                continue;
            }

            region.area = tile.areas[span.tile_index];

            if let Some(dir) = (0..4).find(|dir| is_solid_edge(tile, span, c_i, *dir, source_regions)) {
                walk_contour(c_i, s_i, dir, tile, source_regions, &mut region.connections);
            }
        }
    }

    // Remove too small regions
    let mut stack = Vec::with_capacity(32);
    let mut trace = Vec::with_capacity(32);
    let mut connections: Vec<u16> = Vec::with_capacity(16);

    for i in 0..*max_region_id {
        {
            let region = &mut regions[i as usize];
            if region.id == 0 || region.span_count == 0 || region.visited {
                continue;
            }

            region.visited = true;
        }

        stack.clear();
        trace.clear();

        stack.push(i);

        let mut span_count = 0;

        while let Some(r_i) = stack.pop() {
            connections.clear();
            trace.push(r_i);

            {
                let region = &regions[r_i as usize];
                connections.extend(region.connections.iter());
                span_count += region.span_count;
            }

            for connected_region in &connections {
                let connected_region = &mut regions[*connected_region as usize];

                if connected_region.visited || connected_region.id == 0 {
                    continue;
                }

                stack.push(connected_region.id);
                connected_region.visited = true;
            }
        }

        if span_count < settings.min_region_area as usize {
            for trace in &trace {
                let region = &mut regions[*trace as usize];
                region.span_count = 0;
                region.id = 0;
            }
        }
    }

    // Merge regions into neighbour.
    loop {
        let mut merged = false;

        for region in 0..regions.len() {
            let merge_id = {
                let region = &regions[region];
                if region.id == 0 || region.overlap || region.span_count == 0 {
                    continue;
                }

                if region.span_count > settings.merge_region_area as usize && region.connections.contains(&0) {
                    continue;
                }

                let mut merge_id = None;
                let mut smallest_region_size = usize::MAX;

                for connected in &region.connections {
                    let other_region = &regions[*connected as usize];
                    if other_region.id == 0 || other_region.overlap {
                        continue;
                    }

                    if other_region.span_count < smallest_region_size
                        && can_merge_with_region(region, other_region)
                        && can_merge_with_region(other_region, region)
                    {
                        smallest_region_size = other_region.span_count;
                        merge_id = Some(other_region.id);
                    }
                }

                merge_id
            };

            if let Some(merge_id) = merge_id {
                let old_id = regions[region].id;

                if merge_region_into(&mut regions, merge_id as usize, region) {
                    // Fix up regions pointing to this region.
                    for region in regions.iter_mut() {
                        if region.id == 0 {
                            continue;
                        }

                        if region.id == old_id {
                            region.id = merge_id;
                        }

                        replace_neighbour(region, old_id, merge_id);
                    }

                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }

    // Compress region ids.
    for region in regions.iter_mut() {
        region.remap = region.id != 0;
    }

    let mut region_id_gen = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        region_id_gen += 1;

        let old_id = regions[i].id;
        let new_id = region_id_gen;

        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = new_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = region_id_gen + 1;

    // Remap regions.
    for region in source_regions.iter_mut() {
        *region = regions[*region as usize].id;
    }
}

fn replace_neighbour(region: &mut Region, old_id: u16, new_id: u16) {
    let mut connection_changed = false;
    for connection in region.connections.iter_mut() {
        if *connection == old_id {
            *connection = new_id;
            connection_changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if connection_changed {
        remove_adjacent_duplicates(&mut region.connections);
    }
}

/// Merges region ``source`` into ``target``. Both must share a connection.
fn merge_region_into(regions: &mut [Region], target: usize, source: usize) -> bool {
    let merged_connections = {
        let a = &regions[target];
        let b = &regions[source];

        let Some(insert_point_a) = a.connections.iter().position(|i| *i == b.id) else {
            return false;
        };
        let Some(insert_point_b) = b.connections.iter().position(|i| *i == a.id) else {
            return false;
        };

        let mut merged_connections = Vec::with_capacity(a.connections.len() + b.connections.len() - 2);
        for i in 0..a.connections.len() - 1 {
            merged_connections.push(a.connections[(insert_point_a + 1 + i) % a.connections.len()]);
        }
        for i in 0..b.connections.len() - 1 {
            merged_connections.push(b.connections[(insert_point_b + 1 + i) % b.connections.len()]);
        }

        merged_connections
    };

    let (source_span_count, floors) = {
        let source = &mut regions[source];
        source.connections.clear();

        let count = source.span_count;
        source.span_count = 0;

        (count, std::mem::take(&mut source.floors))
    };

    let target = &mut regions[target];
    target.span_count += source_span_count;
    target.connections = merged_connections;

    remove_adjacent_duplicates(&mut target.connections);

    for floor in floors {
        if !target.floors.contains(&floor) {
            target.floors.push(floor);
        }
    }

    true
}

fn remove_adjacent_duplicates(values: &mut Vec<u16>) {
    if values.len() > 1 {
        let mut i = 0;
        while i < values.len() {
            let next_index = (i + 1) % values.len();

            if values.len() > 1 && values[i] == values[next_index] {
                values.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn can_merge_with_region(a: &Region, b: &Region) -> bool {
    if a.area != b.area {
        return false;
    }

    let shared_edges = a.connections.iter().filter(|region| **region == b.id).count();
    if shared_edges > 1 {
        return false;
    }

    !a.floors.contains(&b.id)
}

/// Walks the outline of a region collecting the regions on the other side.
fn walk_contour(
    mut cell_index: usize,
    mut span_index: usize,
    mut dir: usize,
    tile: &OpenTile,
    source_regions: &[u16],
    contour: &mut Vec<u16>,
) {
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;

    let neighbour_region = |cell_index: usize, span: &OpenSpan, dir: usize| {
        tile.neighbour(cell_index, span, dir)
            .map_or(0, |(_, other)| source_regions[other.tile_index])
    };

    let mut current_region = neighbour_region(cell_index, &tile.cells[cell_index].spans[span_index], dir);
    contour.push(current_region);

    loop {
        let span = &tile.cells[cell_index].spans[span_index];
        if is_solid_edge(tile, span, cell_index, dir, source_regions) {
            let region = neighbour_region(cell_index, span, dir);
            if region != current_region {
                current_region = region;
                contour.push(region);
            }

            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            let Some((other_cell, _)) = tile.neighbour(cell_index, span, dir) else {
                return;
            };
            let Some(index) = span.neighbours[dir] else {
                return;
            };

            span_index = index.into();
            cell_index = other_cell;
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            break;
        }
    }

    remove_adjacent_duplicates(contour);
}

fn is_solid_edge(tile: &OpenTile, span: &OpenSpan, c_i: usize, dir: usize, source_regions: &[u16]) -> bool {
    let region = tile
        .neighbour(c_i, span, dir)
        .map_or(0, |(_, other)| source_regions[other.tile_index]);

    region != source_regions[span.tile_index]
}

#[cfg(test)]
mod tests {
    use bevy::math::Vec3;

    use super::*;
    use crate::heightfields::{build_open_tile, SolidHeightfield};

    /// Two flat floors split by an unwalkable strip along X = ``gap``.
    fn split_tile(size: usize, gap: usize) -> OpenTile {
        let mut heightfield =
            SolidHeightfield::new(size, size, Vec3::ZERO, Vec3::new(size as f32, 10.0, size as f32), 1.0, 0.5);
        for z in 0..size {
            for x in 0..size {
                let area = if x == gap { Area::NULL } else { Area::WALKABLE };
                heightfield.add_span(x, z, 0, 2, area, 0);
            }
        }

        build_open_tile(&heightfield, 2, 1)
    }

    fn distinct_regions(open_tile: &OpenTile) -> Vec<u16> {
        let mut ids: Vec<u16> = open_tile
            .cells
            .iter()
            .flat_map(|cell| cell.spans.iter().map(|span| span.region))
            .filter(|region| *region != 0)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        ids
    }

    #[test]
    fn every_method_separates_disconnected_floors() {
        for method in [
            PartitioningMethod::Monotone,
            PartitioningMethod::Watershed,
            PartitioningMethod::Chunky,
        ] {
            let mut open_tile = split_tile(12, 5);
            build_regions(&mut open_tile, method, 4, RegionSettings::default()).expect("regions");

            let left = open_tile.cells[0].spans[0].region;
            let right = open_tile.cells[11].spans[0].region;
            assert_ne!(left, 0, "{method:?}");
            assert_ne!(right, 0, "{method:?}");
            assert_ne!(left, right, "{method:?}");
            assert!(open_tile.max_regions as usize > distinct_regions(&open_tile).len(), "{method:?}");
        }
    }

    #[test]
    fn monotone_single_floor_is_one_region() {
        let mut open_tile = split_tile(8, usize::MAX);
        build_regions(&mut open_tile, PartitioningMethod::Monotone, 8, RegionSettings::default())
            .expect("regions");

        assert_eq!(distinct_regions(&open_tile), vec![1]);
        assert_eq!(open_tile.max_regions, 2);
    }

    #[test]
    fn small_regions_are_removed() {
        let mut open_tile = split_tile(8, 1);
        let settings = RegionSettings {
            min_region_area: 9,
            merge_region_area: 0,
        };
        build_regions(&mut open_tile, PartitioningMethod::Monotone, 8, settings).expect("regions");

        // The single column strip left of the gap only has 8 spans.
        assert_eq!(open_tile.cells[0].spans[0].region, 0);
        assert_ne!(open_tile.cells[7].spans[0].region, 0);
    }
}
