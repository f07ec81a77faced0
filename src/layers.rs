//! Groups the regions of a padded [OpenTile] into height layers.
//!
//! A layer never holds two spans in the same column, so each layer is a 2.5D grid: one height, area & connection mask per cell.

use bevy::math::{IVec2, Vec3};

use crate::{
    coords::BoundingBox,
    error::TileGenerationError,
    heightfields::{OpenCell, OpenSpan, OpenTile},
    Area,
};

/// Maximum number of layers a single tile may have.
pub const MAX_LAYERS: usize = 63;
/// Marks a cell without a span in a layer's height grid.
pub(crate) const EMPTY_HEIGHT: u8 = 0xff;
const MAX_LAYER_HEIGHT: u16 = 255;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LayerHeader {
    pub tile: IVec2,
    pub layer: u8,
    /// Generation space bounds of the layer grid.
    pub bmin: Vec3,
    pub bmax: Vec3,
    /// Height range in cells relative to the heightfield.
    pub hmin: u16,
    pub hmax: u16,
    pub width: u16,
    pub height: u16,
    /// Cells that actually hold data.
    pub min_x: u16,
    pub max_x: u16,
    pub min_y: u16,
    pub max_y: u16,
}

/// Uncompressed layer.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct HeightfieldLayer {
    pub header: LayerHeader,
    /// Height above ``hmin`` per cell, [EMPTY_HEIGHT] when there is no span.
    pub heights: Vec<u8>,
    pub areas: Vec<Area>,
    /// Low four bits: neighbour in direction is connected. High four bits: neighbour is a portal to another layer.
    pub cons: Vec<u8>,
}

impl HeightfieldLayer {
    /// World space bounds, padded vertically by ``agent_max_climb``.
    pub fn world_bounds(&self, agent_max_climb: f32) -> BoundingBox {
        let padding = Vec3::new(0.0, agent_max_climb, 0.0);

        BoundingBox::new(self.header.bmin - padding, self.header.bmax + padding).to_world()
    }

    /// Rebuilds a compact heightfield holding one span per occupied cell.
    pub fn to_open_tile(&self) -> OpenTile {
        let width = usize::from(self.header.width);
        let height = usize::from(self.header.height);

        let mut open_tile = OpenTile {
            width,
            height,
            cells: vec![OpenCell::default(); width * height],
            ..Default::default()
        };

        for (index, cell) in open_tile.cells.iter_mut().enumerate() {
            let span_height = self.heights[index];
            if span_height == EMPTY_HEIGHT {
                continue;
            }

            cell.spans.push(OpenSpan {
                min: u16::from(span_height),
                max: None,
                tile_index: open_tile.span_count,
                ..Default::default()
            });
            open_tile.areas.push(self.areas[index]);
            open_tile.portals.push(self.cons[index] >> 4);
            open_tile.span_count += 1;
        }

        for index in 0..open_tile.cells.len() {
            if open_tile.cells[index].spans.is_empty() {
                continue;
            }

            let cons = self.cons[index];
            let mut neighbours = [None; 4];
            for (dir, neighbour) in neighbours.iter_mut().enumerate() {
                if cons & (1 << dir) != 0 {
                    *neighbour = Some(0);
                }
            }
            open_tile.cells[index].spans[0].neighbours = neighbours;
        }

        open_tile.distances = vec![0; open_tile.span_count];

        open_tile
    }
}

#[derive(Clone)]
struct LayerRegion {
    min: u16,
    max: u16,
    layer: Option<u8>,
    base: bool,
    neighbours: Vec<u16>,
    overlaps: Vec<u16>,
}

fn add_unique(values: &mut Vec<u16>, value: u16) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Parameters describing the padded heightfield the [OpenTile] came from.
pub(crate) struct LayerBuildParams {
    pub tile: IVec2,
    pub border_size: usize,
    pub heightfield_min: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    pub walkable_height: u16,
}

/// Splits the regions of ``open_tile`` into layers & crops them to the tile's interior.
pub(crate) fn build_heightfield_layers(
    open_tile: &OpenTile,
    params: &LayerBuildParams,
) -> Result<Vec<HeightfieldLayer>, TileGenerationError> {
    let region_count = usize::from(open_tile.max_regions.max(1));
    let mut regions = vec![
        LayerRegion {
            min: u16::MAX,
            max: 0,
            layer: None,
            base: false,
            neighbours: Vec::new(),
            overlaps: Vec::new(),
        };
        region_count
    ];

    // Find region neighbours & overlapping regions.
    let mut column_regions = Vec::with_capacity(8);
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        column_regions.clear();

        for span in cell.spans.iter() {
            let region_id = span.region;
            if region_id == 0 || usize::from(region_id) >= region_count {
                continue;
            }

            let region = &mut regions[usize::from(region_id)];
            region.min = region.min.min(span.min);
            region.max = region.max.max(span.min);
            column_regions.push(region_id);

            for dir in 0..4 {
                let Some((_, other)) = open_tile.neighbour(cell_index, span, dir) else {
                    continue;
                };
                if other.region != 0 && other.region != region_id {
                    add_unique(&mut regions[usize::from(region_id)].neighbours, other.region);
                }
            }
        }

        for (i, a) in column_regions.iter().enumerate() {
            for b in column_regions.iter().skip(i + 1) {
                if a != b {
                    add_unique(&mut regions[usize::from(*a)].overlaps, *b);
                    add_unique(&mut regions[usize::from(*b)].overlaps, *a);
                }
            }
        }
    }

    // Flood neighbouring regions into layers.
    let mut layer_count: usize = 0;
    let mut stack = Vec::with_capacity(64);
    for i in 1..region_count {
        if regions[i].layer.is_some() || regions[i].min > regions[i].max {
            continue;
        }
        if layer_count >= MAX_LAYERS {
            return Err(TileGenerationError::TooManyLayers { max: MAX_LAYERS });
        }
        let layer = layer_count as u8;
        layer_count += 1;

        regions[i].layer = Some(layer);
        regions[i].base = true;

        let mut layer_min = regions[i].min;
        let mut layer_max = regions[i].max;
        let mut layer_overlaps = regions[i].overlaps.clone();

        stack.clear();
        stack.push(i);
        while let Some(current) = stack.pop() {
            for neighbour_index in 0..regions[current].neighbours.len() {
                let neighbour = usize::from(regions[current].neighbours[neighbour_index]);
                let other = &regions[neighbour];
                if other.layer.is_some() {
                    continue;
                }
                // Skip if the neighbour overlaps the layer.
                if layer_overlaps.contains(&(neighbour as u16)) {
                    continue;
                }
                // Skip if the layer would get too tall.
                let min = layer_min.min(other.min);
                let max = layer_max.max(other.max);
                if max - min >= MAX_LAYER_HEIGHT {
                    continue;
                }

                layer_min = min;
                layer_max = max;
                for overlap in other.overlaps.iter() {
                    add_unique(&mut layer_overlaps, *overlap);
                }

                regions[neighbour].layer = Some(layer);
                stack.push(neighbour);
            }
        }

        regions[i].overlaps = layer_overlaps;
        regions[i].min = layer_min;
        regions[i].max = layer_max;
    }

    // Merge layers that don't overlap & sit close to each other.
    let merge_height = params.walkable_height.saturating_mul(4);
    for i in 1..region_count {
        if !regions[i].base {
            continue;
        }
        let Some(new_layer) = regions[i].layer else {
            continue;
        };

        loop {
            let candidate = (1..region_count).find(|j| {
                let (a, b) = (&regions[i], &regions[*j]);
                if *j == i || !b.base || b.layer.is_none() {
                    return false;
                }
                // Skip if the layers don't touch vertically.
                if !(a.min <= b.max.saturating_add(merge_height) && b.min <= a.max.saturating_add(merge_height)) {
                    return false;
                }
                if a.max.max(b.max) - a.min.min(b.min) >= MAX_LAYER_HEIGHT {
                    return false;
                }

                // Any region of either layer overlapping the other blocks the merge.
                let b_layer = b.layer;
                !regions
                    .iter()
                    .filter(|region| region.layer == b_layer)
                    .any(|region| region.overlaps.iter().any(|overlap| regions[usize::from(*overlap)].layer == Some(new_layer)))
                    && !a.overlaps.iter().any(|overlap| regions[usize::from(*overlap)].layer == b_layer)
            });

            let Some(j) = candidate else {
                break;
            };

            let old_layer = regions[j].layer;
            regions[j].base = false;
            for region in regions.iter_mut().filter(|region| region.layer == old_layer) {
                region.layer = Some(new_layer);
            }
            let (overlaps, min, max) = (regions[j].overlaps.clone(), regions[j].min, regions[j].max);
            let base = &mut regions[i];
            for overlap in overlaps {
                add_unique(&mut base.overlaps, overlap);
            }
            base.min = base.min.min(min);
            base.max = base.max.max(max);
        }
    }

    // Compact layer ids.
    let mut remap = [None; 256];
    let mut compacted: usize = 0;
    for region in regions.iter().skip(1) {
        if let Some(layer) = region.layer {
            if remap[usize::from(layer)].is_none() {
                remap[usize::from(layer)] = Some(compacted as u8);
                compacted += 1;
            }
        }
    }
    for region in regions.iter_mut() {
        region.layer = region.layer.and_then(|layer| remap[usize::from(layer)]);
    }

    let border = params.border_size;
    let layer_width = open_tile.width.saturating_sub(border * 2);
    let layer_height = open_tile.height.saturating_sub(border * 2);
    let bmin = params.heightfield_min + Vec3::new(border as f32, 0.0, border as f32) * params.cell_size;
    let bmax_xz = bmin + Vec3::new(layer_width as f32, 0.0, layer_height as f32) * params.cell_size;

    let mut layers = Vec::with_capacity(compacted);
    for layer_id in 0..compacted as u8 {
        let (mut hmin, mut hmax) = (u16::MAX, 0);
        for region in regions.iter().filter(|region| region.layer == Some(layer_id)) {
            hmin = hmin.min(region.min);
            hmax = hmax.max(region.max);
        }

        let mut layer = HeightfieldLayer {
            header: LayerHeader {
                tile: params.tile,
                layer: layer_id,
                bmin: Vec3::new(bmin.x, params.heightfield_min.y + f32::from(hmin) * params.cell_height, bmin.z),
                bmax: Vec3::new(
                    bmax_xz.x,
                    params.heightfield_min.y + f32::from(hmax) * params.cell_height,
                    bmax_xz.z,
                ),
                hmin,
                hmax,
                width: layer_width as u16,
                height: layer_height as u16,
                min_x: layer_width as u16,
                max_x: 0,
                min_y: layer_height as u16,
                max_y: 0,
            },
            heights: vec![EMPTY_HEIGHT; layer_width * layer_height],
            areas: vec![Area::NULL; layer_width * layer_height],
            cons: vec![0; layer_width * layer_height],
        };

        let mut has_data = false;
        for y in 0..layer_height {
            for x in 0..layer_width {
                let cell_index = (x + border) + (y + border) * open_tile.width;
                let index = x + y * layer_width;

                for span in open_tile.cells[cell_index].spans.iter() {
                    let Some(span_layer) = regions.get(usize::from(span.region)).and_then(|region| region.layer)
                    else {
                        continue;
                    };
                    if span.region == 0 || span_layer != layer_id {
                        continue;
                    }

                    has_data = true;
                    let header = &mut layer.header;
                    header.min_x = header.min_x.min(x as u16);
                    header.max_x = header.max_x.max(x as u16);
                    header.min_y = header.min_y.min(y as u16);
                    header.max_y = header.max_y.max(y as u16);

                    layer.heights[index] = (span.min - hmin) as u8;
                    layer.areas[index] = open_tile.areas[span.tile_index];

                    let mut portal = 0u8;
                    let mut connected = 0u8;
                    for dir in 0..4 {
                        let Some((other_cell, other)) = open_tile.neighbour(cell_index, span, dir) else {
                            continue;
                        };
                        if open_tile.areas[other.tile_index] == Area::NULL {
                            continue;
                        }

                        let other_layer = regions.get(usize::from(other.region)).and_then(|region| region.layer);
                        if other.region == 0 || other_layer != Some(layer_id) {
                            portal |= 1 << dir;
                            // Match heights on both sides of the portal.
                            if other.min > hmin {
                                let other_height = (other.min - hmin).min(MAX_LAYER_HEIGHT - 1) as u8;
                                layer.heights[index] = layer.heights[index].max(other_height);
                            }
                        } else {
                            let other_x = other_cell % open_tile.width;
                            let other_y = other_cell / open_tile.width;
                            let inside = other_x >= border
                                && other_y >= border
                                && other_x < border + layer_width
                                && other_y < border + layer_height;
                            if inside {
                                connected |= 1 << dir;
                            }
                        }
                    }

                    layer.cons[index] = (portal << 4) | connected;
                }
            }
        }

        if has_data {
            layers.push(layer);
        }
    }

    // Layers without interior cells were dropped, keep indices contiguous.
    for (index, layer) in layers.iter_mut().enumerate() {
        layer.header.layer = index as u8;
    }

    Ok(layers)
}
