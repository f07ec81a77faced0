//! Dynamic area modifiers marked onto decompressed layers before regions are built.

use std::{cmp::Ordering, sync::Arc};

use bevy::{
    log::warn,
    math::{Vec2, Vec3},
    transform::components::Transform,
};

use crate::{
    coords::{world_to_recast, BoundingBox},
    layers::{HeightfieldLayer, EMPTY_HEIGHT},
    settings::{AreaClass, BuildConfig},
    Area,
};

/// Orders modifier elements before marking. Later elements are marked on top of earlier ones.
pub type ModifierSortFn = Arc<dyn Fn(&AreaModifierElement, &AreaModifierElement) -> Ordering + Send + Sync>;

/// World space (Z-up) shape of an area modifier.
#[derive(Clone, Debug, PartialEq)]
pub enum ModifierShape {
    /// Vertical cylinder standing on ``base``.
    Cylinder { base: Vec3, radius: f32, height: f32 },
    Box { center: Vec3, half_extents: Vec3 },
    /// Convex footprint on the XY-plane extruded from ``min_z`` to ``max_z``.
    Convex { points: Vec<Vec2>, min_z: f32, max_z: f32 },
}

/// Changes the area of the nav-mesh inside a shape.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaModifier {
    pub shape: ModifierShape,
    pub area_class: AreaClass,
    /// Only replace cells currently of this class.
    pub replace_class: Option<AreaClass>,
    /// Extends the shape down by the agent's height so agents standing below it are affected.
    pub include_agent_height: bool,
}

impl AreaModifier {
    pub fn cylinder(base: Vec3, radius: f32, height: f32, area_class: AreaClass) -> Self {
        Self::new(ModifierShape::Cylinder { base, radius, height }, area_class)
    }

    pub fn cuboid(center: Vec3, half_extents: Vec3, area_class: AreaClass) -> Self {
        Self::new(ModifierShape::Box { center, half_extents }, area_class)
    }

    pub fn convex(points: Vec<Vec2>, min_z: f32, max_z: f32, area_class: AreaClass) -> Self {
        Self::new(ModifierShape::Convex { points, min_z, max_z }, area_class)
    }

    fn new(shape: ModifierShape, area_class: AreaClass) -> Self {
        Self {
            shape,
            area_class,
            replace_class: None,
            include_agent_height: false,
        }
    }

    /// Setter for [`AreaModifier::replace_class`]
    pub fn with_replace_class(mut self, replace_class: AreaClass) -> Self {
        self.replace_class = Some(replace_class);

        self
    }
    /// Setter for [`AreaModifier::include_agent_height`]
    pub fn with_agent_height(mut self, include_agent_height: bool) -> Self {
        self.include_agent_height = include_agent_height;

        self
    }

    /// World space bounds, without any instance transform.
    pub fn bounds(&self) -> BoundingBox {
        match &self.shape {
            ModifierShape::Cylinder { base, radius, height } => BoundingBox::new(
                *base - Vec3::new(*radius, *radius, 0.0),
                *base + Vec3::new(*radius, *radius, *height),
            ),
            ModifierShape::Box { center, half_extents } => {
                BoundingBox::from_center_half_extents(*center, *half_extents)
            }
            ModifierShape::Convex { points, min_z, max_z } => {
                let mut bounds = BoundingBox::from_points(points.iter().map(|point| point.extend(*min_z)));
                bounds.max.z = *max_z;

                bounds
            }
        }
    }
}

/// Area modifiers of one navigation element along with its instance transforms.
///
/// Without instance transforms the modifiers are applied once, as is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AreaModifierElement {
    pub areas: Vec<AreaModifier>,
    pub instance_transforms: Vec<Transform>,
}

impl AreaModifierElement {
    pub fn new(areas: Vec<AreaModifier>) -> Self {
        Self {
            areas,
            instance_transforms: Vec::new(),
        }
    }

    /// Bounds covering every modifier of every instance.
    pub fn bounds(&self) -> BoundingBox {
        let mut bounds = BoundingBox::EMPTY;
        for area in self.areas.iter() {
            let area_bounds = area.bounds();
            if self.instance_transforms.is_empty() {
                bounds = bounds.union(&area_bounds);
            }
            for transform in self.instance_transforms.iter() {
                bounds = bounds.union(&area_bounds.transformed(transform));
            }
        }

        bounds
    }
}

/// Sorts modifier elements with ``sort``, keeping insertion order for ties.
pub(crate) fn sort_modifiers(elements: &mut [AreaModifierElement], sort: Option<&ModifierSortFn>) {
    if let Some(sort) = sort {
        elements.sort_by(|a, b| sort(a, b));
    }
}

/// Marks every modifier onto ``layer``, in order.
///
/// Replacement checks the areas the layer had before any modifier was applied, so the last modifier wins where two overlap.
pub(crate) fn mark_dynamic_areas(layer: &mut HeightfieldLayer, elements: &[AreaModifierElement], config: &BuildConfig) {
    let original_areas = layer.areas.clone();

    for element in elements.iter() {
        for area in element.areas.iter() {
            if element.instance_transforms.is_empty() {
                mark_dynamic_area(area, &Transform::IDENTITY, layer, &original_areas, config);
            }
            for transform in element.instance_transforms.iter() {
                mark_dynamic_area(area, transform, layer, &original_areas, config);
            }
        }
    }
}

fn mark_dynamic_area(
    modifier: &AreaModifier,
    local_to_world: &Transform,
    layer: &mut HeightfieldLayer,
    original_areas: &[Area],
    config: &BuildConfig,
) {
    let Some(area) = config.resolve_area_class(modifier.area_class) else {
        warn!("Trying to use undefined area class {:?}, skipping modifier.", modifier.area_class);
        return;
    };
    let replace = match modifier.replace_class {
        Some(class) => {
            let Some(replace) = config.resolve_area_class(class) else {
                warn!("Trying to replace undefined area class {class:?}, skipping modifier.");
                return;
            };
            Some(replace)
        }
        None => None,
    };

    // Check whether the modifier affects this layer.
    let mut modifier_bounds = modifier.bounds().transformed(local_to_world);
    if modifier.include_agent_height {
        modifier_bounds.min.z -= config.agent_height;
    }
    if !layer.world_bounds(0.0).intersects(&modifier_bounds) {
        return;
    }

    let expand_by = config.agent_radius;
    let offset_z = config.cell_height
        + if modifier.include_agent_height {
            config.agent_height
        } else {
            0.0
        };

    let marker = LayerMarker {
        area,
        replace,
        original_areas,
        cell_size: config.cell_size,
        cell_height: config.cell_height,
    };

    match &modifier.shape {
        ModifierShape::Cylinder { base, radius, height } => {
            // Only scaling and translation.
            let scale = local_to_world.scale.abs();
            let mut base = local_to_world.transform_point(*base);
            let mut height = height * scale.z;
            let radius = radius * scale.x.max(scale.y) + expand_by;

            base.z -= offset_z;
            height += offset_z * 2.0;

            marker.mark_cylinder(layer, world_to_recast(base), radius, height);
        }
        ModifierShape::Box { center, half_extents } => {
            let world = BoundingBox::from_center_half_extents(*center, *half_extents)
                .transformed(local_to_world)
                .expand_by(Vec3::new(expand_by, expand_by, offset_z));

            marker.mark_box(layer, &world.to_recast());
        }
        ModifierShape::Convex { points, min_z, max_z } => {
            // Only scaling and translation on the XY-plane.
            let scale = local_to_world.scale.truncate().abs();
            let translation = local_to_world.translation;
            let points: Vec<Vec2> = points.iter().map(|point| *point * scale + translation.truncate()).collect();

            let grown = grow_convex_hull(&points, expand_by);
            if grown.is_empty() {
                return;
            }

            let recast_points: Vec<Vec2> = grown
                .iter()
                .map(|point| {
                    let recast = world_to_recast(point.extend(0.0));
                    Vec2::new(recast.x, recast.z)
                })
                .collect();
            let min_y = min_z + translation.z - offset_z;
            let max_y = max_z + translation.z + config.cell_height;

            marker.mark_convex(layer, &recast_points, min_y, max_y);
        }
    }
}

/// Marks cells of a layer. All positions are in generation space.
struct LayerMarker<'a> {
    area: Area,
    replace: Option<Area>,
    original_areas: &'a [Area],
    cell_size: f32,
    cell_height: f32,
}

impl LayerMarker<'_> {
    /// Inclusive cell range covered by ``min..max`` on the XZ-plane & height range in cells.
    fn footprint(&self, layer: &HeightfieldLayer, min: Vec3, max: Vec3) -> Option<(usize, usize, usize, usize, i32, i32)> {
        let origin = layer.header.bmin;
        let width = i32::from(layer.header.width);
        let height = i32::from(layer.header.height);

        let min_x = ((min.x - origin.x) / self.cell_size).floor() as i32;
        let min_z = ((min.z - origin.z) / self.cell_size).floor() as i32;
        let max_x = ((max.x - origin.x) / self.cell_size).floor() as i32;
        let max_z = ((max.z - origin.z) / self.cell_size).floor() as i32;
        let min_y = ((min.y - origin.y) / self.cell_height).floor() as i32;
        let max_y = ((max.y - origin.y) / self.cell_height).floor() as i32;

        if max_x < 0 || min_x >= width || max_z < 0 || min_z >= height {
            return None;
        }

        Some((
            min_x.max(0) as usize,
            max_x.min(width - 1) as usize,
            min_z.max(0) as usize,
            max_z.min(height - 1) as usize,
            min_y,
            max_y,
        ))
    }

    #[inline]
    fn mark_cell(&self, layer: &mut HeightfieldLayer, index: usize, min_y: i32, max_y: i32) {
        let height = layer.heights[index];
        if height == EMPTY_HEIGHT {
            return;
        }
        let height = i32::from(height);
        if height < min_y || height > max_y {
            return;
        }

        let original = self.original_areas[index];
        if original == Area::NULL {
            return;
        }
        match self.replace {
            Some(replace) if original != replace => {}
            _ => layer.areas[index] = self.area,
        }
    }

    fn mark_box(&self, layer: &mut HeightfieldLayer, bounds: &BoundingBox) {
        let Some((min_x, max_x, min_z, max_z, min_y, max_y)) = self.footprint(layer, bounds.min, bounds.max) else {
            return;
        };

        let width = usize::from(layer.header.width);
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                self.mark_cell(layer, x + z * width, min_y, max_y);
            }
        }
    }

    fn mark_cylinder(&self, layer: &mut HeightfieldLayer, base: Vec3, radius: f32, height: f32) {
        let min = base - Vec3::new(radius, 0.0, radius);
        let max = base + Vec3::new(radius, height, radius);
        let Some((min_x, max_x, min_z, max_z, min_y, max_y)) = self.footprint(layer, min, max) else {
            return;
        };

        let origin = layer.header.bmin;
        let width = usize::from(layer.header.width);
        let radius_sqr = radius * radius;
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                let dx = origin.x + (x as f32 + 0.5) * self.cell_size - base.x;
                let dz = origin.z + (z as f32 + 0.5) * self.cell_size - base.z;
                if dx * dx + dz * dz >= radius_sqr {
                    continue;
                }

                self.mark_cell(layer, x + z * width, min_y, max_y);
            }
        }
    }

    /// ``points`` are the polygon's XZ coordinates.
    fn mark_convex(&self, layer: &mut HeightfieldLayer, points: &[Vec2], min_y: f32, max_y: f32) {
        let mut min = Vec3::new(f32::MAX, min_y, f32::MAX);
        let mut max = Vec3::new(f32::MIN, max_y, f32::MIN);
        for point in points.iter() {
            min.x = min.x.min(point.x);
            min.z = min.z.min(point.y);
            max.x = max.x.max(point.x);
            max.z = max.z.max(point.y);
        }
        let Some((min_x, max_x, min_z, max_z, min_y, max_y)) = self.footprint(layer, min, max) else {
            return;
        };

        let origin = layer.header.bmin;
        let width = usize::from(layer.header.width);
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                let center = Vec2::new(
                    origin.x + (x as f32 + 0.5) * self.cell_size,
                    origin.z + (z as f32 + 0.5) * self.cell_size,
                );
                if !point_in_polygon(center, points) {
                    continue;
                }

                self.mark_cell(layer, x + z * width, min_y, max_y);
            }
        }
    }
}

fn point_in_polygon(point: Vec2, polygon: &[Vec2]) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > point.y) != (b.y > point.y) && point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Pushes every edge of a convex polygon outwards by ``expand_by``.
///
/// Works with either winding. Returns nothing for degenerate polygons.
pub(crate) fn grow_convex_hull(points: &[Vec2], expand_by: f32) -> Vec<Vec2> {
    if points.len() < 3 {
        return Vec::new();
    }

    let signed_area: f32 = (0..points.len())
        .map(|i| points[i].perp_dot(points[(i + 1) % points.len()]))
        .sum();
    if signed_area == 0.0 {
        return Vec::new();
    }
    // Outward normal of an edge is its direction rotated clockwise for counter-clockwise polygons.
    let outward = |direction: Vec2| {
        if signed_area > 0.0 {
            Vec2::new(direction.y, -direction.x)
        } else {
            Vec2::new(-direction.y, direction.x)
        }
    };

    let count = points.len();
    (0..count)
        .map(|i| {
            let previous = points[(i + count - 1) % count];
            let current = points[i];
            let next = points[(i + 1) % count];

            let incoming = (current - previous).normalize_or_zero();
            let outgoing = (next - current).normalize_or_zero();
            let offset_a = outward(incoming) * expand_by;
            let offset_b = outward(outgoing) * expand_by;

            // Intersect the two offset edges.
            let origin_a = previous + offset_a;
            let origin_b = current + offset_b;
            let denominator = incoming.perp_dot(outgoing);
            if denominator.abs() < f32::EPSILON {
                return current + offset_a;
            }
            let t = (origin_b - origin_a).perp_dot(outgoing) / denominator;

            origin_a + incoming * t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bevy::math::IVec2;

    use super::*;
    use crate::{layers::LayerHeader, settings::NavMeshSettings};

    const WATER: AreaClass = AreaClass("Water");
    const ROAD: AreaClass = AreaClass("Road");

    fn config() -> BuildConfig {
        let settings = NavMeshSettings::from_agent(0.0, 2.0)
            .with_cell_size(1.0, 0.5)
            .with_area_class(WATER, Area(10), 1)
            .with_area_class(ROAD, Area(11), 1);

        BuildConfig::from_settings(&settings).expect("valid settings")
    }

    /// Flat 10x10 layer covering world x in [0, 10], y in [-10, 0] at height 0.
    fn flat_layer() -> HeightfieldLayer {
        HeightfieldLayer {
            header: LayerHeader {
                tile: IVec2::ZERO,
                layer: 0,
                bmin: Vec3::new(0.0, 0.0, 0.0),
                bmax: Vec3::new(10.0, 1.0, 10.0),
                hmin: 0,
                hmax: 0,
                width: 10,
                height: 10,
                min_x: 0,
                max_x: 9,
                min_y: 0,
                max_y: 9,
            },
            heights: vec![0; 100],
            areas: vec![Area::WALKABLE; 100],
            cons: vec![0; 100],
        }
    }

    fn count(layer: &HeightfieldLayer, area: Area) -> usize {
        layer.areas.iter().filter(|cell| **cell == area).count()
    }

    #[test]
    fn box_marks_its_footprint() {
        let mut layer = flat_layer();
        // World x in [2, 4], y in [-4, -2].
        let element = AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(3.0, -3.0, 0.0),
            Vec3::new(0.9, 0.9, 1.0),
            WATER,
        )]);
        mark_dynamic_areas(&mut layer, &[element], &config());

        assert_eq!(count(&layer, Area(10)), 4);
        assert_eq!(layer.areas[2 + 2 * 10], Area(10));
    }

    #[test]
    fn unresolved_class_is_skipped() {
        let mut layer = flat_layer();
        let element = AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(5.0, -5.0, 0.0),
            Vec3::splat(3.0),
            AreaClass("Lava"),
        )]);
        mark_dynamic_areas(&mut layer, &[element], &config());

        assert_eq!(count(&layer, Area::WALKABLE), 100);
    }

    #[test]
    fn replace_only_touches_matching_cells_and_last_wins() {
        let mut layer = flat_layer();
        let first = AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(3.0, -5.0, 0.0),
            Vec3::new(2.9, 4.9, 1.0),
            WATER,
        )
        .with_replace_class(AreaClass::DEFAULT)]);
        let second = AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(6.0, -5.0, 0.0),
            Vec3::new(2.9, 4.9, 1.0),
            ROAD,
        )
        .with_replace_class(AreaClass::DEFAULT)]);
        mark_dynamic_areas(&mut layer, &[first, second], &config());

        // Columns 0..=5 are water, 3..=8 road, overlap 3..=5 goes to the later road modifier.
        assert_eq!(layer.areas[4], Area(11));
        assert_eq!(layer.areas[1], Area(10));
        assert_eq!(layer.areas[9], Area::WALKABLE);

        let mut layer = flat_layer();
        layer.areas[0] = Area(10);
        let replace_water = AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(5.0, -5.0, 0.0),
            Vec3::splat(6.0),
            ROAD,
        )
        .with_replace_class(WATER)]);
        mark_dynamic_areas(&mut layer, &[replace_water], &config());
        assert_eq!(count(&layer, Area(11)), 1);
    }

    #[test]
    fn cylinder_respects_instances() {
        let mut layer = flat_layer();
        let element = AreaModifierElement {
            areas: vec![AreaModifier::cylinder(Vec3::ZERO, 1.0, 1.0, WATER)],
            instance_transforms: vec![
                Transform::from_xyz(2.5, -2.5, 0.0),
                Transform::from_xyz(7.5, -7.5, 0.0),
            ],
        };
        mark_dynamic_areas(&mut layer, &[element], &config());

        assert_eq!(layer.areas[2 + 2 * 10], Area(10));
        assert_eq!(layer.areas[7 + 7 * 10], Area(10));
        assert_eq!(layer.areas[5 + 5 * 10], Area::WALKABLE);
    }

    #[test]
    fn convex_hull_grows_outwards() {
        let square = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        let grown = grow_convex_hull(&square, 0.5);
        assert!((grown[0] - Vec2::new(-0.5, -0.5)).length() < 1e-5);
        assert!((grown[2] - Vec2::new(1.5, 1.5)).length() < 1e-5);

        let mut clockwise = square;
        clockwise.reverse();
        let grown = grow_convex_hull(&clockwise, 0.5);
        assert!((grown[0] - Vec2::new(-0.5, 1.5)).length() < 1e-5);
        assert!(grow_convex_hull(&square[..2], 1.0).is_empty());
    }

    #[test]
    fn convex_marks_inside_polygon() {
        let mut layer = flat_layer();
        let element = AreaModifierElement::new(vec![AreaModifier::convex(
            vec![
                Vec2::new(1.0, -1.0),
                Vec2::new(3.0, -1.0),
                Vec2::new(3.0, -3.0),
                Vec2::new(1.0, -3.0),
            ],
            -1.0,
            1.0,
            WATER,
        )]);
        mark_dynamic_areas(&mut layer, &[element], &config());

        assert_eq!(count(&layer, Area(10)), 4);
        assert_eq!(layer.areas[1 + 10], Area(10));
    }

    #[test]
    fn sort_is_stable() {
        let named = |class| AreaModifierElement::new(vec![AreaModifier::cuboid(Vec3::ZERO, Vec3::ONE, class)]);
        let mut elements = vec![named(ROAD), named(WATER), named(AreaClass::DEFAULT)];
        let sort: ModifierSortFn = Arc::new(|a: &AreaModifierElement, b: &AreaModifierElement| {
            a.areas[0].area_class.0.cmp(b.areas[0].area_class.0)
        });

        sort_modifiers(&mut elements, Some(&sort));
        let order: Vec<_> = elements.iter().map(|element| element.areas[0].area_class).collect();
        assert_eq!(order, vec![AreaClass::DEFAULT, ROAD, WATER]);

        sort_modifiers(&mut elements, None);
        assert_eq!(elements[0].areas[0].area_class, AreaClass::DEFAULT);
    }
}
