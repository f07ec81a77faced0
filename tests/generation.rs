use std::sync::Arc;

use bevy::{
    math::{IVec2, Vec2, Vec3},
    tasks::{AsyncComputeTaskPool, TaskPool},
    transform::components::Transform,
};
use oxidized_navmesh_generator::{
    coords::{world_to_recast, BoundingBox},
    element::{ElementId, NavigationElement},
    generator::{DirtyArea, DirtyFlags, NavMeshGenerator},
    geometry_export::{CollisionShape, GeometryExport},
    modifiers::{AreaModifier, AreaModifierElement, ModifierSortFn},
    settings::{AreaClass, NavMeshSettings, PartitioningMethod},
    tile_blob::{NavigationTile, PolygonKind},
    Area,
};

const WATER: AreaClass = AreaClass("Water");
const GRASS: AreaClass = AreaClass("Grass");

fn settings(agent_radius: f32) -> NavMeshSettings {
    NavMeshSettings::from_agent(agent_radius, 2.0)
        .with_cell_size(0.25, 0.1)
        .with_tile_size(12.0)
        .with_partitioning(PartitioningMethod::Monotone, PartitioningMethod::Monotone)
        .with_area_class(WATER, Area(5), 1)
        .with_area_class(GRASS, Area(6), 1)
}

/// Generator covering only tile (0, 0), which spans world x in [0, 12] & y in [-12, 0].
fn generator(settings: &NavMeshSettings) -> NavMeshGenerator {
    AsyncComputeTaskPool::get_or_init(TaskPool::default);

    let mut generator = NavMeshGenerator::new(settings).expect("valid settings");
    generator.set_inclusion_bounds(vec![BoundingBox::new(
        Vec3::new(0.5, -11.5, -1.0),
        Vec3::new(11.5, -0.5, 10.0),
    )]);

    generator
}

fn cuboid(center: Vec3, half_extents: Vec3) -> NavigationElement {
    let mut export = GeometryExport::new();
    export.add_shape(&CollisionShape::Box { half_extents }, &Transform::from_translation(center));

    NavigationElement::from_geometry(export.finish())
}

/// 10x10 ground quad with its top at z = 0, centered in tile (0, 0).
fn ground() -> NavigationElement {
    cuboid(Vec3::new(6.0, -6.0, -0.1), Vec3::new(5.0, 5.0, 0.1))
}

fn layers_at(generator: &NavMeshGenerator, coord: IVec2) -> Vec<NavigationTile> {
    let nav_mesh = generator.nav_mesh().get();
    let nav_mesh = nav_mesh.read().expect("nav-mesh lock");

    nav_mesh
        .tiles_at(coord.x, coord.y)
        .into_iter()
        .filter_map(|tile_ref| nav_mesh.tile(tile_ref).cloned())
        .collect()
}

fn tile_data_at(generator: &NavMeshGenerator, coord: IVec2) -> Vec<Vec<u8>> {
    let nav_mesh = generator.nav_mesh().get();
    let nav_mesh = nav_mesh.read().expect("nav-mesh lock");

    nav_mesh
        .tiles_at(coord.x, coord.y)
        .into_iter()
        .filter_map(|tile_ref| nav_mesh.tile_data(tile_ref).map(<[u8]>::to_vec))
        .collect()
}

fn ground_polygons(tile: &NavigationTile) -> impl Iterator<Item = Vec<Vec3>> + '_ {
    tile.polygons
        .iter()
        .filter(|polygon| polygon.kind == PolygonKind::Ground)
        .map(|polygon| {
            polygon
                .vertices
                .iter()
                .map(|index| tile.vertices[usize::from(*index)])
                .collect()
        })
}

fn polygon_area(vertices: &[Vec3]) -> f32 {
    let doubled: f32 = (0..vertices.len())
        .map(|i| {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];
            a.x * b.z - b.x * a.z
        })
        .sum();

    doubled.abs() * 0.5
}

/// Whether a convex polygon contains a point on the generation space XZ-plane.
fn contains(vertices: &[Vec3], point: Vec2) -> bool {
    let crosses: Vec<f32> = (0..vertices.len())
        .map(|i| {
            let a = Vec2::new(vertices[i].x, vertices[i].z);
            let b = {
                let next = vertices[(i + 1) % vertices.len()];
                Vec2::new(next.x, next.z)
            };
            (b - a).perp_dot(point - a)
        })
        .collect();

    crosses.iter().all(|cross| *cross >= -1e-4) || crosses.iter().all(|cross| *cross <= 1e-4)
}

/// Ground polygon below ``max_height`` containing a world space position, along with its area.
fn area_at(generator: &NavMeshGenerator, world: Vec3, max_height: f32) -> Option<Area> {
    let recast = world_to_recast(world);
    let point = Vec2::new(recast.x, recast.z);

    layers_at(generator, IVec2::ZERO).iter().find_map(|tile| {
        tile.polygons
            .iter()
            .filter(|polygon| polygon.kind == PolygonKind::Ground)
            .find(|polygon| {
                let vertices: Vec<Vec3> = polygon
                    .vertices
                    .iter()
                    .map(|index| tile.vertices[usize::from(*index)])
                    .collect();

                vertices.iter().all(|vertex| vertex.y < max_height) && contains(&vertices, point)
            })
            .map(|polygon| polygon.area)
    })
}

#[test]
fn flat_quad_builds_single_layer_covering_the_quad() {
    let mut generator = generator(&settings(0.0));
    generator.insert_element(ElementId(0), ground());
    generator.ensure_build_completion();

    let layers = layers_at(&generator, IVec2::ZERO);
    assert_eq!(layers.len(), 1);
    assert_eq!(generator.stats().failed_builds, 0);

    let polygons: Vec<Vec<Vec3>> = ground_polygons(&layers[0]).collect();
    assert!((1..=2).contains(&polygons.len()), "got {} polygons", polygons.len());

    let area: f32 = polygons.iter().map(|polygon| polygon_area(polygon)).sum();
    assert!((area - 100.0).abs() < 10.0, "covered area {area}");
}

#[test]
fn obstacle_cuts_hole_expanded_by_agent_radius() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.insert_element(
        ElementId(1),
        cuboid(Vec3::new(6.0, -6.0, 1.5), Vec3::new(1.0, 1.0, 1.5)),
    );
    generator.ensure_build_completion();

    // Only look at polygons on the ground, not on top of the obstacle.
    let covered = |x: f32| area_at(&generator, Vec3::new(x, -6.0, 0.0), 1.0).is_some();

    assert!(!covered(6.0));
    // Footprint ends at 7.0, grown by the agent radius to 7.5.
    assert!(!covered(7.1));
    assert!(covered(8.5));
    assert!(covered(3.5));
}

#[test]
fn no_ground_polygon_inside_obstacle_footprint() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.insert_element(
        ElementId(1),
        cuboid(Vec3::new(6.0, -6.0, 1.5), Vec3::new(1.0, 1.0, 1.5)),
    );
    generator.ensure_build_completion();

    // The footprint spans 5 to 7 on both generation space axes, shrunk a little to stay clear of simplification.
    let inside_footprint = |point: Vec2| (4.9..7.1).contains(&point.x) && (4.9..7.1).contains(&point.y);

    let layers = layers_at(&generator, IVec2::ZERO);
    assert!(!layers.is_empty());
    for tile in layers.iter() {
        for polygon in ground_polygons(tile).filter(|polygon| polygon.iter().all(|vertex| vertex.y < 1.0)) {
            let centroid = polygon.iter().fold(Vec3::ZERO, |sum, vertex| sum + *vertex) / polygon.len() as f32;

            assert!(
                !inside_footprint(Vec2::new(centroid.x, centroid.z)),
                "ground polygon {polygon:?} lies under the obstacle"
            );
        }
    }
}

#[test]
fn area_only_change_reuses_compressed_layers() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.ensure_build_completion();

    let before = generator.stats();
    assert_eq!(before.compressed_layer_builds, 1);
    let layer_data: Vec<Vec<u8>> = generator
        .compressed_layers(IVec2::ZERO)
        .expect("layers are kept after a build")
        .iter()
        .map(|layer| layer.data().to_vec())
        .collect();

    let water = NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![
        AreaModifier::cuboid(Vec3::new(6.0, -6.0, 0.0), Vec3::new(2.0, 2.0, 1.0), WATER),
    ]));
    generator.insert_element(ElementId(1), water);
    assert!(!generator.pending_tiles()[0].rebuild_geometry);
    generator.ensure_build_completion();

    let after = generator.stats();
    assert_eq!(after.compressed_layer_builds, before.compressed_layer_builds);
    assert!(after.navigation_layer_builds > before.navigation_layer_builds);

    let reused: Vec<Vec<u8>> = generator
        .compressed_layers(IVec2::ZERO)
        .expect("layers are kept after a build")
        .iter()
        .map(|layer| layer.data().to_vec())
        .collect();
    assert_eq!(reused, layer_data);

    assert_eq!(area_at(&generator, Vec3::new(6.0, -6.0, 0.0), 1.0), Some(Area(5)));
    assert_eq!(area_at(&generator, Vec3::new(2.0, -2.0, 0.0), 1.0), Some(Area::WALKABLE));
}

fn overlapping_modifiers(sort: ModifierSortFn) -> Option<Area> {
    let mut generator = generator(&settings(0.5).with_area_sort(Some(sort)));
    generator.insert_element(ElementId(0), ground());

    // Overlap in x between 5 & 7.
    generator.insert_element(
        ElementId(1),
        NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(4.5, -6.0, 0.0),
            Vec3::new(2.5, 2.0, 1.0),
            WATER,
        )
        .with_replace_class(AreaClass::DEFAULT)])),
    );
    generator.insert_element(
        ElementId(2),
        NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![AreaModifier::cuboid(
            Vec3::new(7.5, -6.0, 0.0),
            Vec3::new(2.5, 2.0, 1.0),
            GRASS,
        )
        .with_replace_class(AreaClass::DEFAULT)])),
    );
    generator.ensure_build_completion();

    area_at(&generator, Vec3::new(6.0, -6.0, 0.0), 1.0)
}

#[test]
fn later_sorted_modifier_wins_overlap() {
    let by_class: ModifierSortFn = Arc::new(|a: &AreaModifierElement, b: &AreaModifierElement| {
        a.areas[0].area_class.0.cmp(b.areas[0].area_class.0)
    });
    // "Water" sorts after "Grass".
    assert_eq!(overlapping_modifiers(by_class), Some(Area(5)));

    let reversed: ModifierSortFn = Arc::new(|a: &AreaModifierElement, b: &AreaModifierElement| {
        b.areas[0].area_class.0.cmp(a.areas[0].area_class.0)
    });
    assert_eq!(overlapping_modifiers(reversed), Some(Area(6)));
}

#[test]
fn rebuilding_unchanged_tile_is_byte_identical() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.insert_element(
        ElementId(1),
        cuboid(Vec3::new(4.0, -8.0, 0.5), Vec3::new(0.5, 1.5, 0.5)),
    );
    generator.ensure_build_completion();

    let compressed = |generator: &NavMeshGenerator| -> Vec<Vec<u8>> {
        generator
            .compressed_layers(IVec2::ZERO)
            .map(|layers| layers.iter().map(|layer| layer.data().to_vec()).collect())
            .unwrap_or_default()
    };
    let first_layers = compressed(&generator);
    let first_tiles = tile_data_at(&generator, IVec2::ZERO);
    assert!(!first_tiles.is_empty());

    let tile = BoundingBox::new(Vec3::new(1.0, -11.0, 0.0), Vec3::new(11.0, -1.0, 1.0));
    generator.mark_dirty_tiles(&[DirtyArea::new(tile, DirtyFlags::GEOMETRY)]);
    generator.ensure_build_completion();

    assert_eq!(generator.stats().compressed_layer_builds, 2);
    assert_eq!(compressed(&generator), first_layers);
    assert_eq!(tile_data_at(&generator, IVec2::ZERO), first_tiles);
}

#[test]
fn dirty_marks_stay_local() {
    let settings = NavMeshSettings::from_agent(0.5, 2.0)
        .with_cell_size(0.25, 0.1)
        .with_tile_size(10.0);
    let mut generator = NavMeshGenerator::new(&settings).expect("valid settings");
    generator.set_inclusion_bounds(vec![BoundingBox::new(
        Vec3::new(-50.0, -50.0, -5.0),
        Vec3::new(50.0, 50.0, 5.0),
    )]);
    generator.cancel_build();

    // Well inside tile (0, 0), further than the voxelization border from its edges.
    let inside = BoundingBox::new(Vec3::new(4.0, -6.0, 0.0), Vec3::new(6.0, -4.0, 1.0));
    generator.mark_dirty_tiles(&[DirtyArea::new(inside, DirtyFlags::GEOMETRY)]);
    let coords: Vec<IVec2> = generator.pending_tiles().iter().map(|tile| tile.coord).collect();
    assert_eq!(coords, vec![IVec2::ZERO]);
    generator.cancel_build();

    // On the edge shared by tiles (0, 0) & (1, 0).
    let shared_edge = BoundingBox::new(Vec3::new(10.0, -6.0, 0.0), Vec3::new(10.0, -4.0, 1.0));
    generator.mark_dirty_tiles(&[DirtyArea::new(shared_edge, DirtyFlags::GEOMETRY)]);
    let mut coords: Vec<IVec2> = generator.pending_tiles().iter().map(|tile| tile.coord).collect();
    coords.sort_by_key(|coord| (coord.x, coord.y));
    assert_eq!(coords, vec![IVec2::new(0, 0), IVec2::new(1, 0)]);
}

#[test]
fn only_one_build_per_tile_is_in_flight() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());

    generator.process_tile_tasks(usize::MAX);
    let in_flight = generator.running_tiles().any(|coord| coord == IVec2::ZERO);

    let area = BoundingBox::new(Vec3::new(5.0, -7.0, 0.0), Vec3::new(7.0, -5.0, 1.0));
    generator.mark_dirty_tiles(&[DirtyArea::new(area, DirtyFlags::GEOMETRY)]);
    generator.mark_dirty_tiles(&[DirtyArea::new(area, DirtyFlags::GEOMETRY)]);
    generator.process_tile_tasks(usize::MAX);

    assert!(generator.running_tiles().filter(|coord| *coord == IVec2::ZERO).count() <= 1);
    if in_flight {
        // The follow-up build waits for the running one.
        assert!(generator.pending_tiles().iter().any(|tile| tile.coord == IVec2::ZERO));
    }

    generator.ensure_build_completion();
    assert!(!generator.is_build_in_progress(true));
    assert_eq!(layers_at(&generator, IVec2::ZERO).len(), 1);
}

#[test]
fn reconstruction_discards_running_builds() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.process_tile_tasks(usize::MAX);
    let running = generator.num_running_build_tasks();
    let version = generator.version();

    generator.construct_tiled_nav_mesh();
    assert_eq!(generator.version(), version + 1);
    assert_eq!(generator.num_running_build_tasks(), 0);
    assert!(generator.stats().discarded_builds >= running);

    generator.ensure_build_completion();
    assert_eq!(layers_at(&generator, IVec2::ZERO).len(), 1);
}

#[test]
fn failed_rebuild_keeps_previous_layers() {
    let mut generator = NavMeshGenerator::new(&settings(0.5)).expect("valid settings");
    AsyncComputeTaskPool::get_or_init(TaskPool::default);
    generator.set_inclusion_bounds(vec![BoundingBox::new(
        Vec3::new(0.5, -11.5, -1.0),
        Vec3::new(11.5, -0.5, 230.0),
    )]);
    generator.insert_element(ElementId(0), ground());
    generator.ensure_build_completion();

    let before = tile_data_at(&generator, IVec2::ZERO);
    assert_eq!(before.len(), 1);

    // More overlapping floors than a tile can have layers.
    let mut export = GeometryExport::new();
    for floor in 1..=70 {
        export.add_shape(
            &CollisionShape::Box {
                half_extents: Vec3::new(4.0, 4.0, 0.1),
            },
            &Transform::from_xyz(6.0, -6.0, floor as f32 * 3.0),
        );
    }
    generator.insert_element(ElementId(1), NavigationElement::from_geometry(export.finish()));
    generator.ensure_build_completion();

    assert_eq!(generator.stats().failed_builds, 1);
    assert_eq!(tile_data_at(&generator, IVec2::ZERO), before);
}

/// Walkable area, lowest & highest ground vertex of every layer of tile (0, 0), lowest layer first.
fn layer_summary(generator: &NavMeshGenerator) -> Vec<(f32, f32, f32)> {
    let mut summary: Vec<(f32, f32, f32)> = layers_at(generator, IVec2::ZERO)
        .iter()
        .map(|tile| {
            let heights = ground_polygons(tile).flatten().map(|vertex| vertex.y);
            let (min, max) = heights.fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), y| {
                (min.min(y), max.max(y))
            });

            (tile.walkable_area(), min, max)
        })
        .collect();
    summary.sort_by(|a, b| a.1.total_cmp(&b.1));

    summary
}

fn assert_summaries_match(cached: &[(f32, f32, f32)], uncached: &[(f32, f32, f32)]) {
    assert_eq!(cached.len(), uncached.len());
    for (cached, uncached) in cached.iter().zip(uncached.iter()) {
        assert!((cached.0 - uncached.0).abs() < 1.0, "{cached:?} != {uncached:?}");
        assert!((cached.1 - uncached.1).abs() < 0.05, "{cached:?} != {uncached:?}");
        assert!((cached.2 - uncached.2).abs() < 0.05, "{cached:?} != {uncached:?}");
    }
}

#[test]
fn voxel_cache_matches_uncached_generation() {
    let mut cached = generator(&settings(0.5).with_voxel_cache(true));
    let mut uncached = generator(&settings(0.5));
    for generator in [&mut cached, &mut uncached] {
        generator.insert_element(ElementId(0), ground());
        generator.insert_element(
            ElementId(1),
            cuboid(Vec3::new(4.0, -8.0, 0.5), Vec3::new(0.5, 1.5, 0.5)),
        );
        generator.ensure_build_completion();
    }

    assert!(cached
        .elements()
        .get(ElementId(0))
        .and_then(|element| element.voxel_cache())
        .is_some_and(|cache| cache.tile_count() > 0));
    assert_summaries_match(&layer_summary(&cached), &layer_summary(&uncached));

    // Moving the bottom of the bounds shifts where heights are measured from.
    for generator in [&mut cached, &mut uncached] {
        generator.set_inclusion_bounds(vec![BoundingBox::new(
            Vec3::new(0.5, -11.5, -5.0),
            Vec3::new(11.5, -0.5, 10.0),
        )]);
        generator.ensure_build_completion();
    }

    let summary = layer_summary(&cached);
    assert!(summary.first().is_some_and(|(_, min, _)| min.abs() < 0.3), "{summary:?}");
    assert_summaries_match(&summary, &layer_summary(&uncached));
}

#[test]
fn cancelled_build_regenerates_compressed_layers() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());
    generator.ensure_build_completion();
    assert_eq!(generator.stats().compressed_layer_builds, 1);

    generator.cancel_build();
    assert!(generator.compressed_layers(IVec2::ZERO).is_none());

    let water = NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![
        AreaModifier::cuboid(Vec3::new(6.0, -6.0, 0.0), Vec3::new(2.0, 2.0, 1.0), WATER),
    ]));
    generator.insert_element(ElementId(1), water);
    assert!(!generator.pending_tiles()[0].rebuild_geometry);
    generator.ensure_build_completion();

    assert_eq!(generator.stats().compressed_layer_builds, 2);
    assert_eq!(generator.stats().failed_builds, 0);
    assert_eq!(area_at(&generator, Vec3::new(6.0, -6.0, 0.0), 1.0), Some(Area(5)));
    assert_eq!(area_at(&generator, Vec3::new(2.0, -2.0, 0.0), 1.0), Some(Area::WALKABLE));
}

#[test]
fn dirtying_a_running_tile_discards_its_build() {
    let mut generator = generator(&settings(0.5));
    generator.insert_element(ElementId(0), ground());

    generator.process_tile_tasks(usize::MAX);
    let in_flight = generator.running_tiles().any(|coord| coord == IVec2::ZERO);
    let before = generator.stats();

    let water = NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![
        AreaModifier::cuboid(Vec3::new(6.0, -6.0, 0.0), Vec3::new(2.0, 2.0, 1.0), WATER),
    ]));
    generator.insert_element(ElementId(1), water);

    if in_flight {
        // The queued build also redoes what the running one was started for.
        let pending = generator
            .pending_tiles()
            .iter()
            .find(|tile| tile.coord == IVec2::ZERO)
            .expect("tile is queued again");
        assert!(pending.rebuild_geometry);
    }

    generator.ensure_build_completion();
    let after = generator.stats();

    if in_flight {
        assert_eq!(after.discarded_builds, before.discarded_builds + 1);
        // Only the queued build was merged.
        assert_eq!(after.compressed_layer_builds, before.compressed_layer_builds + 1);
    }
    assert_eq!(layers_at(&generator, IVec2::ZERO).len(), 1);
    assert_eq!(area_at(&generator, Vec3::new(6.0, -6.0, 0.0), 1.0), Some(Area(5)));
}
