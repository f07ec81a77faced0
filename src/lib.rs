//! Incremental, layered **Runtime** Nav-mesh Generation for 3D worlds in [Bevy].
//!
//! The world is split into square tiles. Each tile is voxelized into a heightfield which is split into walkable layers,
//! these are compressed & kept around so that changing area modifiers only needs to decompress & re-mesh the layers
//! they touch. Tiles are built **asynchronously** & merged into a tiled nav-mesh ([tiles::TiledNavMesh]).
//!
//! ## Quick-start:
//! 1. Pick the collider component you're going to use. [colliders::ParryCollider] works without any physics engine,
//!    for anything else implement [colliders::OxidizedCollider] for a component wrapping a `parry3d::shape::SharedShape`.
//! 2. Add ``NavMeshGeneratorPlugin`` as a plugin. (eg. `NavMeshGeneratorPlugin::<ParryCollider>::new(NavMeshSettings::from_agent(0.5, 2.0))`)
//! 3. Spawn at least one entity with a [NavMeshBoundsVolume]. Only tiles inside a bounds volume are built.
//! 4. Attach a [NavMeshAffector] component and a collider to any entity you want to affect the nav-mesh.
//!    [NavMeshAreaModifiers] & [NavMeshLinks] can be added to the same entities.
//!
//! *At this point tiles will be rebuilt whenever the collider, modifiers or ``GlobalTransform`` of an affector changes.
//! A [NavMeshTilesUpdated] event is sent whenever tiles are merged into the nav-mesh.*
//!
//! The generator can also be driven without Bevy's schedule, see [generator::NavMeshGenerator].
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::marker::PhantomData;

use bevy::{
    math::{IVec4, UVec4},
    prelude::*,
};

use colliders::OxidizedCollider;
use conversion::export_typed_shape;
use coords::BoundingBox;
use element::{ElementId, NavigationElement};
use generator::NavMeshGenerator;
use geometry_export::GeometryExport;
use modifiers::{AreaModifier, AreaModifierElement};
use offmesh::LinkModifier;
use settings::NavMeshSettings;
use tiles::TileRef;

mod blob;
pub mod colliders;
pub mod compression;
mod contour;
pub mod conversion;
pub mod coords;
pub mod debug_export;
mod detail_mesh;
pub mod element;
pub mod error;
pub mod generator;
pub mod geometry_export;
mod heightfields;
mod layers;
mod mesher;
pub mod modifiers;
pub mod offmesh;
mod regions;
pub mod settings;
pub mod tile_blob;
pub mod tile_generator;
pub mod tiles;
pub mod voxel_cache;

/// System sets containing the crate's systems.
#[derive(SystemSet, Debug, PartialEq, Eq, Hash, Clone)]
pub enum NavMeshGeneration {
    /// Syncs affectors, bounds volumes & seeds into the generator.
    /// Removals are handled here too so they're caught even if the build is throttled.
    Sync,
    /// Starts tile builds & merges finished ones.
    Build,
}

pub struct NavMeshGeneratorPlugin<ColliderComponent> {
    pub settings: NavMeshSettings,
    _collider_type: PhantomData<ColliderComponent>,
}

impl<C> NavMeshGeneratorPlugin<C>
where
    C: OxidizedCollider,
{
    #[must_use]
    pub fn new(settings: NavMeshSettings) -> NavMeshGeneratorPlugin<C> {
        NavMeshGeneratorPlugin::<C> {
            settings,
            _collider_type: PhantomData::<C>,
        }
    }
}

impl<C> Plugin for NavMeshGeneratorPlugin<C>
where
    C: OxidizedCollider,
{
    fn build(&self, app: &mut App) {
        let generator = match NavMeshGenerator::new(&self.settings) {
            Ok(generator) => generator,
            Err(error) => {
                error!("Nav-mesh generation disabled: {error}");
                return;
            }
        };

        app.insert_resource(self.settings.clone())
            .insert_resource(generator.nav_mesh())
            .insert_resource(generator);

        app.add_event::<NavMeshTilesUpdated>();

        app.configure_sets(
            Update,
            (NavMeshGeneration::Sync, NavMeshGeneration::Build).chain(),
        );

        app.add_systems(
            Update,
            (
                handle_removed_affectors_system,
                update_navigation_elements_system::<C>,
                update_navigation_bounds_system,
                update_seed_locations_system,
            )
                .chain()
                .in_set(NavMeshGeneration::Sync),
        );

        app.add_systems(
            Update,
            tick_generator_system.in_set(NavMeshGeneration::Build),
        );

        app.register_type::<NavMeshAffector>()
            .register_type::<NavMeshBoundsVolume>()
            .register_type::<NavMeshSeed>()
            .register_type::<NavMeshWalkableSlope>();
    }
}

/// Component for entities that should affect the nav-mesh.
#[derive(Component, Reflect, Default)]
#[reflect(Component)]
pub struct NavMeshAffector;

/// Area modifiers of an affector, relative to its ``GlobalTransform``.
#[derive(Component, Clone, Default)]
pub struct NavMeshAreaModifiers(pub Vec<AreaModifier>);

/// Off-mesh links of an affector. Link positions are relative to its ``GlobalTransform``.
#[derive(Component, Clone, Default)]
pub struct NavMeshLinks(pub LinkModifier);

/// Overrides the maximum walkable slope (degrees) of an affector's geometry.
#[derive(Component, Reflect, Clone, Copy)]
#[reflect(Component)]
pub struct NavMeshWalkableSlope(pub f32);

/// Box in which tiles are built, centered on the entity's ``GlobalTransform``.
#[derive(Component, Reflect, Clone, Copy)]
#[reflect(Component)]
pub struct NavMeshBoundsVolume {
    pub half_extents: Vec3,
}

/// Tiles nearest to entities with this component are built first.
#[derive(Component, Reflect, Default)]
#[reflect(Component)]
pub struct NavMeshSeed;

/// Sent when finished tile builds have been merged into the nav-mesh.
#[derive(Event, Debug, Clone)]
pub struct NavMeshTilesUpdated(pub Vec<TileRef>);

/// Area id of a walkable surface. Polygons with [Area::NULL] are removed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Reflect)]
pub struct Area(pub u8);

pub const MAX_AREAS: usize = 64;

impl Area {
    pub const NULL: Area = Area(0);
    /// Walkable area too low for the agent to stand upright.
    pub const LOW_HEIGHT: Area = Area(62);
    pub const WALKABLE: Area = Area(63);
}

type ChangedAffector<C> = Or<(
    Changed<GlobalTransform>,
    Changed<<C as OxidizedCollider>::Component>,
    Changed<NavMeshAffector>,
    Changed<NavMeshAreaModifiers>,
    Changed<NavMeshLinks>,
    Changed<NavMeshWalkableSlope>,
)>;

fn update_navigation_elements_system<C: OxidizedCollider>(
    mut generator: ResMut<NavMeshGenerator>,
    query: Query<
        (
            Entity,
            &GlobalTransform,
            Option<&C::Component>,
            Option<&NavMeshAreaModifiers>,
            Option<&NavMeshLinks>,
            Option<&NavMeshWalkableSlope>,
        ),
        (With<NavMeshAffector>, ChangedAffector<C>),
    >,
) {
    for (entity, global_transform, collider, area_modifiers, links, walkable_slope) in query.iter() {
        #[cfg(feature = "trace")]
        let _span = info_span!("Export navigation element").entered();

        let transform = global_transform.compute_transform();

        let mut element = match collider {
            Some(collider) => {
                let mut export = GeometryExport::new();
                if let Some(walkable_slope) = walkable_slope {
                    export = export.with_slope_override(walkable_slope.0);
                }
                export_typed_shape(&mut export, C::oxidized_into_typed_shape(collider), &transform);

                NavigationElement::from_geometry(export.finish())
            }
            None => NavigationElement::default(),
        };

        if let Some(area_modifiers) = area_modifiers.filter(|modifiers| !modifiers.0.is_empty()) {
            element = element.with_area_modifiers(AreaModifierElement {
                areas: area_modifiers.0.clone(),
                instance_transforms: vec![transform],
            });
        }
        if let Some(links) = links {
            element = element.with_links(LinkModifier {
                local_to_world: transform,
                ..links.0.clone()
            });
        }

        generator.insert_element(ElementId::from(entity), element);
    }
}

fn handle_removed_affectors_system(
    mut removed_affectors: RemovedComponents<NavMeshAffector>,
    mut generator: ResMut<NavMeshGenerator>,
) {
    for removed in removed_affectors.read() {
        generator.remove_element(ElementId::from(removed));
    }
}

fn update_navigation_bounds_system(
    mut generator: ResMut<NavMeshGenerator>,
    mut removed_volumes: RemovedComponents<NavMeshBoundsVolume>,
    volumes: Query<(Ref<NavMeshBoundsVolume>, Ref<GlobalTransform>)>,
) {
    let removed = removed_volumes.read().count() > 0;
    let changed = volumes
        .iter()
        .any(|(volume, transform)| volume.is_changed() || transform.is_changed());
    if !removed && !changed {
        return;
    }

    let bounds = volumes
        .iter()
        .map(|(volume, transform)| {
            BoundingBox::from_center_half_extents(Vec3::ZERO, volume.half_extents)
                .transformed(&transform.compute_transform())
        })
        .collect();

    generator.set_inclusion_bounds(bounds);
}

fn update_seed_locations_system(
    mut generator: ResMut<NavMeshGenerator>,
    mut removed_seeds: RemovedComponents<NavMeshSeed>,
    seeds: Query<Ref<GlobalTransform>, With<NavMeshSeed>>,
) {
    let removed = removed_seeds.read().count() > 0;
    if !removed && !seeds.iter().any(|transform| transform.is_changed()) {
        return;
    }

    generator.set_seed_locations(seeds.iter().map(|transform| transform.translation()).collect());
}

fn tick_generator_system(
    mut generator: ResMut<NavMeshGenerator>,
    mut tiles_updated: EventWriter<NavMeshTilesUpdated>,
) {
    if !generator.is_build_in_progress(true) {
        return;
    }

    let updated = generator.tick_async_build();
    if !updated.is_empty() {
        tiles_updated.write(NavMeshTilesUpdated(updated));
    }
}

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

fn get_neighbour_index(width: usize, index: usize, dir: usize) -> usize {
    debug_assert!(dir < 4, "Not a valid direction: {dir}");

    match dir & 0b11 {
        0 => index - 1,
        1 => index + width,
        2 => index + 1,
        _ => index - width,
    }
}

fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    if a.x != b.x {
        return (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x);
    }

    (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
}

/// Segments ``a-b`` & ``c-d`` intersect, touching included.
fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

fn area_sqr(a: IVec4, b: IVec4, c: IVec4) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) == 0
}

fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) < 0
}
fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) <= 0
}

/// ``point`` lies inside the cone formed by vertex ``i`` of ``outline_vertices`` & its two neighbours.
fn in_cone(i: usize, outline_vertices: &[UVec4], point: UVec4) -> bool {
    let point_i = outline_vertices[i].as_ivec4();
    let point_next = outline_vertices[(i + 1) % outline_vertices.len()].as_ivec4();
    let point_previous =
        outline_vertices[(outline_vertices.len() + i - 1) % outline_vertices.len()].as_ivec4();
    let point = point.as_ivec4();

    // Convex corner.
    if left_on(point_previous, point_i, point_next) {
        return left(point_i, point, point_previous) && left(point, point_i, point_next);
    }

    !(left_on(point_i, point, point_next) && left_on(point, point_i, point_previous))
}
