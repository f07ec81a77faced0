use std::time::Duration;

use bevy::prelude::*;
use oxidized_navmesh_generator::{
    colliders::ParryCollider, generator::NavMeshGenerator, settings::NavMeshSettings, tiles::NavMesh,
    NavMeshAffector, NavMeshBoundsVolume, NavMeshGeneratorPlugin, NavMeshTilesUpdated,
};
use parry3d::shape::SharedShape;

const TIMEOUT_DURATION: Duration = Duration::new(15, 0);
const SLEEP_DURATION: Duration = Duration::from_millis(2);

#[derive(Resource, Default)]
struct UpdatedTiles(usize);

fn setup_world_system(mut commands: Commands) {
    commands.spawn((
        Transform::IDENTITY,
        NavMeshBoundsVolume {
            half_extents: Vec3::new(8.0, 8.0, 4.0),
        },
    ));

    // Ground
    commands.spawn((
        Transform::from_xyz(0.0, 0.0, -0.1),
        ParryCollider::new(SharedShape::cuboid(6.0, 6.0, 0.1)),
        NavMeshAffector,
    ));

    // Cube
    commands.spawn((
        Transform::from_xyz(-3.0, 2.0, 1.0),
        ParryCollider::new(SharedShape::cuboid(1.0, 1.0, 1.0)),
        NavMeshAffector,
    ));
}

fn count_updated_tiles_system(mut events: EventReader<NavMeshTilesUpdated>, mut updated: ResMut<UpdatedTiles>) {
    for event in events.read() {
        updated.0 += event.0.len();
    }
}

fn setup_app(app: &mut App) {
    app.add_plugins((
        MinimalPlugins,
        TransformPlugin,
        NavMeshGeneratorPlugin::<ParryCollider>::new(
            NavMeshSettings::from_agent(0.5, 2.0).with_cell_size(0.25, 0.1),
        ),
    ))
    .init_resource::<UpdatedTiles>()
    .add_systems(Startup, setup_world_system)
    .add_systems(PostUpdate, count_updated_tiles_system);
}

fn wait_for_generation_to_finish(app: &mut App) {
    // Let transforms propagate before checking.
    for _ in 0..3 {
        app.update();
    }

    loop {
        app.update();

        if !app.world().resource::<NavMeshGenerator>().is_build_in_progress(true) {
            break;
        } else if app.world().resource::<Time>().elapsed() >= TIMEOUT_DURATION {
            panic!("Generation timed out.");
        }

        std::thread::sleep(SLEEP_DURATION);
    }
}

fn tile_count(app: &App) -> usize {
    let nav_mesh = app.world().resource::<NavMesh>().get();
    let nav_mesh = nav_mesh.read().expect("Failed to get nav-mesh lock.");

    nav_mesh.tile_count()
}

#[test]
fn test_affectors_generate_tiles() {
    let mut app = App::new();
    setup_app(&mut app);

    wait_for_generation_to_finish(&mut app);

    assert!(tile_count(&app) > 0);
    assert!(app.world().resource::<UpdatedTiles>().0 > 0);
    assert_eq!(app.world().resource::<NavMeshGenerator>().elements().len(), 2);
    assert_eq!(app.world().resource::<NavMeshGenerator>().stats().failed_builds, 0);
}

#[test]
fn test_despawned_affectors_remove_tiles() {
    let mut app = App::new();
    setup_app(&mut app);

    wait_for_generation_to_finish(&mut app);
    assert!(tile_count(&app) > 0);

    let affectors: Vec<Entity> = app
        .world_mut()
        .query_filtered::<Entity, With<NavMeshAffector>>()
        .iter(app.world())
        .collect();
    for entity in affectors {
        app.world_mut().despawn(entity);
    }

    wait_for_generation_to_finish(&mut app);

    assert_eq!(tile_count(&app), 0);
    assert!(app.world().resource::<NavMeshGenerator>().elements().is_empty());
}
