//! Dumps the navigation input of a generator as an OBJ file that can be loaded into RecastDemo.

use std::io::{self, Write};

use bevy::math::{Vec2, Vec3};

use crate::{
    coords::{recast_to_world, world_to_recast},
    generator::NavMeshGenerator,
    modifiers::{grow_convex_hull, ModifierShape},
};

struct ConvexVolume {
    area: u8,
    points: Vec<Vec3>,
    min_z: f32,
    max_z: f32,
}

/// Writes every element's geometry, convex area modifiers & the build configuration to ``writer``.
///
/// Vertices are written in generation space as ``v x y z``, triangles as 1-based ``f a b c``.
pub fn export_navigation_geometry(generator: &NavMeshGenerator, writer: &mut impl Write) -> io::Result<()> {
    let config = generator.config();

    let mut vertices: Vec<Vec3> = Vec::new();
    let mut triangles: Vec<[usize; 3]> = Vec::new();
    let mut volumes = Vec::new();

    for (_, element) in generator.elements().iter() {
        if let Some(geometry) = &element.geometry {
            let instances: Vec<Option<_>> = if element.instance_transforms.is_empty() {
                vec![None]
            } else {
                element.instance_transforms.iter().map(Some).collect()
            };

            for instance in instances {
                let base = vertices.len();
                vertices.extend((0..geometry.vertex_count()).map(|i| {
                    let vertex = geometry.vertex(i);
                    match instance {
                        Some(transform) => world_to_recast(transform.transform_point(recast_to_world(vertex))),
                        None => vertex,
                    }
                }));
                triangles.extend(geometry.indices().chunks_exact(3).map(|triangle| {
                    [
                        base + triangle[0] as usize,
                        base + triangle[1] as usize,
                        base + triangle[2] as usize,
                    ]
                }));
            }
        }

        let Some(modifiers) = &element.area_modifiers else {
            continue;
        };
        for modifier in modifiers.areas.iter() {
            let ModifierShape::Convex { points, min_z, max_z } = &modifier.shape else {
                continue;
            };
            let Some(area) = config.resolve_area_class(modifier.area_class) else {
                continue;
            };

            let mut instances = modifiers.instance_transforms.iter().map(Some).collect::<Vec<_>>();
            if instances.is_empty() {
                instances.push(None);
            }
            for instance in instances {
                let (points, min_z, max_z) = match instance {
                    Some(transform) => {
                        let moved: Vec<Vec2> = points
                            .iter()
                            .map(|point| transform.transform_point(point.extend(*min_z)).truncate())
                            .collect();

                        (moved, min_z + transform.translation.z, max_z + transform.translation.z)
                    }
                    None => (points.clone(), *min_z, *max_z),
                };

                let grown = grow_convex_hull(&points, config.agent_radius);
                if grown.is_empty() {
                    continue;
                }
                volumes.push(ConvexVolume {
                    area: area.0,
                    points: grown.iter().map(|point| world_to_recast(point.extend(min_z))).collect(),
                    min_z: min_z - config.cell_height,
                    max_z: max_z + config.cell_height,
                });
            }
        }
    }

    for vertex in vertices.iter() {
        writeln!(writer, "v {:.6} {:.6} {:.6}", vertex.x, vertex.y, vertex.z)?;
    }
    for triangle in triangles.iter() {
        writeln!(writer, "f {} {} {}", triangle[0] + 1, triangle[1] + 1, triangle[2] + 1)?;
    }

    if !volumes.is_empty() {
        writeln!(writer, "# Area export")?;
        for volume in volumes.iter() {
            writeln!(
                writer,
                "\nAE {} {} {:.6} {:.6}",
                volume.area,
                volume.points.len(),
                volume.min_z,
                volume.max_z
            )?;
            for point in volume.points.iter() {
                writeln!(writer, "Av {:.6} {:.6} {:.6}", point.x, point.y, point.z)?;
            }
        }
        writeln!(writer)?;
    }

    let bounds = generator.total_bounds().to_recast();
    writeln!(writer, "# RecastDemo specific data")?;
    writeln!(
        writer,
        "rd_bbox {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
        bounds.min.x, bounds.min.y, bounds.min.z, bounds.max.x, bounds.max.y, bounds.max.z
    )?;
    writeln!(writer, "# AgentHeight\nrd_agh {:.5}", config.agent_height)?;
    writeln!(writer, "# AgentRadius\nrd_agr {:.5}", config.agent_radius)?;
    writeln!(writer, "# Cell Size\nrd_cs {:.5}", config.cell_size)?;
    writeln!(writer, "# Cell Height\nrd_ch {:.5}", config.cell_height)?;
    writeln!(writer, "# Agent max climb\nrd_amc {}", config.agent_max_climb as i32)?;
    writeln!(writer, "# Agent max slope\nrd_ams {:.5}", config.walkable_slope_angle)?;
    writeln!(
        writer,
        "# Region min size\nrd_rmis {}",
        (config.min_region_area as f32).sqrt() as u32
    )?;
    writeln!(
        writer,
        "# Region merge size\nrd_rmas {}",
        (config.merge_region_area as f32).sqrt() as u32
    )?;
    writeln!(writer, "# Max edge len\nrd_mel {}", config.max_edge_len)?;
    writeln!(
        writer,
        "# Perform Voxel Filtering\nrd_pvf {}",
        u8::from(config.perform_voxel_filtering)
    )?;
    writeln!(
        writer,
        "# Generate Detailed Mesh\nrd_gdm {}",
        u8::from(config.generate_detailed_mesh)
    )?;
    writeln!(writer, "# MaxPolysPerTile\nrd_mppt {}", config.max_polys_per_tile)?;
    writeln!(writer, "# maxVertsPerPoly\nrd_mvpp {}", config.max_verts_per_poly)?;
    writeln!(writer, "# Tile size\nrd_ts {}", config.tile_size)?;
    writeln!(writer)
}

#[cfg(test)]
mod tests {
    use bevy::{math::Vec2, transform::components::Transform};

    use super::*;
    use crate::{
        element::{ElementId, NavigationElement},
        geometry_export::{CollisionShape, GeometryExport},
        modifiers::{AreaModifier, AreaModifierElement},
        settings::{AreaClass, NavMeshSettings},
    };

    fn exported(generator: &NavMeshGenerator) -> String {
        let mut buffer = Vec::new();
        export_navigation_geometry(generator, &mut buffer).expect("writing to a vec can't fail");

        String::from_utf8(buffer).expect("export is utf-8")
    }

    #[test]
    fn geometry_is_written_with_one_based_faces() {
        let mut generator = NavMeshGenerator::new(&NavMeshSettings::from_agent(0.5, 2.0)).expect("valid settings");

        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::TriangleMesh {
                vertices: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                triangles: vec![[0, 1, 2]],
            },
            &Transform::IDENTITY,
        );
        generator.insert_element(ElementId(1), NavigationElement::from_geometry(export.finish()));

        let text = exported(&generator);
        assert_eq!(text.lines().filter(|line| line.starts_with("v ")).count(), 3);
        assert!(text.lines().any(|line| line == "f 1 2 3"));
        // World +Y is generation -Z.
        assert!(text.lines().any(|line| line == "v 0.000000 0.000000 -1.000000"));
        assert!(!text.contains("# Area export"));

        for key in [
            "rd_bbox", "rd_agh", "rd_agr", "rd_cs", "rd_ch", "rd_amc", "rd_ams", "rd_rmis", "rd_rmas", "rd_mel",
            "rd_pvf", "rd_gdm", "rd_mppt", "rd_mvpp", "rd_ts",
        ] {
            assert!(
                text.lines().any(|line| line.starts_with(&format!("{key} "))),
                "missing {key}"
            );
        }
        assert!(text.contains("rd_agr 0.50000"));
    }

    #[test]
    fn convex_modifiers_are_exported_as_area_volumes() {
        let mut generator = NavMeshGenerator::new(&NavMeshSettings::from_agent(0.5, 2.0)).expect("valid settings");

        let square = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(2.0, 0.0),
            Vec2::new(2.0, 2.0),
            Vec2::new(0.0, 2.0),
        ];
        let element = NavigationElement::default().with_area_modifiers(AreaModifierElement::new(vec![
            AreaModifier::convex(square, 0.0, 1.0, AreaClass::NULL),
            // Only convex volumes are exported.
            AreaModifier::cuboid(Vec3::ZERO, Vec3::ONE, AreaClass::NULL),
        ]));
        generator.insert_element(ElementId(7), element);

        let text = exported(&generator);
        assert!(text.contains("# Area export"));

        let header = text
            .lines()
            .find(|line| line.starts_with("AE "))
            .expect("area volume exported");
        let fields: Vec<&str> = header.split_whitespace().collect();
        assert_eq!(fields[1], "0");
        let point_count: usize = fields[2].parse().expect("point count");
        assert!(point_count >= 4);
        assert_eq!(text.lines().filter(|line| line.starts_with("Av ")).count(), point_count);
        assert_eq!(text.lines().filter(|line| line.starts_with("AE ")).count(), 1);
    }
}
