//! Conversion of parry3d shapes into [CollisionShape]s.

use bevy::{
    log::warn,
    math::{Quat, Vec3},
    transform::components::Transform,
};
use parry3d::{
    math::{Isometry, Real},
    na::Point3,
    shape::TypedShape,
};

use crate::geometry_export::{CollisionShape, GeometryExport};

const SUBDIVISIONS: u32 = 16;

fn to_vec3(point: &Point3<Real>) -> Vec3 {
    Vec3::new(point.x, point.y, point.z)
}

fn to_transform(isometry: &Isometry<Real>) -> Transform {
    Transform {
        translation: Vec3::from(isometry.translation.vector),
        rotation: Quat::from(isometry.rotation),
        scale: Vec3::ONE,
    }
}

fn triangle_mesh(vertices: &[Point3<Real>], triangles: &[[u32; 3]]) -> CollisionShape {
    CollisionShape::TriangleMesh {
        vertices: vertices.iter().map(to_vec3).collect(),
        triangles: triangles.to_vec(),
    }
}

/// Converts a parry3d shape into collision shapes, each with its transform relative to the shape.
///
/// Rounded shapes use their inner shape. Shapes without any area (half spaces, polylines & segments) produce nothing.
pub fn convert_typed_shape(shape: TypedShape) -> Vec<(Transform, CollisionShape)> {
    let mut shapes = Vec::new();
    convert_typed_shape_into(shape, Transform::IDENTITY, &mut shapes);

    shapes
}

fn convert_typed_shape_into(shape: TypedShape, local: Transform, shapes: &mut Vec<(Transform, CollisionShape)>) {
    let converted = match shape {
        TypedShape::Ball(ball) => CollisionShape::Sphere { radius: ball.radius },
        TypedShape::Cuboid(cuboid) => CollisionShape::Box {
            half_extents: Vec3::from(cuboid.half_extents),
        },
        TypedShape::RoundCuboid(round_cuboid) => CollisionShape::Box {
            half_extents: Vec3::from(round_cuboid.inner_shape.half_extents),
        },
        TypedShape::Capsule(capsule) => {
            let a = to_vec3(&capsule.segment.a);
            let b = to_vec3(&capsule.segment.b);
            let axis = b - a;

            // Capsules are exported along Z, rotate onto the segment.
            let rotation = if axis.length_squared() > f32::EPSILON {
                Quat::from_rotation_arc(Vec3::Z, axis.normalize())
            } else {
                Quat::IDENTITY
            };
            let offset = Transform::from_translation((a + b) * 0.5).with_rotation(rotation);

            shapes.push((
                local * offset,
                CollisionShape::Capsule {
                    radius: capsule.radius,
                    half_length: axis.length() * 0.5,
                },
            ));
            return;
        }
        TypedShape::TriMesh(trimesh) => triangle_mesh(trimesh.vertices(), trimesh.indices()),
        TypedShape::HeightField(heightfield) => CollisionShape::VertexSoup(
            heightfield
                .triangles()
                .flat_map(|triangle| [to_vec3(&triangle.a), to_vec3(&triangle.b), to_vec3(&triangle.c)])
                .collect(),
        ),
        TypedShape::ConvexPolyhedron(polyhedron) => {
            let (vertices, triangles) = polyhedron.to_trimesh();
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::RoundConvexPolyhedron(round_polyhedron) => {
            let (vertices, triangles) = round_polyhedron.inner_shape.to_trimesh();
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::Cylinder(cylinder) => {
            let (vertices, triangles) = cylinder.to_trimesh(SUBDIVISIONS);
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::RoundCylinder(round_cylinder) => {
            let (vertices, triangles) = round_cylinder.inner_shape.to_trimesh(SUBDIVISIONS);
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::Cone(cone) => {
            let (vertices, triangles) = cone.to_trimesh(SUBDIVISIONS);
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::RoundCone(round_cone) => {
            let (vertices, triangles) = round_cone.inner_shape.to_trimesh(SUBDIVISIONS);
            triangle_mesh(&vertices, &triangles)
        }
        TypedShape::Triangle(triangle) => CollisionShape::VertexSoup(vec![
            to_vec3(&triangle.a),
            to_vec3(&triangle.b),
            to_vec3(&triangle.c),
        ]),
        TypedShape::RoundTriangle(round_triangle) => {
            let triangle = &round_triangle.inner_shape;
            CollisionShape::VertexSoup(vec![to_vec3(&triangle.a), to_vec3(&triangle.b), to_vec3(&triangle.c)])
        }
        TypedShape::Compound(compound) => {
            for (isometry, shape) in compound.shapes() {
                convert_typed_shape_into(shape.as_typed_shape(), local * to_transform(isometry), shapes);
            }
            return;
        }
        // No area to walk on.
        TypedShape::HalfSpace(_) | TypedShape::Polyline(_) | TypedShape::Segment(_) => return,
        TypedShape::Custom(_) => {
            warn!("Custom shapes are not supported for nav-mesh generation, skipping.");
            return;
        }
    };

    shapes.push((local, converted));
}

/// Converts a parry3d shape & appends it to ``export``.
pub fn export_typed_shape(export: &mut GeometryExport, shape: TypedShape, local_to_world: &Transform) {
    for (local, collision_shape) in convert_typed_shape(shape) {
        export.add_shape(&collision_shape, &(*local_to_world * local));
    }
}

#[cfg(test)]
mod tests {
    use parry3d::shape::SharedShape;

    use super::*;

    #[test]
    fn primitives_map_onto_exported_shapes() {
        let ball = SharedShape::ball(2.0);
        let shapes = convert_typed_shape(ball.as_typed_shape());
        assert_eq!(shapes.len(), 1);
        assert!(matches!(shapes[0].1, CollisionShape::Sphere { radius } if radius == 2.0));

        let cuboid = SharedShape::cuboid(1.0, 2.0, 3.0);
        let shapes = convert_typed_shape(cuboid.as_typed_shape());
        assert!(
            matches!(shapes[0].1, CollisionShape::Box { half_extents } if half_extents == Vec3::new(1.0, 2.0, 3.0))
        );

        let segment = SharedShape::segment(Point3::origin(), Point3::new(1.0, 0.0, 0.0));
        assert!(convert_typed_shape(segment.as_typed_shape()).is_empty());
    }

    #[test]
    fn capsules_are_rotated_onto_their_segment() {
        let capsule = SharedShape::capsule_y(1.5, 0.5);
        let shapes = convert_typed_shape(capsule.as_typed_shape());

        let (transform, shape) = &shapes[0];
        assert!(matches!(shape, CollisionShape::Capsule { radius, half_length } if *radius == 0.5 && (*half_length - 1.5).abs() < 1e-5));
        let axis = transform.rotation * Vec3::Z;
        assert!((axis - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn compounds_keep_child_offsets() {
        let compound = SharedShape::compound(vec![
            (Isometry::translation(5.0, 0.0, 0.0), SharedShape::ball(1.0)),
            (Isometry::identity(), SharedShape::cuboid(1.0, 1.0, 1.0)),
        ]);

        let shapes = convert_typed_shape(compound.as_typed_shape());
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].0.translation, Vec3::new(5.0, 0.0, 0.0));

        let mut export = GeometryExport::new();
        export_typed_shape(&mut export, compound.as_typed_shape(), &Transform::from_xyz(0.0, 0.0, 10.0));
        let bounds = export.bounds();
        assert!(bounds.max.x <= 6.0 + 1e-4 && bounds.max.x > 5.5);
        assert!((bounds.min.z - 9.0).abs() < 1e-4);
    }
}
