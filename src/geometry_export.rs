//! Turns collision shapes into flat triangle buffers in generation space.

use std::f32::consts::PI;

use bevy::{
    math::{Quat, Vec3},
    transform::components::Transform,
};
use smallvec::SmallVec;

use crate::{
    blob::{BlobReader, BlobWriter},
    coords::{world_to_recast, BoundingBox},
    error::BlobError,
};

const CAPSULE_SIDES: usize = 16;
const CAPSULE_RINGS: usize = 9;

/// Every shape kind that can contribute geometry to the nav-mesh.
///
/// Shapes are described in their local space. Capsules are aligned with the local Z axis.
#[derive(Clone, Debug)]
pub enum CollisionShape {
    TriangleMesh {
        vertices: Vec<Vec3>,
        triangles: Vec<[u32; 3]>,
    },
    /// Faces are polygons given as indices into ``vertices`` and are fan triangulated.
    ConvexHull {
        vertices: Vec<Vec3>,
        faces: Vec<SmallVec<[u32; 8]>>,
    },
    Box {
        half_extents: Vec3,
    },
    Capsule {
        radius: f32,
        half_length: f32,
    },
    Sphere {
        radius: f32,
    },
    /// Flat index list, three indices per triangle.
    CustomMesh {
        vertices: Vec<Vec3>,
        indices: Vec<u32>,
    },
    /// Grid of ``rows * columns`` heights. Sample ``(row, column)`` sits at ``(column * scale.x, row * scale.y, height * scale.z)``.
    HeightField {
        heights: Vec<f32>,
        rows: usize,
        columns: usize,
        scale: Vec3,
        /// One entry per quad, ``(rows - 1) * (columns - 1)``. Missing entries count as solid.
        holes: Vec<bool>,
        /// Splits quads along the other diagonal.
        mirrored: bool,
    },
    /// Every three vertices form a triangle.
    VertexSoup(Vec<Vec3>),
}

/// Accumulates the geometry of one element. Vertices are kept in world space until [GeometryExport::finish].
#[derive(Default)]
pub struct GeometryExport {
    vertices: Vec<Vec3>,
    indices: Vec<i32>,
    bounds: BoundingBox,
    slope_override: Option<f32>,
}

impl GeometryExport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the walkable slope (degrees) for every triangle of this element.
    pub fn with_slope_override(mut self, degrees: f32) -> Self {
        self.slope_override = Some(degrees);

        self
    }

    /// World space bounds of everything exported so far.
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Appends a shape transformed by ``local_to_world``. Degenerate shapes are ignored.
    pub fn add_shape(&mut self, shape: &CollisionShape, local_to_world: &Transform) {
        let flip = local_to_world.scale.x * local_to_world.scale.y * local_to_world.scale.z < 0.0;

        match shape {
            CollisionShape::TriangleMesh {
                vertices,
                triangles,
            } => {
                if vertices.is_empty() || triangles.is_empty() {
                    return;
                }
                let base = self.push_vertices(vertices, local_to_world);
                for triangle in triangles {
                    self.push_triangle(base, *triangle, flip);
                }
            }
            CollisionShape::ConvexHull { vertices, faces } => {
                if vertices.is_empty() {
                    return;
                }
                let base = self.push_vertices(vertices, local_to_world);
                for face in faces.iter().filter(|face| face.len() >= 3) {
                    for j in 0..face.len() - 2 {
                        self.push_triangle(base, [face[0], face[j + 1], face[j + 2]], flip);
                    }
                }
            }
            CollisionShape::Box { half_extents } => {
                self.export_box(*half_extents, local_to_world, flip);
            }
            CollisionShape::Capsule {
                radius,
                half_length,
            } => {
                let arc = capsule_arc(*radius, *half_length);
                self.export_revolved_arc(&arc, local_to_world, flip);
            }
            CollisionShape::Sphere { radius } => {
                let arc = sphere_arc(*radius);
                self.export_revolved_arc(&arc, local_to_world, flip);
            }
            CollisionShape::CustomMesh { vertices, indices } => {
                if vertices.is_empty() || indices.len() < 3 {
                    return;
                }
                let base = self.push_vertices(vertices, local_to_world);
                for triangle in indices.chunks_exact(3) {
                    self.push_triangle(base, [triangle[0], triangle[1], triangle[2]], flip);
                }
            }
            CollisionShape::HeightField {
                heights,
                rows,
                columns,
                scale,
                holes,
                mirrored,
            } => {
                self.export_heightfield(
                    heights,
                    *rows,
                    *columns,
                    *scale,
                    holes,
                    *mirrored,
                    local_to_world,
                    flip,
                );
            }
            CollisionShape::VertexSoup(vertices) => {
                if vertices.len() < 3 {
                    return;
                }
                let base = self.push_vertices(vertices, local_to_world);
                for i in 0..(vertices.len() / 3) as u32 {
                    self.push_triangle(base, [i * 3, i * 3 + 1, i * 3 + 2], flip);
                }
            }
        }
    }

    fn push_vertices(&mut self, vertices: &[Vec3], local_to_world: &Transform) -> u32 {
        let base = self.vertices.len() as u32;
        self.vertices.reserve(vertices.len());
        for vertex in vertices {
            let world = local_to_world.transform_point(*vertex);
            self.bounds.include_point(world);
            self.vertices.push(world);
        }

        base
    }

    fn push_triangle(&mut self, base: u32, triangle: [u32; 3], flip: bool) {
        let [a, b, c] = triangle;
        let order = if flip { [c, b, a] } else { [a, b, c] };
        self.indices
            .extend(order.iter().map(|index| (base + index) as i32));
    }

    fn export_box(&mut self, half_extents: Vec3, local_to_world: &Transform, flip: bool) {
        // Bit 0 selects +X, bit 1 +Y & bit 2 +Z.
        let corners: [Vec3; 8] = std::array::from_fn(|i| {
            Vec3::new(
                if i & 1 != 0 { half_extents.x } else { -half_extents.x },
                if i & 2 != 0 { half_extents.y } else { -half_extents.y },
                if i & 4 != 0 { half_extents.z } else { -half_extents.z },
            )
        });
        const TRIANGLES: [[u32; 3]; 12] = [
            [0, 4, 6],
            [0, 6, 2],
            [1, 3, 7],
            [1, 7, 5],
            [0, 1, 5],
            [0, 5, 4],
            [2, 6, 7],
            [2, 7, 3],
            [0, 2, 3],
            [0, 3, 1],
            [4, 5, 7],
            [4, 7, 6],
        ];

        let base = self.push_vertices(&corners, local_to_world);
        for triangle in TRIANGLES {
            self.push_triangle(base, triangle, flip);
        }
    }

    /// Revolves an arc in the XZ-plane around the local Z axis.
    fn export_revolved_arc(&mut self, arc: &[Vec3], local_to_world: &Transform, flip: bool) {
        let arc_len = arc.len() as u32;
        let mut vertices = Vec::with_capacity((CAPSULE_SIDES + 1) * arc.len());
        for side in 0..=CAPSULE_SIDES {
            let rotation = Quat::from_rotation_z(side as f32 / CAPSULE_SIDES as f32 * 2.0 * PI);
            vertices.extend(arc.iter().map(|point| rotation * *point));
        }

        let base = self.push_vertices(&vertices, local_to_world);
        for side in 0..CAPSULE_SIDES as u32 {
            let arc_0 = side * arc_len;
            let arc_1 = (side + 1) * arc_len;
            for ring in 0..arc_len - 1 {
                self.push_triangle(base, [arc_0 + ring, arc_0 + ring + 1, arc_1 + ring], flip);
                self.push_triangle(
                    base,
                    [arc_1 + ring, arc_0 + ring + 1, arc_1 + ring + 1],
                    flip,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn export_heightfield(
        &mut self,
        heights: &[f32],
        rows: usize,
        columns: usize,
        scale: Vec3,
        holes: &[bool],
        mirrored: bool,
        local_to_world: &Transform,
        flip: bool,
    ) {
        if rows < 2 || columns < 2 || heights.len() < rows * columns {
            return;
        }

        let mut vertices = Vec::with_capacity(rows * columns);
        for row in 0..rows {
            for column in 0..columns {
                vertices.push(Vec3::new(
                    column as f32 * scale.x,
                    row as f32 * scale.y,
                    heights[row * columns + column] * scale.z,
                ));
            }
        }
        let base = self.push_vertices(&vertices, local_to_world);

        for row in 0..rows - 1 {
            for column in 0..columns - 1 {
                let quad = row * (columns - 1) + column;
                if holes.get(quad).copied().unwrap_or(false) {
                    continue;
                }

                let i00 = (row * columns + column) as u32;
                let i01 = i00 + 1;
                let i10 = i00 + columns as u32;
                let i11 = i10 + 1;

                if mirrored {
                    self.push_triangle(base, [i00, i01, i10], flip);
                    self.push_triangle(base, [i01, i11, i10], flip);
                } else {
                    self.push_triangle(base, [i00, i01, i11], flip);
                    self.push_triangle(base, [i00, i11, i10], flip);
                }
            }
        }
    }

    /// Converts the accumulated buffers into generation space & packs them into a cache.
    pub fn finish(self) -> GeometryCache {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return GeometryCache::default();
        }

        let vertices = self
            .vertices
            .into_iter()
            .flat_map(|vertex| world_to_recast(vertex).to_array())
            .collect();

        GeometryCache {
            vertices,
            indices: self.indices.into_boxed_slice(),
            slope_override: self.slope_override,
        }
    }
}

fn capsule_arc(radius: f32, half_length: f32) -> Vec<Vec3> {
    let quarter = CAPSULE_RINGS / 2;
    (0..=CAPSULE_RINGS)
        .map(|ring| {
            let (angle, offset) = if ring <= quarter {
                (ring as f32 / (CAPSULE_RINGS - 1) as f32 * PI, half_length)
            } else {
                ((ring - 1) as f32 / (CAPSULE_RINGS - 1) as f32 * PI, -half_length)
            };

            Vec3::new(radius * angle.sin(), 0.0, radius * angle.cos() + offset)
        })
        .collect()
}

fn sphere_arc(radius: f32) -> Vec<Vec3> {
    (0..=CAPSULE_RINGS)
        .map(|ring| {
            let angle = ring as f32 / CAPSULE_RINGS as f32 * PI;
            Vec3::new(radius * angle.sin(), 0.0, radius * angle.cos())
        })
        .collect()
}

/// Exported geometry of one element in generation space.
///
/// Serialized as ``{num_faces: u32, num_verts: u32, slope_override: f32}`` followed by the vertex floats and ``i32`` indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeometryCache {
    vertices: Box<[f32]>,
    indices: Box<[i32]>,
    slope_override: Option<f32>,
}

impl GeometryCache {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Flat ``[x, y, z, x, y, z, ...]`` generation space coordinates.
    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn indices(&self) -> &[i32] {
        &self.indices
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn slope_override(&self) -> Option<f32> {
        self.slope_override
    }

    pub fn vertex(&self, index: usize) -> Vec3 {
        Vec3::from_slice(&self.vertices[index * 3..index * 3 + 3])
    }

    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).map(|triangle| {
            [
                self.vertex(triangle[0] as usize),
                self.vertex(triangle[1] as usize),
                self.vertex(triangle[2] as usize),
            ]
        })
    }

    /// Generation space bounds.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points((0..self.vertex_count()).map(|i| self.vertex(i)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer =
            BlobWriter::with_capacity(12 + self.vertices.len() * 4 + self.indices.len() * 4);
        writer.u32(self.triangle_count() as u32);
        writer.u32(self.vertex_count() as u32);
        writer.f32(self.slope_override.unwrap_or(f32::NAN));
        for value in self.vertices.iter() {
            writer.f32(*value);
        }
        for index in self.indices.iter() {
            writer.i32(*index);
        }

        writer.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = BlobReader::new(bytes);
        let num_faces = reader.u32()? as usize;
        let num_verts = reader.u32()? as usize;
        let slope = reader.f32()?;

        let vertices = (0..num_verts * 3)
            .map(|_| reader.f32())
            .collect::<Result<Box<[f32]>, _>>()?;
        let indices = (0..num_faces * 3)
            .map(|_| reader.i32())
            .collect::<Result<Box<[i32]>, _>>()?;

        Ok(Self {
            vertices,
            indices,
            slope_override: (!slope.is_nan()).then_some(slope),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_normals(cache: &GeometryCache) -> Vec<Vec3> {
        cache
            .triangles()
            .map(|[a, b, c]| (b - a).cross(c - a).normalize())
            .collect()
    }

    #[test]
    fn degenerate_shapes_are_ignored() {
        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::TriangleMesh {
                vertices: vec![],
                triangles: vec![],
            },
            &Transform::IDENTITY,
        );
        export.add_shape(&CollisionShape::VertexSoup(vec![Vec3::ZERO]), &Transform::IDENTITY);

        assert_eq!(export.triangle_count(), 0);
        assert!(export.finish().is_empty());
    }

    #[test]
    fn box_faces_point_outwards() {
        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::Box {
                half_extents: Vec3::new(1.0, 2.0, 3.0),
            },
            &Transform::from_xyz(10.0, 0.0, 0.0),
        );

        assert_eq!(export.vertex_count(), 8);
        assert_eq!(export.triangle_count(), 12);

        let bounds = export.bounds();
        assert_eq!(bounds.min, Vec3::new(9.0, -2.0, -3.0));
        assert_eq!(bounds.max, Vec3::new(11.0, 2.0, 3.0));

        let cache = export.finish();
        let center = cache.bounds().center();
        for [a, b, c] in cache.triangles() {
            let normal = (b - a).cross(c - a);
            let face_center = (a + b + c) / 3.0;
            assert!(normal.dot(face_center - center) > 0.0);
        }
        // Two triangles face straight up in generation space.
        let up = triangle_normals(&cache)
            .iter()
            .filter(|normal| normal.y > 0.99)
            .count();
        assert_eq!(up, 2);
    }

    #[test]
    fn negative_scale_flips_winding() {
        let quad = CollisionShape::CustomMesh {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
        };

        let mut regular = GeometryExport::new();
        regular.add_shape(&quad, &Transform::IDENTITY);
        let mut mirrored = GeometryExport::new();
        mirrored.add_shape(&quad, &Transform::from_scale(Vec3::new(-1.0, 1.0, 1.0)));

        let regular = triangle_normals(&regular.finish());
        let mirrored = triangle_normals(&mirrored.finish());
        assert!(regular[0].y > 0.99);
        assert!(mirrored[0].y > 0.99);
    }

    #[test]
    fn capsule_is_tessellated_with_fixed_resolution() {
        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::Capsule {
                radius: 0.5,
                half_length: 1.0,
            },
            &Transform::IDENTITY,
        );

        assert_eq!(export.vertex_count(), (CAPSULE_SIDES + 1) * (CAPSULE_RINGS + 1));
        assert_eq!(export.triangle_count(), CAPSULE_SIDES * CAPSULE_RINGS * 2);
        let bounds = export.bounds();
        assert!((bounds.max.z - 1.5).abs() < 1e-4);
        assert!((bounds.min.z + 1.5).abs() < 1e-4);
        assert!((bounds.max.x - 0.5).abs() < 1e-4);
    }

    #[test]
    fn heightfield_skips_holes() {
        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::HeightField {
                heights: vec![0.0; 9],
                rows: 3,
                columns: 3,
                scale: Vec3::ONE,
                holes: vec![true, false, false, false],
                mirrored: false,
            },
            &Transform::IDENTITY,
        );

        assert_eq!(export.vertex_count(), 9);
        assert_eq!(export.triangle_count(), 6);
        for normal in triangle_normals(&export.finish()) {
            assert!(normal.y > 0.99);
        }
    }

    #[test]
    fn cache_blob_layout() {
        let mut export = GeometryExport::new().with_slope_override(30.0);
        export.add_shape(
            &CollisionShape::VertexSoup(vec![Vec3::ZERO, Vec3::X, Vec3::Y]),
            &Transform::IDENTITY,
        );
        let cache = export.finish();
        let bytes = cache.to_bytes();

        assert_eq!(bytes.len(), 12 + 9 * 4 + 3 * 4);
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 1);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 3);
        assert_eq!(GeometryCache::from_bytes(&bytes), Ok(cache));
        assert_eq!(
            GeometryCache::from_bytes(&bytes[..20]),
            Err(BlobError::UnexpectedEnd)
        );
    }
}
