//! Bounding boxes and the conversion between world space and generation space.
//!
//! The world is Z-up. Generation happens in a Y-up space where the horizontal grid lies on the XZ-plane:
//! ``(x, y, z)`` in world space is ``(x, z, -y)`` in generation space. The mapping keeps handedness so triangle
//! winding seen from above is preserved.

use bevy::{math::Vec3, transform::components::Transform};

/// Converts a world position into generation space.
#[inline]
pub fn world_to_recast(point: Vec3) -> Vec3 {
    Vec3::new(point.x, point.z, -point.y)
}

/// Converts a generation space position back into world space.
#[inline]
pub fn recast_to_world(point: Vec3) -> Vec3 {
    Vec3::new(point.x, -point.z, point.y)
}

/// Axis-aligned bounding box. All intersection & containment tests include the boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    /// Inverted box, grows into a valid box with the first included point.
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };

    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut bounds = Self::EMPTY;
        for point in points {
            bounds.include_point(point);
        }

        bounds
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline]
    pub fn include_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    #[inline]
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }

        Some(BoundingBox {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        })
    }

    /// True when ``other`` lies fully inside this box, touching faces included.
    #[inline]
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.min.cmple(point).all() && self.max.cmpge(point).all()
    }

    #[inline]
    pub fn expand_by(&self, amount: Vec3) -> BoundingBox {
        BoundingBox {
            min: self.min - amount,
            max: self.max + amount,
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Bounds of this box's corners after ``transform``.
    pub fn transformed(&self, transform: &Transform) -> BoundingBox {
        BoundingBox::from_points((0..8).map(|corner| {
            let point = Vec3::new(
                if corner & 1 == 0 { self.min.x } else { self.max.x },
                if corner & 2 == 0 { self.min.y } else { self.max.y },
                if corner & 4 == 0 { self.min.z } else { self.max.z },
            );

            transform.transform_point(point)
        }))
    }

    /// Converts a world space box into generation space.
    pub fn to_recast(&self) -> BoundingBox {
        BoundingBox {
            min: Vec3::new(self.min.x, self.min.z, -self.max.y),
            max: Vec3::new(self.max.x, self.max.z, -self.min.y),
        }
    }

    /// Converts a generation space box into world space.
    pub fn to_world(&self) -> BoundingBox {
        BoundingBox {
            min: Vec3::new(self.min.x, -self.max.z, self.min.y),
            max: Vec3::new(self.max.x, -self.min.z, self.max.y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_round_trips() {
        let point = Vec3::new(1.0, -2.0, 3.5);
        assert_eq!(recast_to_world(world_to_recast(point)), point);

        let bounds = BoundingBox::new(Vec3::new(-1.0, 2.0, 0.0), Vec3::new(4.0, 5.0, 3.0));
        assert_eq!(bounds.to_recast().to_world(), bounds);
        assert!(bounds.to_recast().is_valid());
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
        let b = BoundingBox::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        let c = BoundingBox::new(Vec3::new(1.01, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.contains_box(&a));
    }

    #[test]
    fn empty_box_grows_from_points() {
        let bounds = BoundingBox::from_points([Vec3::ONE, Vec3::NEG_ONE, Vec3::new(0.0, 3.0, 0.0)]);

        assert_eq!(bounds.min, Vec3::NEG_ONE);
        assert_eq!(bounds.max, Vec3::new(1.0, 3.0, 1.0));
        assert!(!BoundingBox::EMPTY.is_valid());
    }
}
