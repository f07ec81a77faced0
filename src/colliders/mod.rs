use bevy::ecs::component::Component;
use parry3d::shape::{SharedShape, TypedShape};

/// Trait required for the collider component used with [NavMeshGeneratorPlugin](crate::NavMeshGeneratorPlugin).
/// Essentially it allows you to use any bevy component that contains a `parry3d::shape::SharedShape` as a collider.
///
/// This trait may be implemented directly on the component (though `OxidizedCollider::Component` must still be specified),
/// or on a different (foreign) type wrapping a component from another crate.
pub trait OxidizedCollider: Send + Sync + 'static {
    type Component: Component;

    // Named to avoid conflicting with the functions on `parry3d::shape::SharedShape`.
    fn oxidized_into_typed_shape(item: &Self::Component) -> TypedShape;
}

/// Plain parry3d collider, for when no physics engine is around.
#[derive(Component, Clone)]
pub struct ParryCollider {
    pub shape: SharedShape,
}

impl ParryCollider {
    pub fn new(shape: SharedShape) -> Self {
        Self { shape }
    }
}

impl OxidizedCollider for ParryCollider {
    type Component = Self;

    fn oxidized_into_typed_shape(item: &Self::Component) -> TypedShape {
        item.shape.as_typed_shape()
    }
}
