//! Navigation relevant elements of the world & the index used to gather them per tile.

use std::sync::Arc;

use bevy::{
    ecs::entity::Entity, math::IVec2, platform::collections::HashMap,
    transform::components::Transform,
};

use crate::{
    coords::BoundingBox,
    geometry_export::GeometryCache,
    modifiers::AreaModifierElement,
    offmesh::LinkModifier,
    voxel_cache::{prepare_voxel_cache, CachedSpan, RasterizationScratchPool, VoxelCache},
    settings::BuildConfig,
};

/// Identifies an element in a [NavigationElementIndex].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl From<Entity> for ElementId {
    fn from(entity: Entity) -> Self {
        Self(entity.to_bits())
    }
}

/// Something that affects the nav-mesh: collision geometry, area modifiers and/or off-mesh links.
#[derive(Clone, Debug, Default)]
pub struct NavigationElement {
    /// Exported geometry, shared between every tile build that uses it.
    pub geometry: Option<Arc<GeometryCache>>,
    /// World transforms the geometry is instanced with. Empty means the geometry is used as is.
    pub instance_transforms: Vec<Transform>,
    pub area_modifiers: Option<AreaModifierElement>,
    pub links: Option<LinkModifier>,
    pub(crate) voxel_cache: Option<VoxelCache>,
}

impl NavigationElement {
    pub fn from_geometry(geometry: GeometryCache) -> Self {
        Self {
            geometry: (!geometry.is_empty()).then(|| Arc::new(geometry)),
            ..Default::default()
        }
    }

    /// Setter for [`NavigationElement::instance_transforms`]
    pub fn with_instances(mut self, instance_transforms: Vec<Transform>) -> Self {
        self.instance_transforms = instance_transforms;

        self
    }

    /// Setter for [`NavigationElement::area_modifiers`]
    pub fn with_area_modifiers(mut self, area_modifiers: AreaModifierElement) -> Self {
        self.area_modifiers = Some(area_modifiers);

        self
    }

    /// Setter for [`NavigationElement::links`]
    pub fn with_links(mut self, links: LinkModifier) -> Self {
        self.links = Some(links);

        self
    }

    /// World space bounds of everything the element contributes.
    pub fn bounds(&self) -> BoundingBox {
        let mut bounds = BoundingBox::EMPTY;

        if let Some(geometry) = &self.geometry {
            let geometry_bounds = geometry.bounds().to_world();
            if self.instance_transforms.is_empty() {
                bounds = bounds.union(&geometry_bounds);
            }
            for transform in self.instance_transforms.iter() {
                bounds = bounds.union(&geometry_bounds.transformed(transform));
            }
        }
        if let Some(modifiers) = &self.area_modifiers {
            bounds = bounds.union(&modifiers.bounds());
        }
        if let Some(links) = self.links.as_ref().filter(|links| !links.is_empty()) {
            bounds = bounds.union(&links.bounds());
        }

        bounds
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }

    /// Cached spans of ``tile``, rasterizing & storing them on a miss.
    pub(crate) fn cached_spans(
        &mut self,
        pool: &RasterizationScratchPool,
        tile: IVec2,
        total_bounds: &BoundingBox,
        config: &BuildConfig,
    ) -> Option<Vec<CachedSpan>> {
        let geometry = self.geometry.as_ref()?;
        let cache = self.voxel_cache.get_or_insert_with(VoxelCache::default);

        if let Some(spans) = cache.get(tile) {
            return Some(spans.to_vec());
        }

        let spans = prepare_voxel_cache(pool, geometry, &self.instance_transforms, tile, total_bounds, config);
        cache.store(tile, spans.clone());

        Some(spans)
    }

    pub fn voxel_cache(&self) -> Option<&VoxelCache> {
        self.voxel_cache.as_ref()
    }
}

struct IndexedElement {
    element: NavigationElement,
    bounds: BoundingBox,
}

/// Every navigation element of the world, queried by bounds when gathering a tile's input.
#[derive(Default)]
pub struct NavigationElementIndex {
    elements: HashMap<ElementId, IndexedElement>,
}

impl NavigationElementIndex {
    /// Inserts or replaces an element. Returns the bounds of the element it replaced.
    pub fn insert(&mut self, id: ElementId, element: NavigationElement) -> Option<BoundingBox> {
        let bounds = element.bounds();

        self.elements
            .insert(id, IndexedElement { element, bounds })
            .map(|old| old.bounds)
    }

    /// Removes an element, returning its bounds.
    pub fn remove(&mut self, id: ElementId) -> Option<BoundingBox> {
        self.elements.remove(&id).map(|old| old.bounds)
    }

    pub fn get(&self, id: ElementId) -> Option<&NavigationElement> {
        self.elements.get(&id).map(|indexed| &indexed.element)
    }

    pub fn bounds(&self, id: ElementId) -> Option<BoundingBox> {
        self.elements.get(&id).map(|indexed| indexed.bounds)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Drops every voxel cache, needed when the build configuration changes.
    pub fn clear_voxel_caches(&mut self) {
        for indexed in self.elements.values_mut() {
            indexed.element.voxel_cache = None;
        }
    }

    /// Ids of every element whose bounds intersect ``bounds``, sorted for deterministic gathering.
    pub fn query(&self, bounds: &BoundingBox) -> Vec<ElementId> {
        let mut ids: Vec<ElementId> = self
            .elements
            .iter()
            .filter(|(_, indexed)| indexed.bounds.is_valid() && indexed.bounds.intersects(bounds))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        ids
    }

    /// Every element, sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &NavigationElement)> {
        let mut elements: Vec<(ElementId, &NavigationElement)> = self
            .elements
            .iter()
            .map(|(id, indexed)| (*id, &indexed.element))
            .collect();
        elements.sort_unstable_by_key(|(id, _)| *id);

        elements.into_iter()
    }

    pub(crate) fn get_mut(&mut self, id: ElementId) -> Option<&mut NavigationElement> {
        self.elements.get_mut(&id).map(|indexed| &mut indexed.element)
    }

    /// Union of every element's bounds.
    pub fn total_bounds(&self) -> BoundingBox {
        self.elements
            .values()
            .filter(|indexed| indexed.bounds.is_valid())
            .fold(BoundingBox::EMPTY, |bounds, indexed| bounds.union(&indexed.bounds))
    }
}
