use std::num::NonZeroU16;

use bevy::{
    math::{IVec2, Vec3},
    platform::collections::HashMap,
    prelude::Resource,
};

use crate::{
    coords::BoundingBox,
    error::TileGenerationError,
    modifiers::ModifierSortFn,
    Area, MAX_AREAS,
};

/// Identifies a kind of area (water, road, obstacle...). Resolved to an [Area] id through [NavMeshSettings::area_classes].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaClass(pub &'static str);

impl AreaClass {
    /// Regular walkable ground.
    pub const DEFAULT: AreaClass = AreaClass("Default");
    /// Removes the marked area from the nav-mesh.
    pub const NULL: AreaClass = AreaClass("Null");
}

/// How a compact heightfield is split into regions (Phase B) or layers (Phase A).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PartitioningMethod {
    /// Sweeps rows and merges spans into monotone regions. Fastest, may produce long thin polygons.
    #[default]
    Monotone,
    /// Watershed over a distance field. Best looking regions, slowest.
    Watershed,
    /// Monotone partitioning inside fixed size chunks.
    Chunky,
}

/// Settings for nav-mesh generation.
#[derive(Resource, Clone)]
pub struct NavMeshSettings {
    /// The horizontal resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of agent radius.
    pub cell_size: f32,
    /// The vertical resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of cell_size.
    pub cell_height: f32,

    pub agent_radius: f32,
    pub agent_height: f32,
    /// Maximum traversable slope in degrees.
    pub agent_max_slope: f32,
    /// Maximum height difference that is still considered traversable. This smooths out stair steps and small ledges.
    pub agent_max_step_height: f32,

    /// Minimum size of an isolated region in world units, anything smaller is removed.
    pub min_region_area: f32,
    /// Regions smaller than this (in world units) get merged into their neighbours if possible.
    pub merge_region_size: f32,
    /// Maximum deviation of simplified contours from the raw contour in cells.
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_simplification_error: f32,
    /// Maximum length of a contour edge before it's split, in world units.
    pub max_edge_length: f32,
    /// Distance between height samples when building the detail mesh.
    pub detail_sample_distance: f32,
    /// Maximum height error of the detail mesh.
    pub detail_sample_max_error: f32,

    /// Length of a tile's side in world units. Truncated to a whole number of cells.
    ///
    /// **Suggested value**: 64-128 cells worth of world units.
    ///
    /// Higher means more to update each time something within the tile changes, smaller means you will have more overhead from connecting the edges to other tiles & generating the tile itself.
    pub tile_size: f32,
    /// Number of chunks per tile side when [PartitioningMethod::Chunky] is used for layers.
    pub layer_chunk_splits: u16,
    /// Number of chunks per tile side when [PartitioningMethod::Chunky] is used for regions.
    pub region_chunk_splits: u16,
    pub layer_partitioning: PartitioningMethod,
    pub region_partitioning: PartitioningMethod,

    /// Removes voxels outside of the inclusion bounds from tiles only partially covered by them.
    pub perform_voxel_filtering: bool,
    /// Keeps low clearance spans as a "low" area through erosion and only removes them at the end.
    pub mark_low_height_areas: bool,
    pub generate_detailed_mesh: bool,
    /// Caches rasterized spans per element & tile so static geometry isn't rasterized again.
    pub use_voxel_cache: bool,
    /// Polygon count above which a warning is logged. Generation continues regardless.
    pub max_polys_per_tile: usize,
    /// Index of the agent this nav-mesh is built for. Off-mesh links not supporting it are skipped.
    pub agent_index: u8,

    /// Max tiles to generate in parallel at once. A value of ``None`` uses twice the available parallelism.
    ///
    /// Adjust this to control memory & CPU usage. More tiles generating at once will have a higher memory footprint.
    pub max_tile_generation_tasks: Option<NonZeroU16>,

    /// Maps area classes used by modifiers & links to area ids.
    pub area_classes: HashMap<AreaClass, Area>,
    /// Polygon flags assigned per area id.
    pub flags_per_area: [u16; MAX_AREAS],
    /// Optional ordering applied to area modifiers before they're marked onto a layer.
    pub area_sort: Option<ModifierSortFn>,
}

impl Default for NavMeshSettings {
    fn default() -> Self {
        Self::from_agent(0.34, 1.44)
    }
}

impl NavMeshSettings {
    /// Creates settings with reasonable defaults derived from the size of your navigation agent.
    pub fn from_agent(agent_radius: f32, agent_height: f32) -> Self {
        let cell_size = (agent_radius / 2.0).max(0.05);
        let cell_height = cell_size / 2.0;

        let mut area_classes = HashMap::default();
        area_classes.insert(AreaClass::DEFAULT, Area::WALKABLE);
        area_classes.insert(AreaClass::NULL, Area::NULL);

        let mut flags_per_area = [1; MAX_AREAS];
        flags_per_area[Area::NULL.0 as usize] = 0;

        Self {
            cell_size,
            cell_height,
            agent_radius,
            agent_height,
            agent_max_slope: 44.0,
            agent_max_step_height: agent_height / 4.0,
            min_region_area: 0.0,
            merge_region_size: 4.0,
            max_simplification_error: 1.3,
            max_edge_length: 12.0,
            detail_sample_distance: 6.0,
            detail_sample_max_error: 1.0,
            tile_size: cell_size * 64.0,
            layer_chunk_splits: 2,
            region_chunk_splits: 2,
            layer_partitioning: PartitioningMethod::Monotone,
            region_partitioning: PartitioningMethod::Watershed,
            perform_voxel_filtering: true,
            mark_low_height_areas: false,
            generate_detailed_mesh: true,
            use_voxel_cache: false,
            max_polys_per_tile: 1 << 12,
            agent_index: 0,
            max_tile_generation_tasks: None,
            area_classes,
            flags_per_area,
            area_sort: None,
        }
    }

    /// Setter for [`NavMeshSettings::cell_size`] & [`NavMeshSettings::cell_height`]
    pub fn with_cell_size(mut self, cell_size: f32, cell_height: f32) -> Self {
        self.cell_size = cell_size;
        self.cell_height = cell_height;

        self
    }
    /// Setter for [`NavMeshSettings::tile_size`]
    pub fn with_tile_size(mut self, tile_size: f32) -> Self {
        self.tile_size = tile_size;

        self
    }
    /// Setter for [`NavMeshSettings::agent_radius`]
    pub fn with_agent_radius(mut self, agent_radius: f32) -> Self {
        self.agent_radius = agent_radius;

        self
    }
    /// Setter for [`NavMeshSettings::agent_height`]
    pub fn with_agent_height(mut self, agent_height: f32) -> Self {
        self.agent_height = agent_height;

        self
    }
    /// Setter for [`NavMeshSettings::agent_max_step_height`]
    pub fn with_step_height(mut self, step_height: f32) -> Self {
        self.agent_max_step_height = step_height;

        self
    }
    /// Setter for [`NavMeshSettings::agent_max_slope`]
    pub fn with_max_slope(mut self, degrees: f32) -> Self {
        self.agent_max_slope = degrees;

        self
    }
    /// Setter for [`NavMeshSettings::min_region_area`] & [`NavMeshSettings::merge_region_size`]
    pub fn with_region_area(mut self, min_region_area: f32, merge_region_size: f32) -> Self {
        self.min_region_area = min_region_area;
        self.merge_region_size = merge_region_size;

        self
    }
    /// Setter for [`NavMeshSettings::layer_partitioning`] & [`NavMeshSettings::region_partitioning`]
    pub fn with_partitioning(
        mut self,
        layer_partitioning: PartitioningMethod,
        region_partitioning: PartitioningMethod,
    ) -> Self {
        self.layer_partitioning = layer_partitioning;
        self.region_partitioning = region_partitioning;

        self
    }
    /// Setter for [`NavMeshSettings::max_tile_generation_tasks`]
    pub fn with_max_tile_generation_tasks(
        mut self,
        max_tile_generation_tasks: Option<NonZeroU16>,
    ) -> Self {
        self.max_tile_generation_tasks = max_tile_generation_tasks;

        self
    }
    /// Setter for [`NavMeshSettings::perform_voxel_filtering`]
    pub fn with_voxel_filtering(mut self, enabled: bool) -> Self {
        self.perform_voxel_filtering = enabled;

        self
    }
    /// Setter for [`NavMeshSettings::mark_low_height_areas`]
    pub fn with_low_height_areas(mut self, enabled: bool) -> Self {
        self.mark_low_height_areas = enabled;

        self
    }
    /// Setter for [`NavMeshSettings::generate_detailed_mesh`]
    pub fn with_detailed_mesh(mut self, enabled: bool) -> Self {
        self.generate_detailed_mesh = enabled;

        self
    }
    /// Setter for [`NavMeshSettings::use_voxel_cache`]
    pub fn with_voxel_cache(mut self, enabled: bool) -> Self {
        self.use_voxel_cache = enabled;

        self
    }
    /// Registers an area class and the polygon flags used for it.
    pub fn with_area_class(mut self, class: AreaClass, area: Area, flags: u16) -> Self {
        self.area_classes.insert(class, area);
        if let Some(area_flags) = self.flags_per_area.get_mut(area.0 as usize) {
            *area_flags = flags;
        }

        self
    }
    /// Setter for [`NavMeshSettings::area_sort`]
    pub fn with_area_sort(mut self, area_sort: Option<ModifierSortFn>) -> Self {
        self.area_sort = area_sort;

        self
    }
}

/// Voxel-space build configuration derived once from [NavMeshSettings].
///
/// Every tile generator gets a shared, immutable snapshot of this.
#[derive(Clone)]
pub struct BuildConfig {
    pub cell_size: f32,
    pub cell_height: f32,
    /// Degrees.
    pub walkable_slope_angle: f32,
    /// [Units: vx]
    pub walkable_height: u16,
    /// [Units: vx]
    pub walkable_climb: u16,
    /// [Units: vx]
    pub walkable_radius: u16,
    /// Cells of padding around the tile used while voxelizing. [Units: vx]
    pub border_size: u16,
    /// [Units: vx]
    pub max_edge_len: u16,
    pub max_simplification_error: f32,
    /// [Units: vx]
    pub min_region_area: u32,
    /// [Units: vx]
    pub merge_region_area: u32,
    pub max_verts_per_poly: usize,
    pub detail_sample_dist: f32,
    pub detail_sample_max_error: f32,
    /// Tile side length in cells. [Units: vx]
    pub tile_size: u16,
    pub layer_chunk_size: u16,
    pub region_chunk_size: u16,
    pub layer_partitioning: PartitioningMethod,
    pub region_partitioning: PartitioningMethod,

    pub agent_radius: f32,
    pub agent_height: f32,
    pub agent_max_climb: f32,
    pub agent_index: u8,

    pub perform_voxel_filtering: bool,
    pub mark_low_height_areas: bool,
    pub generate_detailed_mesh: bool,
    pub use_voxel_cache: bool,
    pub max_polys_per_tile: usize,

    pub area_classes: HashMap<AreaClass, Area>,
    pub flags_per_area: [u16; MAX_AREAS],
    pub area_sort: Option<ModifierSortFn>,
}

pub const MAX_VERTICES_PER_POLYGON: usize = 6;
/// Agent radius at or below which erosion is skipped.
const VERY_SMALL_AGENT_RADIUS: u16 = 0;

impl BuildConfig {
    pub fn from_settings(settings: &NavMeshSettings) -> Result<Self, TileGenerationError> {
        if settings.cell_size <= 0.0 || settings.cell_height <= 0.0 {
            return Err(TileGenerationError::InvalidConfig(format!(
                "cell size ({}) & cell height ({}) must be positive",
                settings.cell_size, settings.cell_height
            )));
        }
        let cs = settings.cell_size;
        let ch = settings.cell_height;

        let tile_size = (settings.tile_size / cs) as u16;
        if tile_size == 0 {
            return Err(TileGenerationError::InvalidConfig(format!(
                "tile size ({}) is smaller than a cell",
                settings.tile_size
            )));
        }

        let walkable_height = if settings.mark_low_height_areas {
            1
        } else {
            (settings.agent_height / ch).ceil() as u16
        };
        let walkable_radius = (settings.agent_radius / cs).ceil() as u16;

        let min_region_area = (settings.min_region_area / cs).powi(2) as u32;
        let merge_region_area = (settings.merge_region_size / cs).powi(2) as u32;

        Ok(Self {
            cell_size: cs,
            cell_height: ch,
            walkable_slope_angle: settings.agent_max_slope,
            walkable_height,
            walkable_climb: (settings.agent_max_step_height / ch).ceil() as u16,
            walkable_radius,
            border_size: walkable_radius + 3,
            max_edge_len: (settings.max_edge_length / cs) as u16,
            max_simplification_error: settings.max_simplification_error,
            min_region_area,
            merge_region_area,
            max_verts_per_poly: MAX_VERTICES_PER_POLYGON,
            detail_sample_dist: settings.detail_sample_distance,
            detail_sample_max_error: settings.detail_sample_max_error,
            tile_size,
            layer_chunk_size: (tile_size / settings.layer_chunk_splits.max(1)).max(1),
            region_chunk_size: (tile_size / settings.region_chunk_splits.max(1)).max(1),
            layer_partitioning: settings.layer_partitioning,
            region_partitioning: settings.region_partitioning,
            agent_radius: settings.agent_radius,
            agent_height: settings.agent_height,
            agent_max_climb: settings.agent_max_step_height,
            agent_index: settings.agent_index,
            perform_voxel_filtering: settings.perform_voxel_filtering,
            mark_low_height_areas: settings.mark_low_height_areas,
            generate_detailed_mesh: settings.generate_detailed_mesh,
            use_voxel_cache: settings.use_voxel_cache,
            max_polys_per_tile: settings.max_polys_per_tile,
            area_classes: settings.area_classes.clone(),
            flags_per_area: settings.flags_per_area,
            area_sort: settings.area_sort.clone(),
        })
    }

    /// Returns the length of a tile's side in world units.
    #[inline]
    pub fn tile_width(&self) -> f32 {
        f32::from(self.tile_size) * self.cell_size
    }

    #[inline]
    pub fn tile_side_with_border(&self) -> usize {
        usize::from(self.tile_size) + usize::from(self.border_size) * 2
    }

    /// Height in cells a span needs above it to count as walkable when low areas are kept.
    #[inline]
    pub fn low_height_threshold(&self) -> u16 {
        (self.agent_height / self.cell_height).ceil() as u16
    }

    #[inline]
    pub fn should_erode(&self) -> bool {
        self.walkable_radius > VERY_SMALL_AGENT_RADIUS
    }

    /// World space bounds of a tile. The vertical extent is taken from ``total_bounds``.
    pub fn tile_bounds(&self, tile: IVec2, total_bounds: &BoundingBox) -> BoundingBox {
        let tile_width = self.tile_width();
        let recast = BoundingBox::new(
            Vec3::new(tile.x as f32 * tile_width, 0.0, tile.y as f32 * tile_width),
            Vec3::new(
                (tile.x + 1) as f32 * tile_width,
                0.0,
                (tile.y + 1) as f32 * tile_width,
            ),
        );
        let mut world = recast.to_world();
        world.min.z = total_bounds.min.z;
        world.max.z = total_bounds.max.z;

        world
    }

    /// Inclusive range of tiles touched by a world space box.
    pub fn tile_range(&self, world_bounds: &BoundingBox) -> (IVec2, IVec2) {
        let tile_width = self.tile_width();
        let recast = world_bounds.to_recast();

        let min = IVec2::new(
            (recast.min.x / tile_width).floor() as i32,
            (recast.min.z / tile_width).floor() as i32,
        );
        let max = IVec2::new(
            (recast.max.x / tile_width).floor() as i32,
            (recast.max.z / tile_width).floor() as i32,
        );

        (min, max)
    }

    /// Grows a box by the border used while voxelizing so everything that can affect a tile is covered.
    ///
    /// Optionally also grows the bottom by the agent height so areas below an object are included.
    pub fn grow_bounding_box(&self, bounds: &BoundingBox, include_agent_height: bool) -> BoundingBox {
        let growth = Vec3::splat(2.0 * f32::from(self.border_size) * self.cell_size);
        let min_offset = Vec3::new(
            0.0,
            0.0,
            if include_agent_height {
                self.agent_height
            } else {
                0.0
            },
        );

        BoundingBox::new(bounds.min - growth - min_offset, bounds.max + growth)
    }

    /// Resolves an area class to its id. ``None`` when the class isn't registered.
    pub fn resolve_area_class(&self, class: AreaClass) -> Option<Area> {
        self.area_classes.get(&class).copied()
    }

    #[inline]
    pub fn flags_for_area(&self, area: Area) -> u16 {
        self.flags_per_area
            .get(area.0 as usize)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_config_matches_agent() {
        let settings = NavMeshSettings::from_agent(0.5, 2.0)
            .with_cell_size(0.25, 0.1)
            .with_tile_size(16.0)
            .with_step_height(0.35);
        let config = BuildConfig::from_settings(&settings).expect("valid settings");

        assert_eq!(config.walkable_radius, 2);
        assert_eq!(config.border_size, 5);
        assert_eq!(config.walkable_height, 20);
        assert_eq!(config.walkable_climb, 4);
        assert_eq!(config.tile_size, 64);
        assert_eq!(config.tile_side_with_border(), 74);
        assert_eq!(config.max_verts_per_poly, 6);
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        let settings = NavMeshSettings::default().with_cell_size(0.0, 0.1);
        assert!(matches!(
            BuildConfig::from_settings(&settings),
            Err(TileGenerationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn grow_bounding_box_contains_input() {
        let config = BuildConfig::from_settings(
            &NavMeshSettings::from_agent(0.5, 2.0).with_cell_size(0.25, 0.1),
        )
        .expect("valid settings");
        let bounds = BoundingBox::new(Vec3::new(-3.0, 1.0, 0.5), Vec3::new(2.0, 4.0, 1.5));
        let growth = 2.0 * f32::from(config.border_size) * config.cell_size;

        for include_agent_height in [false, true] {
            let grown = config.grow_bounding_box(&bounds, include_agent_height);
            assert!(grown.contains_box(&bounds));
            assert!((bounds.min.x - grown.min.x - growth).abs() < 1e-5);
            assert!((grown.max.x - bounds.max.x - growth).abs() < 1e-5);
            assert!((bounds.min.y - grown.min.y - growth).abs() < 1e-5);
            assert!((grown.max.y - bounds.max.y - growth).abs() < 1e-5);

            let extra_bottom = if include_agent_height { config.agent_height } else { 0.0 };
            assert!((bounds.min.z - grown.min.z - growth - extra_bottom).abs() < 1e-5);
            assert!((grown.max.z - bounds.max.z - growth).abs() < 1e-5);
        }
    }

    #[test]
    fn tile_bounds_and_range_agree() {
        let config = BuildConfig::from_settings(
            &NavMeshSettings::default().with_cell_size(0.25, 0.1).with_tile_size(16.0),
        )
        .expect("valid settings");
        let total = BoundingBox::new(Vec3::splat(-100.0), Vec3::splat(100.0));

        for tile in [IVec2::new(0, 0), IVec2::new(-2, 3), IVec2::new(4, -1)] {
            let bounds = config.tile_bounds(tile, &total);
            let inner = BoundingBox::new(bounds.min + 0.1, bounds.max - 0.1);
            assert_eq!(config.tile_range(&inner), (tile, tile));
        }
    }
}
