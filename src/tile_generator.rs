//! Builds all layers of a single tile.
//!
//! A [TileGenerator] is set up on the control side, where it gathers everything it needs from the element index, and
//! then runs on a worker without touching any shared state. Generation happens in two phases:
//! - **Compressed layers**: geometry is voxelized, filtered & split into layers which are compressed & kept around.
//! - **Navigation data**: every dirty layer is decompressed, area modifiers are marked onto it and it's turned into
//!   navigation tile data.
//!
//! An area-only change can skip the first phase entirely by reusing the previous compressed layers.

use std::sync::Arc;

use bevy::{
    log::{debug, error, warn},
    math::{IVec2, Vec3},
    transform::components::Transform,
};

use crate::{
    compression::{compress_layer, decompress_layer, CompressedLayer},
    contour::{build_contours, ContourSettings},
    coords::BoundingBox,
    detail_mesh::build_detail_mesh,
    element::NavigationElementIndex,
    error::TileGenerationError,
    geometry_export::GeometryCache,
    heightfields::{
        apply_voxel_filter, build_open_tile, erode_walkable_and_low_areas, erode_walkable_area,
        filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
        rasterize_geometry, replace_box_area, SolidHeightfield,
    },
    layers::{build_heightfield_layers, LayerBuildParams},
    mesher::{build_clusters, build_poly_mesh},
    modifiers::{mark_dynamic_areas, sort_modifiers, AreaModifierElement},
    offmesh::{build_off_mesh_connections, LinkModifier, OffMeshConnection},
    regions::{build_regions, RegionSettings},
    settings::BuildConfig,
    tile_blob::{create_navigation_tile_data, NavTileBuildParams},
    voxel_cache::{add_cached_spans, padded_tile_bounds, CachedSpan, RasterizationScratchPool},
    Area,
};

/// Lifecycle of a [TileGenerator]. Queued & finished generators are tracked by the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileGeneratorState {
    Constructed,
    Setup,
    Running,
    Done,
}

/// Geometry of one element gathered for a tile.
enum TileGeometry {
    Raw {
        geometry: Arc<GeometryCache>,
        instances: Vec<Transform>,
    },
    Cached(Vec<CachedSpan>),
}

/// Shared state a generator reads while being set up.
pub(crate) struct TileSetupContext<'a> {
    pub total_bounds: &'a BoundingBox,
    /// World space bounds where navigation may exist.
    pub inclusion_bounds: &'a [BoundingBox],
    pub elements: &'a mut NavigationElementIndex,
    pub scratch_pool: &'a RasterizationScratchPool,
}

/// Navigation data of one layer. ``None`` when the layer ended up without polygons.
#[derive(Debug)]
pub struct NavigationLayer {
    pub layer_index: u8,
    pub data: Option<Box<[u8]>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileGeneratorStats {
    pub regenerated_compressed_layers: bool,
    pub navigation_layers_built: usize,
    pub triangles_rasterized: usize,
}

/// Everything a finished build hands back to the manager.
#[derive(Debug)]
pub struct TileGenerationOutput {
    pub tile: IVec2,
    pub version: u64,
    /// Compressed layers to cache for the next partial rebuild. Holds the previous layers again if the build failed.
    pub compressed_layers: Vec<CompressedLayer>,
    pub result: Result<TileBuildResult, TileGenerationError>,
}

#[derive(Debug, Default)]
pub struct TileBuildResult {
    /// Rebuilt layers. Existing data for these layer indices is replaced.
    pub navigation_layers: Vec<NavigationLayer>,
    /// Layer count after the build when compressed layers were regenerated. Layers at or above it are stale.
    pub layer_count: Option<usize>,
    pub stats: TileGeneratorStats,
}

pub struct TileGenerator {
    tile: IVec2,
    version: u64,
    config: Arc<BuildConfig>,
    state: TileGeneratorState,

    dirty_areas: Vec<BoundingBox>,
    total_bounds: BoundingBox,
    tile_bounds: BoundingBox,
    /// Inclusion bounds touching the tile, in generation space.
    inclusion_bounds: Vec<BoundingBox>,
    fully_encapsulated: bool,

    regenerate_compressed_layers: bool,
    compressed_layers: Vec<CompressedLayer>,
    dirty_layers: Vec<bool>,

    geometry: Vec<TileGeometry>,
    modifiers: Vec<AreaModifierElement>,
    links: Vec<LinkModifier>,
}

impl TileGenerator {
    /// ``dirty_areas`` being empty requests a full rebuild.
    pub(crate) fn new(tile: IVec2, version: u64, config: Arc<BuildConfig>, dirty_areas: Vec<BoundingBox>) -> Self {
        Self {
            tile,
            version,
            config,
            state: TileGeneratorState::Constructed,
            dirty_areas,
            total_bounds: BoundingBox::EMPTY,
            tile_bounds: BoundingBox::EMPTY,
            inclusion_bounds: Vec::new(),
            fully_encapsulated: false,
            regenerate_compressed_layers: true,
            compressed_layers: Vec::new(),
            dirty_layers: Vec::new(),
            geometry: Vec::new(),
            modifiers: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn tile(&self) -> IVec2 {
        self.tile
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> TileGeneratorState {
        self.state
    }

    pub fn regenerates_compressed_layers(&self) -> bool {
        self.regenerate_compressed_layers
    }

    /// Takes over the previous compressed layers & gathers geometry and modifiers.
    pub(crate) fn setup(&mut self, context: TileSetupContext, previous_layers: Vec<CompressedLayer>) {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Setup tile generator").entered();

        let config = self.config.clone();
        self.total_bounds = *context.total_bounds;
        self.tile_bounds = config.tile_bounds(self.tile, context.total_bounds);

        let radius = f32::from(config.walkable_radius) * config.cell_size;
        self.inclusion_bounds = context
            .inclusion_bounds
            .iter()
            .filter(|bounds| bounds.intersects(&self.tile_bounds))
            .map(|bounds| bounds.to_recast().expand_by(Vec3::new(radius, 0.0, radius)))
            .collect();
        self.fully_encapsulated = context
            .inclusion_bounds
            .iter()
            .any(|bounds| bounds.contains_box(&self.tile_bounds));

        self.compressed_layers = previous_layers;
        self.regenerate_compressed_layers = self.dirty_areas.is_empty() || self.compressed_layers.is_empty();

        if !self.regenerate_compressed_layers {
            let padding = Vec3::splat(f32::from(config.border_size) * config.cell_size);
            self.dirty_layers = self
                .compressed_layers
                .iter()
                .map(|layer| {
                    let bounds = layer.bounds().expand_by(padding);

                    self.dirty_areas.iter().any(|dirty| dirty.intersects(&bounds))
                })
                .collect();
        }

        if !self.inclusion_bounds.is_empty() {
            self.gather(context.elements, context.scratch_pool);
        }
        self.state = TileGeneratorState::Setup;
    }

    fn gather(&mut self, elements: &mut NavigationElementIndex, scratch_pool: &RasterizationScratchPool) {
        let gather_bounds = self.config.grow_bounding_box(&self.tile_bounds, false);

        for id in elements.query(&gather_bounds) {
            let Some(element) = elements.get_mut(id) else {
                continue;
            };

            if self.regenerate_compressed_layers {
                if self.config.use_voxel_cache {
                    if let Some(spans) =
                        element.cached_spans(scratch_pool, self.tile, &self.total_bounds, &self.config)
                    {
                        if !spans.is_empty() {
                            self.geometry.push(TileGeometry::Cached(spans));
                        }
                    }
                } else if let Some(geometry) = &element.geometry {
                    self.geometry.push(TileGeometry::Raw {
                        geometry: geometry.clone(),
                        instances: element.instance_transforms.clone(),
                    });
                }
            }

            if let Some(modifiers) = element.area_modifiers.as_ref().filter(|modifiers| !modifiers.areas.is_empty()) {
                self.modifiers.push(modifiers.clone());
            }
            if let Some(links) = element.links.as_ref().filter(|links| !links.is_empty()) {
                self.links.push(links.clone());
            }
        }

        sort_modifiers(&mut self.modifiers, self.config.area_sort.as_ref());
    }

    /// Whether building could produce anything. Tiles without data are removed instead of built.
    pub fn has_data_to_build(&self) -> bool {
        if self.inclusion_bounds.is_empty() {
            return false;
        }

        !self.compressed_layers.is_empty()
            || !self.modifiers.is_empty()
            || !self.links.is_empty()
            || !self.geometry.is_empty()
    }

    /// Runs both generation phases. Blocks until done.
    pub fn generate(mut self) -> TileGenerationOutput {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Generate tile", x = self.tile.x, y = self.tile.y).entered();

        self.state = TileGeneratorState::Running;

        let mut stats = TileGeneratorStats::default();
        let previous_layers = std::mem::take(&mut self.compressed_layers);

        let result = self.generate_tile(&previous_layers, &mut stats);
        self.state = TileGeneratorState::Done;

        match result {
            Ok((compressed_layers, navigation_layers)) => {
                stats.navigation_layers_built = navigation_layers.len();
                let layer_count = self.regenerate_compressed_layers.then_some(compressed_layers.len());
                let compressed_layers = if self.regenerate_compressed_layers {
                    compressed_layers
                } else {
                    previous_layers
                };

                TileGenerationOutput {
                    tile: self.tile,
                    version: self.version,
                    compressed_layers,
                    result: Ok(TileBuildResult {
                        navigation_layers,
                        layer_count,
                        stats,
                    }),
                }
            }
            Err(build_error) => {
                error!(
                    "Failed to generate tile ({},{}): {build_error}",
                    self.tile.x, self.tile.y
                );

                TileGenerationOutput {
                    tile: self.tile,
                    version: self.version,
                    compressed_layers: previous_layers,
                    result: Err(build_error),
                }
            }
        }
    }

    /// Returns the freshly built compressed layers (empty when reused) & the rebuilt navigation layers.
    fn generate_tile(
        &self,
        previous_layers: &[CompressedLayer],
        stats: &mut TileGeneratorStats,
    ) -> Result<(Vec<CompressedLayer>, Vec<NavigationLayer>), TileGenerationError> {
        let new_layers = if self.regenerate_compressed_layers {
            stats.regenerated_compressed_layers = true;
            self.generate_compressed_layers(stats)?
        } else {
            Vec::new()
        };

        let (layers, dirty): (&[CompressedLayer], Vec<bool>) = if self.regenerate_compressed_layers {
            (&new_layers, vec![true; new_layers.len()])
        } else {
            (previous_layers, self.dirty_layers.clone())
        };

        if !dirty.iter().any(|dirty| *dirty) {
            return Ok((new_layers, Vec::new()));
        }

        let off_mesh_connections = build_off_mesh_connections(&self.links, &self.config);

        let mut navigation_layers = Vec::new();
        for (layer, _) in layers.iter().zip(dirty.iter()).filter(|(_, dirty)| **dirty) {
            navigation_layers.push(self.generate_navigation_layer(layer, &off_mesh_connections)?);
        }

        Ok((new_layers, navigation_layers))
    }

    /// Voxelizes the tile & splits it into compressed layers.
    fn generate_compressed_layers(
        &self,
        stats: &mut TileGeneratorStats,
    ) -> Result<Vec<CompressedLayer>, TileGenerationError> {
        let config = &self.config;
        let bounds = padded_tile_bounds(config, self.tile, &self.total_bounds);
        let side = config.tile_side_with_border();

        let mut heightfield = SolidHeightfield::new(
            side,
            side,
            bounds.min,
            bounds.max,
            config.cell_size,
            config.cell_height,
        );

        {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Rasterize geometry").entered();

            for geometry in self.geometry.iter() {
                match geometry {
                    TileGeometry::Raw { geometry, instances } => {
                        if instances.is_empty() {
                            stats.triangles_rasterized += rasterize_geometry(
                                &mut heightfield,
                                geometry,
                                None,
                                config.walkable_slope_angle,
                                config.walkable_climb,
                            );
                        }
                        for instance in instances.iter() {
                            stats.triangles_rasterized += rasterize_geometry(
                                &mut heightfield,
                                geometry,
                                Some(instance),
                                config.walkable_slope_angle,
                                config.walkable_climb,
                            );
                        }
                    }
                    TileGeometry::Cached(spans) => {
                        add_cached_spans(&mut heightfield, spans, config.walkable_climb);
                    }
                }
            }
        }

        if heightfield.span_count() == 0 {
            debug!("Tile ({},{}) is empty, no layers generated.", self.tile.x, self.tile.y);
            return Ok(Vec::new());
        }

        if config.perform_voxel_filtering && !self.fully_encapsulated {
            apply_voxel_filter(&mut heightfield, &self.inclusion_bounds);
        }

        {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Filter heightfield").entered();

            filter_low_hanging_walkable_obstacles(&mut heightfield, config.walkable_climb);
            filter_ledge_spans(&mut heightfield, config.walkable_height, config.walkable_climb);
            if !config.mark_low_height_areas {
                filter_walkable_low_height_spans(&mut heightfield, config.walkable_height);
            }
        }

        let mut open_tile = {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Build open tile").entered();

            build_open_tile(&heightfield, config.walkable_height, config.walkable_climb)
        };
        // Done with the solid heightfield.
        drop(heightfield);

        {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Erode walkable area").entered();

            if config.mark_low_height_areas {
                erode_walkable_and_low_areas(
                    &mut open_tile,
                    config.walkable_radius,
                    config.low_height_threshold(),
                    Area::LOW_HEIGHT,
                );
                replace_box_area(
                    &mut open_tile,
                    bounds.min,
                    config.cell_size,
                    config.cell_height,
                    &bounds,
                    Area::LOW_HEIGHT,
                    Area::NULL,
                );
            } else if config.should_erode() {
                erode_walkable_area(&mut open_tile, config.walkable_radius);
            }
        }

        {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Build layer regions").entered();

            build_regions(
                &mut open_tile,
                config.layer_partitioning,
                config.layer_chunk_size,
                RegionSettings::default(),
            )?;
        }

        let layers = build_heightfield_layers(
            &open_tile,
            &LayerBuildParams {
                tile: self.tile,
                border_size: usize::from(config.border_size),
                heightfield_min: bounds.min,
                cell_size: config.cell_size,
                cell_height: config.cell_height,
                walkable_height: config.walkable_height,
            },
        )?;

        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Compress layers").entered();

        Ok(layers
            .iter()
            .map(|layer| {
                let compressed = compress_layer(layer, layer.world_bounds(config.agent_max_climb));
                debug!(
                    ">> Cache[{},{}:{}] = {:.2} kB",
                    self.tile.x,
                    self.tile.y,
                    compressed.layer_index(),
                    compressed.size_in_bytes() as f32 / 1024.0
                );

                compressed
            })
            .collect())
    }

    /// Builds navigation tile data for one compressed layer.
    fn generate_navigation_layer(
        &self,
        compressed: &CompressedLayer,
        off_mesh_connections: &[OffMeshConnection],
    ) -> Result<NavigationLayer, TileGenerationError> {
        let config = &self.config;
        let layer_index = compressed.layer_index();

        let mut layer = decompress_layer(compressed)?;
        if !self.modifiers.is_empty() {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Mark dynamic areas").entered();

            mark_dynamic_areas(&mut layer, &self.modifiers, config);
        }

        let mut open_tile = layer.to_open_tile();
        {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Build regions").entered();

            build_regions(
                &mut open_tile,
                config.region_partitioning,
                config.region_chunk_size,
                RegionSettings {
                    min_region_area: config.min_region_area,
                    merge_region_area: config.merge_region_area,
                },
            )?;
        }

        let contour_set = {
            #[cfg(feature = "trace")]
            let _span = bevy::log::info_span!("Build contours").entered();

            build_contours(
                &open_tile,
                ContourSettings {
                    max_error: config.max_simplification_error,
                    max_edge_len: config.max_edge_len,
                },
            )
        };

        let mut poly_mesh = match build_poly_mesh(&contour_set, config.max_verts_per_poly) {
            Ok(poly_mesh) => poly_mesh,
            Err(build_error) => {
                error!(
                    "Failed to build polygon mesh for layer ({},{}:{}): {build_error}",
                    self.tile.x, self.tile.y, layer_index
                );
                return Err(build_error);
            }
        };

        if poly_mesh.polygon_count() == 0 {
            return Ok(NavigationLayer {
                layer_index,
                data: None,
            });
        }

        poly_mesh.flags = poly_mesh
            .areas
            .iter()
            .map(|area| config.flags_for_area(*area))
            .collect();

        if poly_mesh.polygon_count() > config.max_polys_per_tile {
            warn!(
                "Layer ({},{}:{}) has {} polygons, more than the max of {} per tile.",
                self.tile.x,
                self.tile.y,
                layer_index,
                poly_mesh.polygon_count(),
                config.max_polys_per_tile
            );
        }

        let detail_mesh = config.generate_detailed_mesh.then(|| {
            let sample_distance = if config.detail_sample_dist < 0.9 * config.cell_size {
                0
            } else {
                (config.detail_sample_dist / config.cell_size).round() as u32
            };

            build_detail_mesh(
                &open_tile,
                &poly_mesh,
                sample_distance,
                config.detail_sample_max_error / config.cell_height,
            )
        });

        let clusters = build_clusters(&poly_mesh);

        let data = create_navigation_tile_data(&NavTileBuildParams {
            tile: self.tile,
            layer: layer_index,
            bmin: layer.header.bmin,
            bmax: layer.header.bmax,
            cell_size: config.cell_size,
            cell_height: config.cell_height,
            walkable_height: config.agent_height,
            walkable_radius: config.agent_radius,
            walkable_climb: config.agent_max_climb,
            poly_mesh: &poly_mesh,
            detail_mesh: detail_mesh.as_ref(),
            clusters: &clusters,
            off_mesh_connections,
        })?;

        debug!(
            ">> Layer[{}] = Verts({}) Polys({})",
            layer_index,
            poly_mesh.vertices.len(),
            poly_mesh.polygon_count()
        );

        Ok(NavigationLayer {
            layer_index,
            data: Some(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use bevy::math::Vec3;

    use super::*;
    use crate::{
        element::{ElementId, NavigationElement},
        geometry_export::{CollisionShape, GeometryExport},
        settings::NavMeshSettings,
        tile_blob::NavigationTile,
    };

    fn config(settings: NavMeshSettings) -> Arc<BuildConfig> {
        Arc::new(BuildConfig::from_settings(&settings).expect("valid settings"))
    }

    fn ground(half_extent: f32) -> NavigationElement {
        let mut export = GeometryExport::new();
        export.add_shape(
            &CollisionShape::Box {
                half_extents: Vec3::new(half_extent, half_extent, 0.1),
            },
            &Transform::from_xyz(half_extent, -half_extent, -0.1),
        );

        NavigationElement::from_geometry(export.finish())
    }

    fn setup(
        generator: &mut TileGenerator,
        elements: &mut NavigationElementIndex,
        previous: Vec<CompressedLayer>,
    ) {
        let total_bounds = BoundingBox::new(Vec3::new(-1.0, -11.0, -2.0), Vec3::new(11.0, 1.0, 4.0));
        let pool = RasterizationScratchPool::default();
        generator.setup(
            TileSetupContext {
                total_bounds: &total_bounds,
                inclusion_bounds: &[total_bounds],
                elements,
                scratch_pool: &pool,
            },
            previous,
        );
    }

    fn flat_settings() -> NavMeshSettings {
        NavMeshSettings::from_agent(0.5, 2.0).with_tile_size(10.0)
    }

    #[test]
    fn empty_tile_succeeds_without_layers() {
        let mut elements = NavigationElementIndex::default();
        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config(flat_settings()), Vec::new());
        setup(&mut generator, &mut elements, Vec::new());

        assert_eq!(generator.state(), TileGeneratorState::Setup);
        assert!(!generator.has_data_to_build());

        let output = generator.generate();
        let result = output.result.expect("empty tiles aren't failures");
        assert!(output.compressed_layers.is_empty());
        assert!(result.navigation_layers.is_empty());
        assert_eq!(result.layer_count, Some(0));
    }

    #[test]
    fn flat_ground_builds_single_layer() {
        let mut elements = NavigationElementIndex::default();
        elements.insert(ElementId(0), ground(5.0));

        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config(flat_settings()), Vec::new());
        setup(&mut generator, &mut elements, Vec::new());
        assert!(generator.has_data_to_build());
        assert!(generator.regenerates_compressed_layers());

        let output = generator.generate();
        let result = output.result.expect("flat ground builds");

        assert_eq!(output.compressed_layers.len(), 1);
        assert!(result.stats.regenerated_compressed_layers);
        assert!(result.stats.triangles_rasterized > 0);
        assert_eq!(result.navigation_layers.len(), 1);

        let data = result.navigation_layers[0].data.as_ref().expect("layer has polygons");
        let tile = NavigationTile::from_bytes(data).expect("valid tile data");
        assert_eq!(tile.header.tile, IVec2::ZERO);
        assert!(tile.ground_polygon_count() > 0);
    }

    #[test]
    fn area_only_change_reuses_compressed_layers() {
        let mut elements = NavigationElementIndex::default();
        elements.insert(ElementId(0), ground(5.0));
        let config = config(flat_settings());

        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config.clone(), Vec::new());
        setup(&mut generator, &mut elements, Vec::new());
        let first = generator.generate();
        let first_data = first.result.expect("builds").navigation_layers[0].data.clone();

        let dirty = BoundingBox::new(Vec3::new(4.0, -6.0, -1.0), Vec3::new(6.0, -4.0, 1.0));
        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config, vec![dirty]);
        setup(&mut generator, &mut elements, first.compressed_layers);
        assert!(!generator.regenerates_compressed_layers());

        let second = generator.generate();
        let result = second.result.expect("rebuilds");
        assert!(!result.stats.regenerated_compressed_layers);
        assert_eq!(result.stats.triangles_rasterized, 0);
        assert_eq!(result.layer_count, None);
        assert_eq!(second.compressed_layers.len(), 1);
        assert_eq!(result.navigation_layers[0].data, first_data);
    }

    #[test]
    fn failed_build_hands_back_previous_layers() {
        let mut elements = NavigationElementIndex::default();
        elements.insert(ElementId(0), ground(5.0));
        let config = config(flat_settings());

        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config.clone(), Vec::new());
        setup(&mut generator, &mut elements, Vec::new());
        let mut layers = generator.generate().compressed_layers;

        // Corrupt the only layer.
        let corrupt = CompressedLayer::from_raw(0, *layers[0].bounds(), vec![0u8; 4].into_boxed_slice());
        layers[0] = corrupt;

        let dirty = BoundingBox::new(Vec3::new(4.0, -6.0, -1.0), Vec3::new(6.0, -4.0, 1.0));
        let mut generator = TileGenerator::new(IVec2::ZERO, 0, config, vec![dirty]);
        setup(&mut generator, &mut elements, layers);

        let output = generator.generate();
        assert!(matches!(output.result, Err(TileGenerationError::Compression(_))));
        assert_eq!(output.compressed_layers.len(), 1);
    }
}
