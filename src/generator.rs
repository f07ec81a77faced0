//! Owns the live nav-mesh & keeps it up to date.
//!
//! Dirty areas are turned into a queue of pending tiles. Every tick the nearest pending tiles are handed to
//! [TileGenerator]s running on the [AsyncComputeTaskPool], and finished builds are merged into the [TiledNavMesh] on
//! the calling thread. Only one build per tile coordinate is ever in flight.

use std::{
    ops::{BitOr, BitOrAssign},
    sync::Arc,
};

use bevy::{
    log::{debug, error, info, warn},
    math::{IVec2, Vec2, Vec3},
    platform::collections::HashMap,
    prelude::Resource,
    tasks::{block_on, futures_lite::future, AsyncComputeTaskPool, Task},
};

use crate::{
    compression::CompressedLayer,
    coords::{world_to_recast, BoundingBox},
    element::{ElementId, NavigationElement, NavigationElementIndex},
    error::TileGenerationError,
    settings::{BuildConfig, NavMeshSettings},
    tile_generator::{TileGenerationOutput, TileGenerator, TileSetupContext},
    tiles::{NavMesh, TileRef, TiledNavMesh, POLY_BITS, TILE_BITS},
    voxel_cache::RasterizationScratchPool,
};

/// What changed inside a [DirtyArea].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    pub const NONE: Self = Self(0);
    /// Geometry changed, voxelization has to be redone.
    pub const GEOMETRY: Self = Self(1 << 0);
    /// Also dirty the area below the box up to the agent's height.
    pub const USE_AGENT_HEIGHT: Self = Self(1 << 1);
    /// Navigation bounds changed. Tiles outside of the current bounds are affected too.
    pub const NAVIGATION_BOUNDS: Self = Self(1 << 2);

    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// World space box that needs to be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirtyArea {
    pub bounds: BoundingBox,
    pub flags: DirtyFlags,
}

impl DirtyArea {
    pub fn new(bounds: BoundingBox, flags: DirtyFlags) -> Self {
        Self { bounds, flags }
    }
}

/// Tile waiting to be built.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTile {
    pub coord: IVec2,
    /// Voxelize again instead of reusing compressed layers.
    pub rebuild_geometry: bool,
    /// Areas changed since the last build. Empty when ``rebuild_geometry`` is set.
    pub dirty_areas: Vec<BoundingBox>,
}

struct RunningTile {
    coord: IVec2,
    task: Task<TileGenerationOutput>,
    /// What this build was started for, carried over to the next build when it gets discarded.
    request: PendingTile,
    /// Set when the tile got dirty again while building. Only the compressed layers of the result are kept.
    discard: bool,
}

/// Counters of finished builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub compressed_layer_builds: usize,
    pub navigation_layer_builds: usize,
    pub failed_builds: usize,
    pub discarded_builds: usize,
}

/// Average layers per tile used to size the tiled nav-mesh.
const AVERAGE_LAYERS_PER_TILE: u64 = 8;

/// Schedules tile builds & merges their results into the live nav-mesh.
#[derive(Resource)]
pub struct NavMeshGenerator {
    config: Arc<BuildConfig>,
    nav_mesh: NavMesh,
    elements: NavigationElementIndex,
    scratch_pool: RasterizationScratchPool,

    inclusion_bounds: Vec<BoundingBox>,
    total_bounds: BoundingBox,

    pending: Vec<PendingTile>,
    running: Vec<RunningTile>,
    /// Compressed layers of finished tiles, taken by the next build of the same tile.
    intermediate_layers: HashMap<IVec2, Vec<CompressedLayer>>,
    seed_locations: Vec<Vec3>,

    max_tile_generation_jobs: usize,
    /// Bumped whenever the tiled nav-mesh is reallocated. Builds from an older version are discarded.
    version: u64,
    stats: GeneratorStats,
}

impl NavMeshGenerator {
    pub fn new(settings: &NavMeshSettings) -> Result<Self, TileGenerationError> {
        let config = BuildConfig::from_settings(settings)?;

        let max_tile_generation_jobs = settings.max_tile_generation_tasks.map_or_else(
            || {
                let workers = std::thread::available_parallelism().map_or(1, |workers| workers.get());

                (workers * 2).max(1)
            },
            |max| usize::from(max.get()),
        );
        info!("Using max of {max_tile_generation_jobs} workers to build navigation.");

        Ok(Self {
            config: Arc::new(config),
            nav_mesh: NavMesh::default(),
            elements: NavigationElementIndex::default(),
            scratch_pool: RasterizationScratchPool::default(),
            inclusion_bounds: Vec::new(),
            total_bounds: BoundingBox::EMPTY,
            pending: Vec::new(),
            running: Vec::new(),
            intermediate_layers: HashMap::default(),
            seed_locations: Vec::new(),
            max_tile_generation_jobs,
            version: 0,
            stats: GeneratorStats::default(),
        })
    }

    /// Handle to the live nav-mesh. Stays valid when the nav-mesh is reconstructed.
    pub fn nav_mesh(&self) -> NavMesh {
        self.nav_mesh.clone()
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn elements(&self) -> &NavigationElementIndex {
        &self.elements
    }

    pub fn stats(&self) -> GeneratorStats {
        self.stats
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn max_tile_generation_jobs(&self) -> usize {
        self.max_tile_generation_jobs
    }

    pub fn total_bounds(&self) -> BoundingBox {
        self.total_bounds
    }

    pub fn inclusion_bounds(&self) -> &[BoundingBox] {
        &self.inclusion_bounds
    }

    pub fn pending_tiles(&self) -> &[PendingTile] {
        &self.pending
    }

    pub fn running_tiles(&self) -> impl Iterator<Item = IVec2> + '_ {
        self.running.iter().map(|running| running.coord)
    }

    /// Compressed layers cached for a tile.
    pub fn compressed_layers(&self, coord: IVec2) -> Option<&[CompressedLayer]> {
        self.intermediate_layers.get(&coord).map(Vec::as_slice)
    }

    /// Replaces the navigation bounds. Tiles covered by either the old or the new bounds are rebuilt.
    pub fn set_inclusion_bounds(&mut self, inclusion_bounds: Vec<BoundingBox>) {
        let old_bounds = std::mem::replace(
            &mut self.inclusion_bounds,
            inclusion_bounds.into_iter().filter(BoundingBox::is_valid).collect(),
        );
        self.update_navigation_bounds();

        let capacity = self
            .nav_mesh
            .get()
            .read()
            .map(|nav_mesh| nav_mesh.max_tiles())
            .unwrap_or_default();
        if self.required_max_tiles() > capacity {
            self.construct_tiled_nav_mesh();
            return;
        }

        let flags = DirtyFlags::GEOMETRY | DirtyFlags::NAVIGATION_BOUNDS;
        let dirty_areas: Vec<DirtyArea> = old_bounds
            .iter()
            .chain(self.inclusion_bounds.iter())
            .map(|bounds| DirtyArea::new(*bounds, flags))
            .collect();
        self.mark_dirty_tiles(&dirty_areas);
    }

    /// Recomputes the total bounds from the inclusion bounds.
    ///
    /// Cached voxels are quantized against the total bounds, so they are dropped when those change.
    pub fn update_navigation_bounds(&mut self) {
        let total_bounds = self
            .inclusion_bounds
            .iter()
            .fold(BoundingBox::EMPTY, |total, bounds| total.union(bounds));

        if total_bounds != self.total_bounds {
            debug!("Navigation bounds changed, clearing voxel caches.");
            self.elements.clear_voxel_caches();
        }
        self.total_bounds = total_bounds;
    }

    fn required_max_tiles(&self) -> usize {
        if !self.total_bounds.is_valid() {
            return 0;
        }

        let (min, max) = self.config.tile_range(&self.total_bounds);
        let tiles = (i64::from(max.x - min.x) + 1) as u64 * (i64::from(max.y - min.y) + 1) as u64;
        let requested = tiles.saturating_mul(AVERAGE_LAYERS_PER_TILE);
        let max_tiles = 1u64 << TILE_BITS;
        if requested > max_tiles {
            warn!("Navigation bounds need {requested} tiles, capping at {max_tiles}.");
        }

        requested.min(max_tiles) as usize
    }

    /// Cancels all builds, reallocates the tiled nav-mesh & schedules a full rebuild.
    pub fn construct_tiled_nav_mesh(&mut self) {
        self.cancel_build();
        self.version += 1;
        self.intermediate_layers.clear();
        self.elements.clear_voxel_caches();

        let max_tiles = self.required_max_tiles();
        match self.nav_mesh.get().write() {
            Ok(mut nav_mesh) => *nav_mesh = TiledNavMesh::new(max_tiles, 1 << POLY_BITS),
            Err(error) => {
                error!("Nav-Mesh lock has been poisoned: {error}");
                return;
            }
        }
        debug!("Constructed tiled nav-mesh (version {}) for {max_tiles} tiles.", self.version);

        self.rebuild_all();
    }

    /// Marks everything inside the navigation bounds dirty.
    pub fn rebuild_all(&mut self) {
        let flags = DirtyFlags::GEOMETRY | DirtyFlags::NAVIGATION_BOUNDS;
        let dirty_areas: Vec<DirtyArea> = self
            .inclusion_bounds
            .iter()
            .map(|bounds| DirtyArea::new(*bounds, flags))
            .collect();

        self.mark_dirty_tiles(&dirty_areas);
    }

    /// Grows a box by the border used while voxelizing so everything that can affect a tile is covered.
    pub fn grow_bounding_box(&self, bounds: &BoundingBox, include_agent_height: bool) -> BoundingBox {
        self.config.grow_bounding_box(bounds, include_agent_height)
    }

    /// Adds or replaces an element, dirtying the old & new bounds.
    pub fn insert_element(&mut self, id: ElementId, element: NavigationElement) {
        let mut dirty_areas = Vec::with_capacity(2);
        if let Some(old) = self.elements.get(id) {
            dirty_areas.push(DirtyArea::new(old.bounds(), element_dirty_flags(old)));
        }
        dirty_areas.push(DirtyArea::new(element.bounds(), element_dirty_flags(&element)));

        self.elements.insert(id, element);
        self.mark_dirty_tiles(&dirty_areas);
    }

    /// Removes an element, dirtying the area it covered.
    pub fn remove_element(&mut self, id: ElementId) -> Option<NavigationElement> {
        let element = self.elements.get(id).cloned()?;
        let bounds = self.elements.remove(id)?;

        self.mark_dirty_tiles(&[DirtyArea::new(bounds, element_dirty_flags(&element))]);

        Some(element)
    }

    /// Locations builds are prioritized around, usually the players. The world origin is used when empty.
    pub fn set_seed_locations(&mut self, seed_locations: Vec<Vec3>) {
        self.seed_locations = seed_locations;
    }

    /// Queues every tile touched by ``dirty_areas``, merging with tiles already pending.
    pub fn mark_dirty_tiles(&mut self, dirty_areas: &[DirtyArea]) {
        if dirty_areas.is_empty() {
            return;
        }

        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Mark dirty tiles").entered();

        let mut dirty_tiles: HashMap<IVec2, PendingTile> = HashMap::default();
        for area in dirty_areas.iter().filter(|area| area.bounds.is_valid()) {
            let expands_bounds = area.flags.contains(DirtyFlags::NAVIGATION_BOUNDS);
            let rebuild_geometry = area.flags.contains(DirtyFlags::GEOMETRY);

            // Changed navigation bounds are used as is, everything else is cut down to the bounds before growing.
            let bounds = if expands_bounds {
                area.bounds
            } else {
                let Some(clipped) = area.bounds.intersection(&self.total_bounds) else {
                    continue;
                };
                self.config
                    .grow_bounding_box(&clipped, area.flags.contains(DirtyFlags::USE_AGENT_HEIGHT))
            };

            let (min, max) = self.config.tile_range(&bounds);
            for y in min.y..=max.y {
                for x in min.x..=max.x {
                    let coord = IVec2::new(x, y);
                    if !expands_bounds {
                        let tile_bounds = self.config.tile_bounds(coord, &self.total_bounds);
                        if !self.inclusion_bounds.iter().any(|inclusion| inclusion.intersects(&tile_bounds)) {
                            continue;
                        }
                    }

                    let entry = dirty_tiles.entry(coord).or_insert_with(|| PendingTile {
                        coord,
                        rebuild_geometry: false,
                        dirty_areas: Vec::new(),
                    });
                    merge_pending(entry, rebuild_geometry, &area.bounds);
                }
            }
        }

        for (coord, mut tile) in dirty_tiles {
            // A build still running for this tile works on outdated input, its work is redone by the next build.
            if let Some(running) = self
                .running
                .iter_mut()
                .find(|running| running.coord == coord && !running.discard)
            {
                running.discard = true;
                absorb_request(&mut tile, &running.request);
            }

            match self.pending.iter_mut().find(|pending| pending.coord == coord) {
                Some(pending) => {
                    if tile.rebuild_geometry {
                        pending.rebuild_geometry = true;
                        pending.dirty_areas.clear();
                    } else if !pending.rebuild_geometry {
                        pending.dirty_areas.extend(tile.dirty_areas);
                    }
                }
                None => self.pending.push(tile),
            }
        }

        self.sort_pending_build_tiles();
    }

    /// Sorts pending tiles so the ones nearest to a seed location are at the back of the queue, built first.
    pub fn sort_pending_build_tiles(&mut self) {
        let seeds: Vec<Vec2> = if self.seed_locations.is_empty() {
            vec![Vec2::ZERO]
        } else {
            self.seed_locations
                .iter()
                .map(|seed| {
                    let recast = world_to_recast(*seed);
                    Vec2::new(recast.x, recast.z)
                })
                .collect()
        };
        let tile_width = self.config.tile_width();

        let distance = |coord: IVec2| {
            let center = (coord.as_vec2() + 0.5) * tile_width;
            seeds
                .iter()
                .map(|seed| seed.distance_squared(center))
                .fold(f32::INFINITY, f32::min)
        };

        self.pending.sort_by(|a, b| {
            distance(b.coord)
                .total_cmp(&distance(a.coord))
                .then_with(|| (b.coord.y, b.coord.x).cmp(&(a.coord.y, a.coord.x)))
        });
    }

    pub fn num_remaining_build_tasks(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    pub fn num_running_build_tasks(&self) -> usize {
        self.running.len()
    }

    /// Whether builds are running. With ``check_dirty`` pending tiles count too.
    pub fn is_build_in_progress(&self, check_dirty: bool) -> bool {
        !self.running.is_empty() || (check_dirty && !self.pending.is_empty())
    }

    /// Starts & finishes builds without blocking. Returns the references of every tile added or removed.
    pub fn tick_async_build(&mut self) -> Vec<TileRef> {
        self.process_tile_tasks(self.max_tile_generation_jobs)
    }

    /// Starts up to ``budget`` builds, as long as the concurrency limit allows, then merges finished ones.
    pub fn process_tile_tasks(&mut self, budget: usize) -> Vec<TileRef> {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Process tile tasks").entered();

        let mut affected = Vec::new();

        let available = self.max_tile_generation_jobs.saturating_sub(self.running.len());
        let mut to_start = budget.min(available);
        let mut index = self.pending.len();
        while to_start > 0 && index > 0 {
            index -= 1;
            let coord = self.pending[index].coord;
            if self.running.iter().any(|running| running.coord == coord) {
                continue;
            }

            let pending = self.pending.remove(index);
            if let Some(removed) = self.start_build(pending) {
                affected.extend(removed);
            } else {
                to_start -= 1;
            }
        }

        let mut i = 0;
        while i < self.running.len() {
            let finished = block_on(future::poll_once(&mut self.running[i].task));
            match finished {
                Some(output) => {
                    let running = self.running.swap_remove(i);
                    affected.extend(self.merge_output(output, running.discard));
                }
                None => i += 1,
            }
        }

        affected
    }

    /// Sets up a generator & spawns it. Tiles without anything to build are removed right away, returning the removed tiles.
    fn start_build(&mut self, pending: PendingTile) -> Option<Vec<TileRef>> {
        let dirty_areas = if pending.rebuild_geometry {
            Vec::new()
        } else {
            pending.dirty_areas.clone()
        };
        let previous_layers = self.intermediate_layers.remove(&pending.coord).unwrap_or_default();

        let mut generator = TileGenerator::new(pending.coord, self.version, self.config.clone(), dirty_areas);
        generator.setup(
            TileSetupContext {
                total_bounds: &self.total_bounds,
                inclusion_bounds: &self.inclusion_bounds,
                elements: &mut self.elements,
                scratch_pool: &self.scratch_pool,
            },
            previous_layers,
        );

        if !generator.has_data_to_build() {
            return Some(self.remove_layers(pending.coord, 0));
        }

        let task = AsyncComputeTaskPool::get().spawn(async move { generator.generate() });
        self.running.push(RunningTile {
            coord: pending.coord,
            task,
            request: pending,
            discard: false,
        });

        None
    }

    /// Removes every layer of a tile at or above ``first_layer``.
    fn remove_layers(&mut self, coord: IVec2, first_layer: usize) -> Vec<TileRef> {
        let nav_mesh = self.nav_mesh.get();
        let Ok(mut nav_mesh) = nav_mesh.write() else {
            error!("Nav-Mesh lock has been poisoned. Generation can no longer be continued.");
            return Vec::new();
        };

        let stale: Vec<TileRef> = nav_mesh
            .tiles_at(coord.x, coord.y)
            .into_iter()
            .filter(|tile_ref| {
                nav_mesh
                    .tile(*tile_ref)
                    .is_some_and(|tile| usize::from(tile.header.layer) >= first_layer)
            })
            .collect();
        for tile_ref in stale.iter() {
            nav_mesh.remove_tile(*tile_ref);
        }

        stale
    }

    /// Merges a finished build into the live nav-mesh.
    ///
    /// A discarded build only hands back its compressed layers, the tile is already queued again.
    fn merge_output(&mut self, output: TileGenerationOutput, discard: bool) -> Vec<TileRef> {
        if output.version != self.version {
            debug!(
                "Discarding build of tile ({},{}) from nav-mesh version {}.",
                output.tile.x, output.tile.y, output.version
            );
            self.stats.discarded_builds += 1;
            return Vec::new();
        }

        let coord = output.tile;
        if !output.compressed_layers.is_empty() {
            self.intermediate_layers.insert(coord, output.compressed_layers);
        }

        if discard {
            debug!("Discarding outdated build of tile ({},{}).", coord.x, coord.y);
            self.stats.discarded_builds += 1;
            return Vec::new();
        }

        let result = match output.result {
            Ok(result) => result,
            Err(_) => {
                self.stats.failed_builds += 1;
                return Vec::new();
            }
        };

        if result.stats.regenerated_compressed_layers {
            self.stats.compressed_layer_builds += 1;
        }
        self.stats.navigation_layer_builds += result.stats.navigation_layers_built;

        let nav_mesh = self.nav_mesh.get();
        let Ok(mut nav_mesh) = nav_mesh.write() else {
            error!("Nav-Mesh lock has been poisoned. Generation can no longer be continued.");
            return Vec::new();
        };

        let mut affected = Vec::new();
        for layer in result.navigation_layers.iter() {
            if let Some(old) = nav_mesh.get_tile_at(coord.x, coord.y, layer.layer_index) {
                nav_mesh.remove_tile(old);
                affected.push(old);
            }
        }
        if let Some(layer_count) = result.layer_count {
            for old in nav_mesh.tiles_at(coord.x, coord.y) {
                if nav_mesh
                    .tile(old)
                    .is_some_and(|tile| usize::from(tile.header.layer) >= layer_count)
                {
                    nav_mesh.remove_tile(old);
                    affected.push(old);
                }
            }
        }

        for layer in result.navigation_layers {
            let Some(data) = layer.data else {
                continue;
            };

            match nav_mesh.add_tile(data) {
                Ok(tile_ref) => affected.push(tile_ref),
                Err(add_error) => error!(
                    "Failed to add tile ({},{}:{}) to the nav-mesh: {add_error}",
                    coord.x, coord.y, layer.layer_index
                ),
            }
        }

        affected
    }

    /// Blocks until every pending & running build has finished & been merged.
    pub fn ensure_build_completion(&mut self) -> Vec<TileRef> {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("Ensure build completion").entered();

        let mut affected = Vec::new();
        while self.is_build_in_progress(true) {
            affected.extend(self.process_tile_tasks(usize::MAX));

            for running in std::mem::take(&mut self.running) {
                let output = block_on(running.task);
                affected.extend(self.merge_output(output, running.discard));
            }
        }

        affected
    }

    /// Waits for running builds without merging them & drops everything pending.
    ///
    /// Cancelled builds took their tile's compressed layers with them, so every cached layer is dropped and the next
    /// build of any tile voxelizes again.
    pub fn cancel_build(&mut self) {
        for running in self.running.drain(..) {
            drop(block_on(running.task));
            self.stats.discarded_builds += 1;
        }
        self.pending.clear();
        self.intermediate_layers.clear();
    }
}

fn element_dirty_flags(element: &NavigationElement) -> DirtyFlags {
    let mut flags = DirtyFlags::NONE;
    if element.has_geometry() {
        flags |= DirtyFlags::GEOMETRY;
    }
    if element
        .area_modifiers
        .as_ref()
        .is_some_and(|modifiers| modifiers.areas.iter().any(|area| area.include_agent_height))
    {
        flags |= DirtyFlags::USE_AGENT_HEIGHT;
    }

    flags
}

/// Adds everything a discarded build was started for to the tile queued after it.
fn absorb_request(pending: &mut PendingTile, request: &PendingTile) {
    if request.rebuild_geometry {
        pending.rebuild_geometry = true;
        pending.dirty_areas.clear();
        return;
    }

    for bounds in request.dirty_areas.iter() {
        merge_pending(pending, false, bounds);
    }
}

/// Accumulates a dirty box into a pending tile. Geometry rebuilds subsume area-only changes.
fn merge_pending(pending: &mut PendingTile, rebuild_geometry: bool, bounds: &BoundingBox) {
    if pending.rebuild_geometry {
        return;
    }

    if rebuild_geometry {
        pending.rebuild_geometry = true;
        pending.dirty_areas.clear();
    } else {
        pending.dirty_areas.push(*bounds);
    }
}
