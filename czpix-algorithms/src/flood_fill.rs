//! Thresholded flood-fill clustering.
//!
//! Key characteristics:
//! - Seeds are valid pixels at or above their primary threshold; every other
//!   pixel is marked checked before growth starts and can never join a region
//! - Regions grow breadth-first over 4-neighbours without row wraparound
//! - A region is admitted if any member reaches its secondary threshold
//! - Extended mode adds a single, non-cascading ring of 8-neighbours
//! - Frame ranges are split across a fixed worker pool; results keep frame order

use czpix_core::calibration::Calibration;
use czpix_core::clustering::{Cluster, ClusteringStatistics};
use czpix_core::frame::CrystalFrames;
use czpix_core::geometry::PixelGrid;
use czpix_core::partition::split_range;
use czpix_core::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::VecDeque;

/// Flood-fill configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FloodFillConfig {
    /// Dilate admitted clusters by one ring of 8-neighbours. Ring pixels
    /// may appear in more than one cluster of a frame.
    pub extended_mode: bool,
}

/// Reusable per-worker scratch buffers.
#[derive(Clone, Debug, Default)]
pub struct FloodFillState {
    checked: Vec<bool>,
    in_cluster: Vec<bool>,
    queue: VecDeque<usize>,
    members: Vec<usize>,
    stats: ClusteringStatistics,
}

impl FloodFillState {
    /// Creates scratch space for frames of `n_pixels` pixels.
    #[must_use]
    pub fn new(n_pixels: usize) -> Self {
        Self {
            checked: vec![false; n_pixels],
            in_cluster: vec![false; n_pixels],
            queue: VecDeque::with_capacity(64),
            members: Vec::with_capacity(64),
            stats: ClusteringStatistics::default(),
        }
    }

    /// Counters accumulated since creation or the last reset.
    #[must_use]
    pub fn statistics(&self) -> ClusteringStatistics {
        self.stats
    }

    /// Clears the counters.
    pub fn reset_statistics(&mut self) {
        self.stats = ClusteringStatistics::default();
    }

    fn prepare(&mut self, n_pixels: usize) {
        if self.checked.len() != n_pixels {
            self.checked.resize(n_pixels, false);
            self.in_cluster.clear();
            self.in_cluster.resize(n_pixels, false);
        }
    }
}

/// Clusters of one crystal over a frame range, in frame order.
#[derive(Clone, Debug, Default)]
pub struct ChunkClusters {
    /// Clusters ordered by frame, then by seed pixel.
    pub clusters: Vec<Cluster>,
    /// Counters summed over every worker.
    pub statistics: ClusteringStatistics,
}

/// Flood-fill clustering engine bound to one pixel grid and worker pool.
pub struct FloodFillClustering {
    grid: PixelGrid,
    config: FloodFillConfig,
    n_threads: usize,
    pool: ThreadPool,
}

impl FloodFillClustering {
    /// Creates an engine with a pool of `n_threads` workers.
    ///
    /// # Errors
    /// Returns [`Error::ThreadPool`] if the pool cannot be built.
    pub fn new(grid: PixelGrid, config: FloodFillConfig, n_threads: usize) -> Result<Self> {
        let n_threads = n_threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("czpix-cluster-{i}"))
            .build()
            .map_err(|err| Error::ThreadPool(err.to_string()))?;
        Ok(Self {
            grid,
            config,
            n_threads,
            pool,
        })
    }

    /// Pixel grid the engine walks.
    #[must_use]
    pub fn grid(&self) -> PixelGrid {
        self.grid
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> FloodFillConfig {
        self.config
    }

    /// Worker count.
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Allocates scratch state sized for this engine's grid.
    #[must_use]
    pub fn create_state(&self) -> FloodFillState {
        FloodFillState::new(self.grid.n_pixels())
    }

    /// Clusters one frame image.
    ///
    /// # Panics
    /// Panics if `frame` or `calibration` does not cover exactly the grid's pixels.
    #[must_use]
    pub fn cluster_frame(
        &self,
        frame: &[u16],
        calibration: &Calibration,
        frame_id: u32,
        state: &mut FloodFillState,
    ) -> Vec<Cluster> {
        let mut clusters = Vec::new();
        self.cluster_frame_into(frame, calibration, frame_id, state, &mut clusters);
        clusters
    }

    /// Clusters one frame image, appending to `out`.
    ///
    /// # Panics
    /// Panics if `frame` or `calibration` does not cover exactly the grid's pixels.
    #[allow(clippy::cast_possible_truncation)]
    pub fn cluster_frame_into(
        &self,
        frame: &[u16],
        calibration: &Calibration,
        frame_id: u32,
        state: &mut FloodFillState,
        out: &mut Vec<Cluster>,
    ) {
        let n_pixels = self.grid.n_pixels();
        assert_eq!(frame.len(), n_pixels, "frame size does not match pixel grid");
        assert_eq!(
            calibration.n_pixels(),
            n_pixels,
            "calibration size does not match pixel grid"
        );

        state.prepare(n_pixels);
        for (pixel, (checked, &adu)) in state.checked.iter_mut().zip(frame).enumerate() {
            *checked = !calibration.is_seed(pixel, adu);
        }
        state.stats.frames_processed += 1;

        for seed in 0..n_pixels {
            if state.checked[seed] {
                continue;
            }
            self.grow_region(seed, state);
            state.stats.regions_found += 1;

            let admitted = state
                .members
                .iter()
                .any(|&pixel| calibration.passes_secondary(pixel, frame[pixel]));
            if !admitted {
                state.stats.regions_rejected += 1;
                continue;
            }

            if self.config.extended_mode {
                self.extend_region(state);
            }

            let mut cluster = Cluster::with_capacity(frame_id, state.members.len());
            for &pixel in &state.members {
                let adu = frame[pixel];
                cluster.push(pixel as u32, adu, calibration.energy(pixel, adu));
            }
            out.push(cluster);
            state.stats.clusters_emitted += 1;
        }
    }

    /// Breadth-first 4-connected growth from `seed` into `state.members`.
    fn grow_region(&self, seed: usize, state: &mut FloodFillState) {
        state.members.clear();
        state.queue.clear();
        state.queue.push_back(seed);

        while let Some(pixel) = state.queue.pop_front() {
            if state.checked[pixel] {
                continue;
            }
            state.checked[pixel] = true;
            state.members.push(pixel);
            for neighbor in self.grid.neighbors4(pixel) {
                if !state.checked[neighbor] {
                    state.queue.push_back(neighbor);
                }
            }
        }
    }

    /// Appends every 8-neighbour of the grown core that is not yet a member.
    ///
    /// Frame-level `checked` flags are left untouched, so ring pixels can be
    /// shared between clusters of the same frame: a ring pixel may also sit
    /// in another cluster's ring, or be the seed or core member of a later
    /// cluster. Only grown cores are disjoint.
    fn extend_region(&self, state: &mut FloodFillState) {
        for &pixel in &state.members {
            state.in_cluster[pixel] = true;
        }

        let core = state.members.len();
        for i in 0..core {
            let pixel = state.members[i];
            for neighbor in self.grid.neighbors8(pixel) {
                if !state.in_cluster[neighbor] {
                    state.in_cluster[neighbor] = true;
                    state.members.push(neighbor);
                }
            }
        }

        for &pixel in &state.members {
            state.in_cluster[pixel] = false;
        }
        state.stats.pixels_extended += state.members.len() - core;
    }

    /// Clusters the first `n_frames` slots of `frames` in parallel.
    ///
    /// Slot `s` is reported as frame `start_frame_id + s`. Slots are split
    /// into contiguous ranges, one per worker, and the per-range results are
    /// concatenated in slot order.
    ///
    /// # Errors
    /// Returns [`Error::FrameRange`] if `n_frames` exceeds the slots in
    /// `frames` or the frame ids overflow 32 bits, and
    /// [`Error::CalibrationLength`] if the calibration does not match the grid.
    #[allow(clippy::cast_possible_truncation)]
    pub fn cluster_chunk(
        &self,
        frames: CrystalFrames<'_>,
        n_frames: usize,
        calibration: &Calibration,
        start_frame_id: u32,
    ) -> Result<ChunkClusters> {
        let end_frame_id = u64::from(start_frame_id) + n_frames as u64;
        if n_frames > frames.n_frames() || end_frame_id > u64::from(u32::MAX) + 1 {
            return Err(Error::FrameRange {
                start: u64::from(start_frame_id),
                end: end_frame_id,
                capacity: frames.n_frames(),
            });
        }
        for (field, actual) in [
            ("frame", frames.n_pixels()),
            ("calibration", calibration.n_pixels()),
        ] {
            if actual != self.grid.n_pixels() {
                return Err(Error::CalibrationLength {
                    field,
                    expected: self.grid.n_pixels(),
                    actual,
                });
            }
        }

        let ranges = split_range(0..n_frames, self.n_threads);
        let parts: Vec<(Vec<Cluster>, ClusteringStatistics)> = self.pool.install(|| {
            ranges
                .par_iter()
                .map(|range| {
                    let mut state = self.create_state();
                    let mut clusters = Vec::new();
                    for slot in range.clone() {
                        let frame_id = start_frame_id + slot as u32;
                        self.cluster_frame_into(
                            frames.frame(slot),
                            calibration,
                            frame_id,
                            &mut state,
                            &mut clusters,
                        );
                    }
                    (clusters, state.statistics())
                })
                .collect()
        });

        let mut result = ChunkClusters {
            clusters: Vec::with_capacity(parts.iter().map(|(c, _)| c.len()).sum()),
            statistics: ClusteringStatistics::default(),
        };
        for (clusters, statistics) in parts {
            result.clusters.extend(clusters);
            result.statistics += statistics;
        }

        log::debug!(
            "clustered frames {}..{}: {} regions, {} rejected, {} clusters",
            start_frame_id,
            end_frame_id,
            result.statistics.regions_found,
            result.statistics.regions_rejected,
            result.statistics.clusters_emitted
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use czpix_core::calibration::uniform_record;

    fn calibration(n_pixels: usize) -> Calibration {
        // primary 10 ADU, secondary 10 + 5 keV / 1 keV/ADU = 15 ADU
        Calibration::from_record(uniform_record(n_pixels, 1.0, 0.0, 10.0), None, n_pixels, 5.0)
            .unwrap()
    }

    fn engine(extended_mode: bool) -> FloodFillClustering {
        FloodFillClustering::new(PixelGrid::new(4, 16), FloodFillConfig { extended_mode }, 1)
            .unwrap()
    }

    #[test]
    fn test_region_grows_across_four_neighbours() {
        let engine = engine(false);
        let mut frame = [0u16; 16];
        frame[5] = 20;
        frame[6] = 11;
        frame[10] = 12;
        let mut state = engine.create_state();
        let clusters = engine.cluster_frame(&frame, &calibration(16), 0, &mut state);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].pixel_ids, vec![5, 6, 10]);
        assert_eq!(clusters[0].adus, vec![20, 11, 12]);
    }

    #[test]
    fn test_diagonal_pixels_are_separate_regions() {
        let engine = engine(false);
        let mut frame = [0u16; 16];
        frame[0] = 20;
        frame[5] = 20;
        let mut state = engine.create_state();
        let clusters = engine.cluster_frame(&frame, &calibration(16), 0, &mut state);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_extension_deduplicates_shared_neighbours() {
        let engine = engine(true);
        let mut frame = [0u16; 16];
        frame[5] = 20;
        frame[6] = 20;
        let mut state = engine.create_state();
        let clusters = engine.cluster_frame(&frame, &calibration(16), 0, &mut state);

        assert_eq!(clusters.len(), 1);
        let mut ids = clusters[0].pixel_ids.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(&clusters[0].pixel_ids[..2], &[5, 6]);
        assert_eq!(state.statistics().pixels_extended, 10);
    }

    #[test]
    fn test_state_is_reusable_across_frames() {
        let engine = engine(false);
        let calibration = calibration(16);
        let mut state = engine.create_state();
        let mut frame = [0u16; 16];
        frame[3] = 30;
        assert_eq!(engine.cluster_frame(&frame, &calibration, 0, &mut state).len(), 1);
        frame[3] = 0;
        assert!(engine.cluster_frame(&frame, &calibration, 1, &mut state).is_empty());
        assert_eq!(state.statistics().frames_processed, 2);
        state.reset_statistics();
        assert_eq!(state.statistics(), ClusteringStatistics::default());
    }
}
