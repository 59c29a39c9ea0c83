//! Cluster (event) types and clustering statistics.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// A connected group of pixels in one frame, attributed to a single interaction.
///
/// The three pixel vectors are parallel and in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cluster {
    /// Absolute frame id in the raw file.
    pub frame_id: u32,
    /// Logical pixel ids of the members.
    pub pixel_ids: Vec<u32>,
    /// Raw ADU value of each member.
    pub adus: Vec<u16>,
    /// Calibrated energy (keV) of each member.
    pub energies: Vec<f32>,
}

impl Cluster {
    /// Creates an empty cluster for `frame_id`.
    #[must_use]
    pub fn new(frame_id: u32) -> Self {
        Self {
            frame_id,
            ..Self::default()
        }
    }

    /// Creates an empty cluster with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(frame_id: u32, capacity: usize) -> Self {
        Self {
            frame_id,
            pixel_ids: Vec::with_capacity(capacity),
            adus: Vec::with_capacity(capacity),
            energies: Vec::with_capacity(capacity),
        }
    }

    /// Adds a member pixel.
    pub fn push(&mut self, pixel_id: u32, adu: u16, energy: f32) {
        self.pixel_ids.push(pixel_id);
        self.adus.push(adu);
        self.energies.push(energy);
    }

    /// Returns the number of member pixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pixel_ids.len()
    }

    /// Returns true if the cluster has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixel_ids.is_empty()
    }

    /// Sum of member energies.
    #[must_use]
    pub fn total_energy(&self) -> f32 {
        self.energies.iter().sum()
    }

    /// Iterates `(pixel_id, adu, energy)` per member.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u16, f32)> + '_ {
        self.pixel_ids
            .iter()
            .zip(&self.adus)
            .zip(&self.energies)
            .map(|((&pixel, &adu), &energy)| (pixel, adu, energy))
    }
}

/// Counters accumulated while clustering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusteringStatistics {
    /// Frames scanned.
    pub frames_processed: usize,
    /// Connected regions grown from a seed.
    pub regions_found: usize,
    /// Regions rejected by the secondary threshold.
    pub regions_rejected: usize,
    /// Clusters emitted.
    pub clusters_emitted: usize,
    /// Member pixels added by extension.
    pub pixels_extended: usize,
}

impl AddAssign for ClusteringStatistics {
    fn add_assign(&mut self, other: Self) {
        self.frames_processed += other.frames_processed;
        self.regions_found += other.regions_found;
        self.regions_rejected += other.regions_rejected;
        self.clusters_emitted += other.clusters_emitted;
        self.pixels_extended += other.pixels_extended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cluster_operations() {
        let mut cluster = Cluster::with_capacity(12, 3);
        assert!(cluster.is_empty());

        cluster.push(5, 120, 30.0);
        cluster.push(6, 80, 12.5);

        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.frame_id, 12);
        assert_relative_eq!(cluster.total_energy(), 42.5);
        let members: Vec<_> = cluster.iter().collect();
        assert_eq!(members, vec![(5, 120, 30.0), (6, 80, 12.5)]);
    }

    #[test]
    fn test_statistics_accumulate() {
        let mut total = ClusteringStatistics::default();
        total += ClusteringStatistics {
            frames_processed: 3,
            regions_found: 2,
            regions_rejected: 1,
            clusters_emitted: 1,
            pixels_extended: 4,
        };
        total += ClusteringStatistics {
            frames_processed: 1,
            ..Default::default()
        };
        assert_eq!(total.frames_processed, 4);
        assert_eq!(total.pixels_extended, 4);
    }
}
