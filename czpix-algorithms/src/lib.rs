//! czpix-algorithms: Event clustering for decoded detector frames.
//!
//! This crate provides the thresholded flood-fill clustering engine:
//! - **Growth** - 4-connected breadth-first fill from primary-threshold seeds
//! - **Admission** - secondary (energy floor) threshold per region
//! - **Extension** - optional one-ring 8-neighbour dilation
//!
#![warn(missing_docs)]

mod flood_fill;

pub use flood_fill::{ChunkClusters, FloodFillClustering, FloodFillConfig, FloodFillState};

// Re-export core cluster types
pub use czpix_core::clustering::{Cluster, ClusteringStatistics};
