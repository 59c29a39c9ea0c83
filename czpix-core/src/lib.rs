//! czpix-core: Core types for pixelated crystal detector data processing.
//!
//! This crate provides the run configuration, the readout geometry remap,
//! per-pixel calibration, the shared frame buffer and the cluster types
//! used by the decoding and clustering stages.
//!

pub mod calibration;
pub mod clustering;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod partition;

pub use calibration::{
    load_calibrations, Calibration, CalibrationSource, CrystalCalibration,
    InMemoryCalibrationStore,
};
pub use clustering::{Cluster, ClusteringStatistics};
pub use config::RunConfig;
pub use error::{Error, Result};
pub use frame::{CrystalFrames, FrameBuffer, FramesMut};
pub use geometry::{build_pixel_order, GeometryConfig, PixelGrid, PixelOrder};
pub use partition::split_range;
