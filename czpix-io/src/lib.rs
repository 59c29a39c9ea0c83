//! czpix-io: Raw stream decoding and cluster file I/O for czpix.
//!
//! This crate provides the chunked parallel raw-frame decoder, the bucketed
//! binary cluster writer and its memory-mapped reader, configuration and
//! calibration loading (JSON, and HDF5 with the `hdf5` feature), and the
//! raw-to-clusters pipeline.
//!

pub mod calibration;
pub mod config;
pub mod decoder;
mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod pipeline;
mod reader;
pub mod writer;

pub use calibration::{is_hdf5_path, CrystalEntry, JsonCalibrationStore, ThresholdSource};
pub use config::{load_run_config, parse_legacy_config};
pub use decoder::{DecodeStats, FileLayout, RawFrameDecoder};
pub use error::{Error, Result};
#[cfg(feature = "hdf5")]
pub use self::hdf5::{read_calibration_hdf5, read_thresholds_hdf5, Hdf5CalibrationStore};
pub use pipeline::{ClusterPipeline, PipelineSummary};
pub use reader::{ClusterFileReader, ClusterRecords};
pub use writer::{write_clusters, AppendCounts, ClusterFileSet};
