//! Error types for czpix-core.

use thiserror::Error;

/// Result type alias for czpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for czpix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Geometry parameters are inconsistent.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A calibration array does not have one entry per logical pixel.
    #[error("calibration dataset `{field}` has {actual} entries, expected {expected}")]
    CalibrationLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Calibration content error.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// Crystal id outside `[0, n_crystals)`.
    #[error("crystal {crystal} out of range (detector has {n_crystals} crystals)")]
    CrystalOutOfRange { crystal: usize, n_crystals: usize },

    /// Requested frame range does not fit the frame buffer.
    #[error("frame range {start}..{end} does not fit a buffer of {capacity} frames")]
    FrameRange {
        start: u64,
        end: u64,
        capacity: usize,
    },

    /// Worker pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

