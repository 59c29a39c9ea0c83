//! Run-wide configuration.
//!
//! A [`RunConfig`] is built once (usually by `czpix-io` from a config file),
//! validated, and then handed by reference to every component.

use crate::geometry::GeometryConfig;
use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest logical pixel count whose ids fit the 16-bit cluster file field.
pub const MAX_LOGICAL_PIXELS: usize = 1 << 16;

/// Default frames per decoder read.
pub const DEFAULT_DECODE_CHUNK_FRAMES: usize = 2000;

/// Default largest cluster size that gets its own output file.
pub const DEFAULT_MAX_EVENT_PIXELS: usize = 9;

/// Configuration for one processing run.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunConfig {
    /// Crystal geometry and readout multiplexing.
    pub geometry: GeometryConfig,
    /// Number of crystals interleaved in the raw stream.
    pub n_crystals: usize,
    /// Frames buffered per flow (frame buffer capacity).
    pub max_frames_size: usize,
    /// Worker threads for decoding and clustering.
    pub n_threads: usize,
    /// Frames read from disk per decoder sub-chunk.
    #[cfg_attr(feature = "serde", serde(default = "default_decode_chunk_frames"))]
    pub decode_chunk_frames: usize,
    /// Per-crystal minimum event energy (keV) used to derive secondary thresholds.
    pub secondary_threshold: Vec<f32>,
    /// Largest cluster size written to a bucket file.
    #[cfg_attr(feature = "serde", serde(default = "default_max_event_pixels"))]
    pub max_event_pixels: usize,
}

#[cfg(feature = "serde")]
fn default_decode_chunk_frames() -> usize {
    DEFAULT_DECODE_CHUNK_FRAMES
}

#[cfg(feature = "serde")]
fn default_max_event_pixels() -> usize {
    DEFAULT_MAX_EVENT_PIXELS
}

impl RunConfig {
    /// Creates a configuration with default chunking and bucket limits.
    #[must_use]
    pub fn new(
        geometry: GeometryConfig,
        n_crystals: usize,
        max_frames_size: usize,
        n_threads: usize,
        secondary_threshold: Vec<f32>,
    ) -> Self {
        Self {
            geometry,
            n_crystals,
            max_frames_size,
            n_threads,
            decode_chunk_frames: DEFAULT_DECODE_CHUNK_FRAMES,
            secondary_threshold,
            max_event_pixels: DEFAULT_MAX_EVENT_PIXELS,
        }
    }

    /// Sets the decoder sub-chunk size.
    #[must_use]
    pub fn with_decode_chunk_frames(mut self, frames: usize) -> Self {
        self.decode_chunk_frames = frames;
        self
    }

    /// Sets the largest bucketed cluster size.
    #[must_use]
    pub fn with_max_event_pixels(mut self, pixels: usize) -> Self {
        self.max_event_pixels = pixels;
        self
    }

    /// Samples in one raw frame (all crystals, all premerge pixels).
    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        self.n_crystals * self.geometry.n_pixels_premerge
    }

    /// Bytes in one raw frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * std::mem::size_of::<u16>()
    }

    /// Secondary energy floor for `crystal`.
    ///
    /// # Errors
    /// Returns an error if `crystal` is out of range.
    pub fn secondary_threshold_for(&self, crystal: usize) -> Result<f32> {
        self.secondary_threshold
            .get(crystal)
            .copied()
            .ok_or(Error::CrystalOutOfRange {
                crystal,
                n_crystals: self.n_crystals,
            })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns the first geometry or sizing inconsistency found.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;

        let positive = [
            ("N_CRYSTALS", self.n_crystals),
            ("MAX_FRAMES_SIZE", self.max_frames_size),
            ("N_THREADS", self.n_threads),
            ("DECODE_CHUNK_FRAMES", self.decode_chunk_frames),
            ("MAX_EVENT_PIXELS", self.max_event_pixels),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }

        if self.secondary_threshold.len() != self.n_crystals {
            return Err(Error::Config(format!(
                "SECONDARY_THRESHOLD has {} values for {} crystals",
                self.secondary_threshold.len(),
                self.n_crystals
            )));
        }
        if self.geometry.n_pixels > MAX_LOGICAL_PIXELS {
            return Err(Error::Config(format!(
                "N_PIXELS = {} exceeds the 16-bit pixel id limit of {MAX_LOGICAL_PIXELS}",
                self.geometry.n_pixels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::new(GeometryConfig::unmerged(4, 4, 2, 2), 2, 100, 4, vec![10.0, 12.0])
    }

    #[test]
    fn test_defaults_and_sizes() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.decode_chunk_frames, DEFAULT_DECODE_CHUNK_FRAMES);
        assert_eq!(config.max_event_pixels, DEFAULT_MAX_EVENT_PIXELS);
        assert_eq!(config.samples_per_frame(), 32);
        assert_eq!(config.frame_bytes(), 64);
        assert!((config.secondary_threshold_for(1).unwrap() - 12.0).abs() < f32::EPSILON);
        assert!(config.secondary_threshold_for(2).is_err());
    }

    #[test]
    fn test_rejects_threshold_count_mismatch() {
        let mut config = config();
        config.secondary_threshold.pop();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_threads() {
        let mut config = config();
        config.n_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_pixel_ids_beyond_u16() {
        let config = RunConfig::new(GeometryConfig::unmerged(257, 256, 256, 1), 1, 1, 1, vec![1.0]);
        assert!(config.validate().is_err());
    }
}
