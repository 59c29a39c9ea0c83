//! Per-pixel energy calibration and clustering thresholds.
//!
//! Calibration records come from an external store through
//! [`CalibrationSource`]; [`Calibration::from_record`] checks them against
//! the pixel count and derives the secondary (admission) thresholds once
//! per crystal per run.

use crate::config::RunConfig;
use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Raw calibration datasets for one crystal, as stored on disk.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrystalCalibration {
    /// `[slope, offset]` per pixel (ADU to keV).
    pub pixels_calibrations: Vec<[f32; 2]>,
    /// Fitted peak positions per pixel; carried through unused.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pixels_peaks: Vec<Vec<f32>>,
    /// Non-zero for pixels usable as cluster seeds. All pixels are valid when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pixels_isvalids: Option<Vec<u8>>,
    /// Primary (noise floor) threshold per pixel in ADU.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pixels_thresholds: Option<Vec<f32>>,
}

/// Validated calibration of one crystal.
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    slope: Vec<f32>,
    offset: Vec<f32>,
    is_valid: Vec<bool>,
    primary_threshold: Vec<f32>,
    secondary_threshold: Vec<f32>,
    peaks: Vec<Vec<f32>>,
}

fn check_len(field: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::CalibrationLength {
            field,
            expected,
            actual,
        })
    }
}

impl Calibration {
    /// Builds a calibration from a stored record.
    ///
    /// `threshold_override` replaces the record's primary thresholds.
    /// `secondary_energy_kev` is the crystal's configured energy floor; the
    /// secondary threshold of pixel `p` is
    /// `primary[p] + secondary_energy_kev / slope[p]` in ADU.
    ///
    /// # Errors
    /// Returns [`Error::CalibrationLength`] if any dataset does not have
    /// exactly `n_pixels` entries, or [`Error::Calibration`] if no primary
    /// thresholds are available.
    pub fn from_record(
        record: CrystalCalibration,
        threshold_override: Option<Vec<f32>>,
        n_pixels: usize,
        secondary_energy_kev: f32,
    ) -> Result<Self> {
        check_len("pixels_calibrations", n_pixels, record.pixels_calibrations.len())?;
        if !record.pixels_peaks.is_empty() {
            check_len("pixels_peaks", n_pixels, record.pixels_peaks.len())?;
        }

        let is_valid = match record.pixels_isvalids {
            Some(flags) => {
                check_len("pixels_isvalids", n_pixels, flags.len())?;
                flags.into_iter().map(|flag| flag != 0).collect()
            }
            None => vec![true; n_pixels],
        };

        let primary_threshold = match threshold_override.or(record.pixels_thresholds) {
            Some(thresholds) => {
                check_len("pixels_thresholds", n_pixels, thresholds.len())?;
                thresholds
            }
            None => {
                return Err(Error::Calibration(
                    "no pixels_thresholds in calibration and no threshold file given".into(),
                ))
            }
        };

        let (slope, offset): (Vec<f32>, Vec<f32>) = record
            .pixels_calibrations
            .iter()
            .map(|&[slope, offset]| (slope, offset))
            .unzip();

        let secondary_threshold = primary_threshold
            .iter()
            .zip(&slope)
            .map(|(&primary, &slope)| {
                // uncalibrated pixel: can never admit a region
                if slope == 0.0 {
                    f32::INFINITY
                } else {
                    primary + secondary_energy_kev / slope
                }
            })
            .collect();

        Ok(Self {
            slope,
            offset,
            is_valid,
            primary_threshold,
            secondary_threshold,
            peaks: record.pixels_peaks,
        })
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.slope.len()
    }

    /// Calibration slope per pixel.
    #[must_use]
    pub fn slope(&self) -> &[f32] {
        &self.slope
    }

    /// Calibration offset per pixel.
    #[must_use]
    pub fn offset(&self) -> &[f32] {
        &self.offset
    }

    /// Seed validity per pixel.
    #[must_use]
    pub fn is_valid(&self) -> &[bool] {
        &self.is_valid
    }

    /// Primary threshold per pixel (ADU).
    #[must_use]
    pub fn primary_threshold(&self) -> &[f32] {
        &self.primary_threshold
    }

    /// Secondary threshold per pixel (ADU).
    #[must_use]
    pub fn secondary_threshold(&self) -> &[f32] {
        &self.secondary_threshold
    }

    /// Peak positions per pixel, empty when the store had none.
    #[must_use]
    pub fn peaks(&self) -> &[Vec<f32>] {
        &self.peaks
    }

    /// Returns true if `pixel` may seed a cluster at raw value `adu`.
    #[inline]
    #[must_use]
    pub fn is_seed(&self, pixel: usize, adu: u16) -> bool {
        self.is_valid[pixel] && f32::from(adu) >= self.primary_threshold[pixel]
    }

    /// Returns true if `adu` clears the secondary threshold of `pixel`.
    #[inline]
    #[must_use]
    pub fn passes_secondary(&self, pixel: usize, adu: u16) -> bool {
        f32::from(adu) >= self.secondary_threshold[pixel]
    }

    /// Calibrated energy of `pixel` at raw value `adu`, clamped at zero.
    #[inline]
    #[must_use]
    pub fn energy(&self, pixel: usize, adu: u16) -> f32 {
        (self.slope[pixel] * f32::from(adu) + self.offset[pixel]).max(0.0)
    }
}

/// External calibration store.
pub trait CalibrationSource: Send + Sync {
    /// Loads the calibration record of `crystal`, or `None` if the crystal
    /// is marked skip for this run.
    ///
    /// # Errors
    /// Returns an error if the record exists but cannot be read.
    fn load(&self, crystal: usize) -> Result<Option<CrystalCalibration>>;

    /// Primary thresholds replacing the ones stored with the calibration.
    ///
    /// # Errors
    /// Returns an error if an override is configured but cannot be read.
    fn threshold_override(&self, _crystal: usize) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

/// Loads and derives the calibration of every crystal in `config`.
///
/// Skipped crystals yield `None`.
///
/// # Errors
/// Fails on the first crystal whose record cannot be loaded or validated.
pub fn load_calibrations(
    source: &dyn CalibrationSource,
    config: &RunConfig,
) -> Result<Vec<Option<Calibration>>> {
    (0..config.n_crystals)
        .map(|crystal| {
            let Some(record) = source.load(crystal)? else {
                return Ok(None);
            };
            let thresholds = source.threshold_override(crystal)?;
            let energy = config.secondary_threshold_for(crystal)?;
            Calibration::from_record(record, thresholds, config.geometry.n_pixels, energy)
                .map(Some)
                .map_err(|err| Error::Calibration(format!("crystal {crystal}: {err}")))
        })
        .collect()
}

/// Calibration store held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCalibrationStore {
    crystals: Vec<Option<(CrystalCalibration, Option<Vec<f32>>)>>,
}

impl InMemoryCalibrationStore {
    /// Creates an empty store; crystals without an entry are skipped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record of `crystal`.
    #[must_use]
    pub fn with_crystal(mut self, crystal: usize, record: CrystalCalibration) -> Self {
        *self.slot(crystal) = Some((record, None));
        self
    }

    /// Sets the record of `crystal` together with a threshold override.
    #[must_use]
    pub fn with_crystal_thresholds(
        mut self,
        crystal: usize,
        record: CrystalCalibration,
        thresholds: Vec<f32>,
    ) -> Self {
        *self.slot(crystal) = Some((record, Some(thresholds)));
        self
    }

    fn slot(&mut self, crystal: usize) -> &mut Option<(CrystalCalibration, Option<Vec<f32>>)> {
        if self.crystals.len() <= crystal {
            self.crystals.resize(crystal + 1, None);
        }
        &mut self.crystals[crystal]
    }
}

impl CalibrationSource for InMemoryCalibrationStore {
    fn load(&self, crystal: usize) -> Result<Option<CrystalCalibration>> {
        Ok(self
            .crystals
            .get(crystal)
            .and_then(|entry| entry.as_ref().map(|(record, _)| record.clone())))
    }

    fn threshold_override(&self, crystal: usize) -> Result<Option<Vec<f32>>> {
        Ok(self
            .crystals
            .get(crystal)
            .and_then(|entry| entry.as_ref().and_then(|(_, thresholds)| thresholds.clone())))
    }
}

/// Uniform calibration record, mostly useful for tests and dry runs.
#[must_use]
pub fn uniform_record(
    n_pixels: usize,
    slope: f32,
    offset: f32,
    threshold: f32,
) -> CrystalCalibration {
    CrystalCalibration {
        pixels_calibrations: vec![[slope, offset]; n_pixels],
        pixels_peaks: Vec::new(),
        pixels_isvalids: None,
        pixels_thresholds: Some(vec![threshold; n_pixels]),
    }
}
