//! Calibration stores backed by per-crystal files.
//!
//! Each crystal is either skipped or read from a document carrying the
//! calibration datasets (`pixels_calibrations`, `pixels_peaks`,
//! `pixels_isvalids`, `pixels_thresholds`). Primary thresholds can come from
//! the calibration document itself or from a separate threshold document.
//! This module reads JSON documents; HDF5 files are read by
//! `Hdf5CalibrationStore` with the `hdf5` feature.

use crate::{Error, Result};
use czpix_core::calibration::{CalibrationSource, CrystalCalibration};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Argument sentinel for a crystal excluded from the run.
pub const SKIP: &str = "skip";

/// Argument sentinel for thresholds taken from the calibration document.
pub const FROM_CALIBRATION: &str = "from_calibration";

/// Where the primary thresholds of a crystal come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    /// The `pixels_thresholds` dataset of the calibration document.
    FromCalibration,
    /// A separate threshold document.
    File(PathBuf),
}

/// Calibration input of one crystal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrystalEntry {
    /// Crystal excluded from decoding, clustering and output.
    Skip,
    /// Calibration read from disk.
    File {
        /// Calibration document.
        calibration: PathBuf,
        /// Primary threshold source.
        thresholds: ThresholdSource,
    },
}

/// Threshold document: a bare array or an object with `pixels_thresholds`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdDocument {
    Bare(Vec<f32>),
    Dataset { pixels_thresholds: Vec<f32> },
}

/// Calibration store reading one JSON document per crystal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JsonCalibrationStore {
    entries: Vec<CrystalEntry>,
}

impl JsonCalibrationStore {
    /// Creates a store from per-crystal entries.
    #[must_use]
    pub fn new(entries: Vec<CrystalEntry>) -> Self {
        Self { entries }
    }

    /// Builds a store from command-line style arguments.
    ///
    /// `calibrations[c]` is a path or `skip`; `thresholds[c]` is a path or
    /// `from_calibration`. An empty `thresholds` means `from_calibration`
    /// for every crystal.
    ///
    /// # Errors
    /// Returns an error if the argument counts do not match `n_crystals`.
    pub fn from_args<S: AsRef<str>>(
        calibrations: &[S],
        thresholds: &[S],
        n_crystals: usize,
    ) -> Result<Self> {
        Ok(Self {
            entries: entries_from_args(calibrations, thresholds, n_crystals)?,
        })
    }

    /// Per-crystal entries.
    #[must_use]
    pub fn entries(&self) -> &[CrystalEntry] {
        &self.entries
    }

    /// `true` for every crystal that is not skipped.
    #[must_use]
    pub fn active_crystals(&self) -> Vec<bool> {
        self.entries
            .iter()
            .map(|entry| !matches!(entry, CrystalEntry::Skip))
            .collect()
    }
}

/// Returns true for paths with an HDF5 extension (`.h5`, `.hdf5`).
#[must_use]
pub fn is_hdf5_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("h5") || ext.eq_ignore_ascii_case("hdf5"))
}

/// Parses command-line style calibration and threshold arguments.
pub(crate) fn entries_from_args<S: AsRef<str>>(
    calibrations: &[S],
    thresholds: &[S],
    n_crystals: usize,
) -> Result<Vec<CrystalEntry>> {
    if calibrations.len() != n_crystals {
        return Err(Error::InvalidFormat(format!(
            "{} calibration files for {n_crystals} crystals",
            calibrations.len()
        )));
    }
    if !thresholds.is_empty() && thresholds.len() != n_crystals {
        return Err(Error::InvalidFormat(format!(
            "{} threshold files for {n_crystals} crystals",
            thresholds.len()
        )));
    }

    Ok(calibrations
        .iter()
        .enumerate()
        .map(|(crystal, calibration)| match calibration.as_ref() {
            SKIP => CrystalEntry::Skip,
            path => CrystalEntry::File {
                calibration: PathBuf::from(path),
                thresholds: match thresholds.get(crystal).map(|s| s.as_ref()) {
                    None | Some(FROM_CALIBRATION) => ThresholdSource::FromCalibration,
                    Some(path) => ThresholdSource::File(PathBuf::from(path)),
                },
            },
        })
        .collect())
}

/// Loads the calibration of `crystal` from `entries` with `read`.
pub(crate) fn load_entry<F>(
    entries: &[CrystalEntry],
    crystal: usize,
    read: F,
) -> czpix_core::Result<Option<CrystalCalibration>>
where
    F: FnOnce(&Path) -> Result<CrystalCalibration>,
{
    match entries.get(crystal) {
        None => Err(czpix_core::Error::CrystalOutOfRange {
            crystal,
            n_crystals: entries.len(),
        }),
        Some(CrystalEntry::Skip) => Ok(None),
        Some(CrystalEntry::File { calibration, .. }) => {
            log::info!(
                "reading calibration of crystal {crystal} from {}",
                calibration.display()
            );
            read(calibration.as_path())
                .map(Some)
                .map_err(|err| calibration_error(calibration, &err))
        }
    }
}

/// Loads the threshold override of `crystal` from `entries` with `read`.
pub(crate) fn load_threshold_entry<F>(
    entries: &[CrystalEntry],
    crystal: usize,
    read: F,
) -> czpix_core::Result<Option<Vec<f32>>>
where
    F: FnOnce(&Path) -> Result<Vec<f32>>,
{
    let Some(CrystalEntry::File {
        thresholds: ThresholdSource::File(path),
        ..
    }) = entries.get(crystal)
    else {
        return Ok(None);
    };
    log::info!("reading thresholds of crystal {crystal} from {}", path.display());
    read(path.as_path())
        .map(Some)
        .map_err(|err| calibration_error(path, &err))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn calibration_error(path: &Path, err: &Error) -> czpix_core::Error {
    czpix_core::Error::Calibration(format!("{}: {err}", path.display()))
}

fn read_json_thresholds(path: &Path) -> Result<Vec<f32>> {
    match read_json::<ThresholdDocument>(path)? {
        ThresholdDocument::Bare(values)
        | ThresholdDocument::Dataset {
            pixels_thresholds: values,
        } => Ok(values),
    }
}

impl CalibrationSource for JsonCalibrationStore {
    fn load(&self, crystal: usize) -> czpix_core::Result<Option<CrystalCalibration>> {
        load_entry(&self.entries, crystal, read_json::<CrystalCalibration>)
    }

    fn threshold_override(&self, crystal: usize) -> czpix_core::Result<Option<Vec<f32>>> {
        load_threshold_entry(&self.entries, crystal, read_json_thresholds)
    }
}
