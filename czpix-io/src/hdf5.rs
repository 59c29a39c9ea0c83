//! HDF5 calibration store.
//!
//! Reads the calibration files written by the acquisition calibration
//! tooling: one file per crystal with a 2-D `pixels_calibrations` dataset
//! (`[n_pixels, 2]`, slope and offset) and the optional datasets
//! `pixels_peaks` (`[n_pixels, n_peaks]`), `pixels_isvalids` and
//! `pixels_thresholds`. A separate threshold file holds `pixels_thresholds`
//! only.

use crate::calibration::{entries_from_args, load_entry, load_threshold_entry, CrystalEntry};
use crate::{Error, Result};
use czpix_core::calibration::{CalibrationSource, CrystalCalibration};
use hdf5::types::H5Type;
use hdf5::File;
use std::path::Path;

/// Calibration store reading one HDF5 file per crystal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hdf5CalibrationStore {
    entries: Vec<CrystalEntry>,
}

impl Hdf5CalibrationStore {
    /// Creates a store from per-crystal entries.
    #[must_use]
    pub fn new(entries: Vec<CrystalEntry>) -> Self {
        Self { entries }
    }

    /// Builds a store from command-line style arguments, as
    /// [`crate::JsonCalibrationStore::from_args`] does.
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
}

impl CalibrationSource for Hdf5CalibrationStore {
    fn load(&self, crystal: usize) -> czpix_core::Result<Option<CrystalCalibration>> {
        load_entry(&self.entries, crystal, |path| read_calibration_hdf5(path))
    }

    fn threshold_override(&self, crystal: usize) -> czpix_core::Result<Option<Vec<f32>>> {
        load_threshold_entry(&self.entries, crystal, |path| read_thresholds_hdf5(path))
    }
}

fn open(path: &Path) -> Result<File> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    Ok(File::open(path)?)
}

fn read_dataset_vec<T: H5Type>(file: &File, name: &str) -> Result<Vec<T>> {
    Ok(file.dataset(name)?.read_raw::<T>()?)
}

fn read_dataset_vec_opt<T: H5Type>(file: &File, name: &str) -> Result<Option<Vec<T>>> {
    if file.link_exists(name) {
        read_dataset_vec(file, name).map(Some)
    } else {
        Ok(None)
    }
}

/// Reads the calibration datasets of one crystal.
///
/// # Errors
/// Returns an error if the file is missing, `pixels_calibrations` is absent
/// or not `[n, 2]`, or a dataset cannot be read as the expected type.
pub fn read_calibration_hdf5<P: AsRef<Path>>(path: P) -> Result<CrystalCalibration> {
    let file = open(path.as_ref())?;

    let calibrations = file.dataset("pixels_calibrations")?.read_2d::<f32>()?;
    if calibrations.ncols() != 2 {
        return Err(Error::InvalidFormat(format!(
            "pixels_calibrations must be [n_pixels, 2], got [{}, {}]",
            calibrations.nrows(),
            calibrations.ncols()
        )));
    }
    let pixels_calibrations = calibrations
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1]])
        .collect();

    let pixels_peaks = if file.link_exists("pixels_peaks") {
        file.dataset("pixels_peaks")?
            .read_2d::<f32>()?
            .rows()
            .into_iter()
            .map(|row| row.to_vec())
            .collect()
    } else {
        Vec::new()
    };

    Ok(CrystalCalibration {
        pixels_calibrations,
        pixels_peaks,
        pixels_isvalids: read_dataset_vec_opt::<u8>(&file, "pixels_isvalids")?,
        pixels_thresholds: read_dataset_vec_opt::<f32>(&file, "pixels_thresholds")?,
    })
}

/// Reads the `pixels_thresholds` dataset of a threshold file.
///
/// # Errors
/// Returns an error if the file or the dataset is missing.
pub fn read_thresholds_hdf5<P: AsRef<Path>>(path: P) -> Result<Vec<f32>> {
    let file = open(path.as_ref())?;
    read_dataset_vec(&file, "pixels_thresholds")
}
