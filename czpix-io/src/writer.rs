//! Bucketed binary cluster files.
//!
//! Record layout (little-endian):
//! `u32 frame_id`, `u32 count`, `count x u16 pixel_id`, `count x u16 adu`,
//! `count x f32 energy`.

use crate::{Error, Result};
use czpix_core::clustering::Cluster;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Bytes of the fixed record header.
pub const RECORD_HEADER_BYTES: usize = 8;

/// Bytes per member pixel (id, adu, energy).
pub const RECORD_PIXEL_BYTES: usize = 2 + 2 + 4;

/// Appends one record for `cluster` to `out`.
///
/// # Errors
/// Returns [`Error::PixelIdOverflow`] if a pixel id exceeds 16 bits.
pub fn encode_record(cluster: &Cluster, out: &mut Vec<u8>) -> Result<()> {
    let count = u32::try_from(cluster.len())
        .map_err(|_| Error::InvalidFormat(format!("cluster of {} pixels", cluster.len())))?;
    out.reserve(RECORD_HEADER_BYTES + cluster.len() * RECORD_PIXEL_BYTES);
    out.extend_from_slice(&cluster.frame_id.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for &pixel in &cluster.pixel_ids {
        let pixel = u16::try_from(pixel).map_err(|_| Error::PixelIdOverflow(pixel))?;
        out.extend_from_slice(&pixel.to_le_bytes());
    }
    for &adu in &cluster.adus {
        out.extend_from_slice(&adu.to_le_bytes());
    }
    for &energy in &cluster.energies {
        out.extend_from_slice(&energy.to_le_bytes());
    }
    Ok(())
}

/// Writes every cluster with exactly `bucket` pixels; others are skipped.
///
/// Returns the number of records written.
///
/// # Errors
/// Returns an error on write failure or pixel id overflow.
pub fn write_clusters<W: Write>(
    writer: &mut W,
    clusters: &[Cluster],
    bucket: usize,
) -> Result<usize> {
    let mut record = Vec::new();
    let mut written = 0;
    for cluster in clusters.iter().filter(|c| c.len() == bucket) {
        record.clear();
        encode_record(cluster, &mut record)?;
        writer.write_all(&record)?;
        written += 1;
    }
    Ok(written)
}

/// Records written by one [`ClusterFileSet::append`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendCounts {
    /// Clusters written to a bucket file.
    pub written: usize,
    /// Clusters larger than the largest bucket, not written anywhere.
    pub oversize: usize,
}

/// The per-crystal, per-size cluster files of one run.
///
/// [`ClusterFileSet::create`] truncates every file once; [`ClusterFileSet::append`]
/// only ever appends.
#[derive(Clone, Debug)]
pub struct ClusterFileSet {
    dir: PathBuf,
    crystals: Vec<usize>,
    max_event_pixels: usize,
    extended_mode: bool,
}

impl ClusterFileSet {
    /// File name of the `bucket`-pixel clusters of `crystal`.
    #[must_use]
    pub fn file_name(crystal: usize, bucket: usize, extended_mode: bool) -> String {
        if extended_mode {
            format!("clusters_crystal_{crystal}_pixel_{bucket}_extended.bin")
        } else {
            format!("clusters_crystal_{crystal}_pixel_{bucket}.bin")
        }
    }

    /// Creates `dir` and creates or truncates the files of every crystal in
    /// `crystals` for buckets `1..=max_event_pixels`.
    ///
    /// # Errors
    /// Returns an error if a directory or file cannot be created.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        crystals: impl IntoIterator<Item = usize>,
        max_event_pixels: usize,
        extended_mode: bool,
    ) -> Result<Self> {
        Self::prepare(dir.as_ref(), crystals, max_event_pixels, extended_mode, true)
    }

    /// Like [`ClusterFileSet::create`], but keeps the contents of files that
    /// already exist so a run can extend the output of an earlier one.
    ///
    /// # Errors
    /// Returns an error if a directory or file cannot be created.
    pub fn open_existing<P: AsRef<Path>>(
        dir: P,
        crystals: impl IntoIterator<Item = usize>,
        max_event_pixels: usize,
        extended_mode: bool,
    ) -> Result<Self> {
        Self::prepare(dir.as_ref(), crystals, max_event_pixels, extended_mode, false)
    }

    fn prepare(
        dir: &Path,
        crystals: impl IntoIterator<Item = usize>,
        max_event_pixels: usize,
        extended_mode: bool,
        truncate: bool,
    ) -> Result<Self> {
        let set = Self {
            dir: dir.to_path_buf(),
            crystals: crystals.into_iter().collect(),
            max_event_pixels,
            extended_mode,
        };
        std::fs::create_dir_all(&set.dir)?;
        for &crystal in &set.crystals {
            for bucket in 1..=max_event_pixels {
                let path = set.path(crystal, bucket);
                if truncate {
                    File::create(path)?;
                } else {
                    OpenOptions::new().create(true).append(true).open(path)?;
                }
            }
        }
        log::info!(
            "{} {} cluster files in {}",
            if truncate { "created" } else { "opened" },
            set.crystals.len() * max_event_pixels,
            set.dir.display()
        );
        Ok(set)
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Crystals with files in this set.
    #[must_use]
    pub fn crystals(&self) -> &[usize] {
        &self.crystals
    }

    /// Path of the `bucket`-pixel file of `crystal`.
    #[must_use]
    pub fn path(&self, crystal: usize, bucket: usize) -> PathBuf {
        self.dir.join(Self::file_name(crystal, bucket, self.extended_mode))
    }

    /// Appends `clusters` of `crystal` to its bucket files.
    ///
    /// # Errors
    /// Returns an error if `crystal` has no files in this set or a write fails.
    pub fn append(&self, crystal: usize, clusters: &[Cluster]) -> Result<AppendCounts> {
        if !self.crystals.contains(&crystal) {
            return Err(Error::InvalidFormat(format!(
                "crystal {crystal} has no cluster files in {}",
                self.dir.display()
            )));
        }

        let mut counts = AppendCounts::default();
        for bucket in 1..=self.max_event_pixels {
            let file = OpenOptions::new()
                .append(true)
                .open(self.path(crystal, bucket))?;
            let mut writer = BufWriter::new(file);
            counts.written += write_clusters(&mut writer, clusters, bucket)?;
            writer.flush()?;
        }

        counts.oversize = clusters
            .iter()
            .filter(|c| c.len() > self.max_event_pixels)
            .count();
        if counts.oversize > 0 {
            log::warn!(
                "crystal {crystal}: {} clusters larger than {} pixels were not written",
                counts.oversize,
                self.max_event_pixels
            );
        }
        Ok(counts)
    }
}
