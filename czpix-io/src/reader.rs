//! Memory-mapped cluster file reader.
//!

use crate::writer::{RECORD_HEADER_BYTES, RECORD_PIXEL_BYTES};
use crate::{Error, Result};
use czpix_core::clustering::Cluster;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped reader over one bucketed cluster file.
pub struct ClusterFileReader {
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl ClusterFileReader {
    /// Opens a cluster file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file is missing or cannot be memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
            // This is the standard safety contract for memory mapping.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };
            Some(mmap)
        };
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Iterates every record in file order.
    #[must_use]
    pub fn clusters(&self) -> ClusterRecords<'_> {
        ClusterRecords {
            data: self.as_bytes(),
            pos: 0,
            size_filter: None,
            failed: false,
        }
    }

    /// Iterates the records with exactly `size` pixels, skipping the rest
    /// without decoding them.
    #[must_use]
    pub fn clusters_of_size(&self, size: usize) -> ClusterRecords<'_> {
        ClusterRecords {
            size_filter: Some(size),
            ..self.clusters()
        }
    }
}

/// Iterator over the records of a cluster file.
///
/// A truncated record yields one [`Error::InvalidFormat`] and ends iteration.
pub struct ClusterRecords<'a> {
    data: &'a [u8],
    pos: usize,
    size_filter: Option<usize>,
    failed: bool,
}

impl ClusterRecords<'_> {
    fn truncated(&mut self, what: &str) -> Option<Result<Cluster>> {
        self.failed = true;
        Some(Err(Error::InvalidFormat(format!(
            "truncated cluster record {what} at byte {}",
            self.pos
        ))))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Iterator for ClusterRecords<'_> {
    type Item = Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.pos >= self.data.len() {
                return None;
            }
            let data = self.data;
            let rest = &data[self.pos..];
            if rest.len() < RECORD_HEADER_BYTES {
                return self.truncated("header");
            }
            let frame_id = read_u32(&rest[0..4]);
            let count = read_u32(&rest[4..8]) as usize;
            let record_len = RECORD_HEADER_BYTES + count * RECORD_PIXEL_BYTES;
            if rest.len() < record_len {
                return self.truncated("body");
            }
            self.pos += record_len;
            if self.size_filter.is_some_and(|size| size != count) {
                continue;
            }

            let body = &rest[RECORD_HEADER_BYTES..record_len];
            let (ids, body) = body.split_at(2 * count);
            let (adus, energies) = body.split_at(2 * count);
            let mut cluster = Cluster::with_capacity(frame_id, count);
            for ((id, adu), energy) in ids
                .chunks_exact(2)
                .zip(adus.chunks_exact(2))
                .zip(energies.chunks_exact(4))
            {
                cluster.push(
                    u32::from(u16::from_le_bytes([id[0], id[1]])),
                    u16::from_le_bytes([adu[0], adu[1]]),
                    f32::from_le_bytes([energy[0], energy[1], energy[2], energy[3]]),
                );
            }
            return Some(Ok(cluster));
        }
    }
}
