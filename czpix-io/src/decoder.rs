//! Chunked parallel decoder for multiplexed raw streams.
//!
//! A raw file is a sequence of frames. Each frame holds
//! `n_crystals * n_pixels_premerge` little-endian `u16` samples; the sample
//! of readout slot `k` and crystal `c` sits at `k * n_crystals + c`.

use crate::{Error, Result};
use czpix_core::config::RunConfig;
use czpix_core::frame::{FrameBuffer, FramesMut};
use czpix_core::geometry::PixelOrder;
use czpix_core::partition::split_range;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing and volume of one [`RawFrameDecoder::decode`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DecodeStats {
    /// Frames in the requested range.
    pub frames_requested: usize,
    /// Frames actually present in the file and decoded.
    pub frames_decoded: usize,
    /// Bytes read from disk.
    pub bytes_read: u64,
    /// Wall time spent.
    pub elapsed: Duration,
}

impl DecodeStats {
    /// Read throughput in MiB/s.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_read as f64 / secs / (1024.0 * 1024.0)
        } else {
            0.0
        }
    }
}

/// Size of a raw file in whole frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLayout {
    /// Whole frames in the file.
    pub frames: u64,
    /// Bytes after the last whole frame.
    pub trailing_bytes: u64,
}

/// Decodes raw frames into a [`FrameBuffer`] with a fixed worker pool.
pub struct RawFrameDecoder {
    n_crystals: usize,
    n_pixels: usize,
    chunk_frames: usize,
    n_threads: usize,
    order: Arc<PixelOrder>,
    active: Vec<bool>,
    pool: ThreadPool,
}

impl RawFrameDecoder {
    /// Creates a decoder for `config` using the shared pixel order table.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid, `order` was not built for its
    /// geometry, or the worker pool cannot be created.
    pub fn new(config: &RunConfig, order: Arc<PixelOrder>) -> Result<Self> {
        config.validate()?;
        let geometry = &config.geometry;
        if order.len() != geometry.n_pixels_premerge || order.n_pixels() != geometry.n_pixels {
            return Err(Error::CoreError(czpix_core::Error::InvalidGeometry(format!(
                "pixel order table maps {} slots to {} pixels, geometry has {} slots and {} pixels",
                order.len(),
                order.n_pixels(),
                geometry.n_pixels_premerge,
                geometry.n_pixels
            ))));
        }

        let n_threads = config.n_threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("czpix-decode-{i}"))
            .build()
            .map_err(|err| czpix_core::Error::ThreadPool(err.to_string()))?;

        Ok(Self {
            n_crystals: config.n_crystals,
            n_pixels: geometry.n_pixels,
            chunk_frames: config.decode_chunk_frames.max(1),
            n_threads,
            order,
            active: vec![true; config.n_crystals],
            pool,
        })
    }

    /// Restricts image writing to crystals whose flag is set.
    ///
    /// Planes of inactive crystals are never written.
    ///
    /// # Errors
    /// Returns an error if `active` does not have one flag per crystal.
    pub fn with_active_crystals(mut self, active: Vec<bool>) -> Result<Self> {
        if active.len() != self.n_crystals {
            return Err(Error::CoreError(czpix_core::Error::Config(format!(
                "{} crystal flags for {} crystals",
                active.len(),
                self.n_crystals
            ))));
        }
        self.active = active;
        Ok(self)
    }

    /// Bytes in one raw frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.order.len() * self.n_crystals * std::mem::size_of::<u16>()
    }

    /// Whole frames and trailing bytes of `path`, without logging.
    ///
    /// # Errors
    /// Returns [`Error::MissingFile`] if the file does not exist.
    pub fn file_layout<P: AsRef<Path>>(&self, path: P) -> Result<FileLayout> {
        let len = file_len(path.as_ref())?;
        let frame_bytes = self.frame_bytes() as u64;
        Ok(FileLayout {
            frames: len / frame_bytes,
            trailing_bytes: len % frame_bytes,
        })
    }

    /// Number of whole frames in `path`; warns once about trailing bytes.
    ///
    /// # Errors
    /// Returns [`Error::MissingFile`] if the file does not exist.
    pub fn frames_in_file<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let layout = self.file_layout(path)?;
        if layout.trailing_bytes != 0 {
            log::warn!(
                "{}: {} trailing bytes after the last whole frame are ignored",
                path.display(),
                layout.trailing_bytes
            );
        }
        Ok(layout.frames)
    }

    /// Decodes frames `start_frame..end_frame` of `path` into `buffer`.
    ///
    /// Slot `s` receives frame `start_frame + s`. Frames beyond the end of
    /// the file, and every slot past the requested range, are zeroed.
    ///
    /// # Errors
    /// Returns an error if the file is missing or unreadable, or the range
    /// does not fit the buffer.
    pub fn decode<P: AsRef<Path>>(
        &self,
        path: P,
        start_frame: u64,
        end_frame: u64,
        buffer: &mut FrameBuffer,
    ) -> Result<DecodeStats> {
        let path = path.as_ref();
        let started = Instant::now();
        self.check_buffer(buffer)?;

        let frames_requested = usize::try_from(end_frame.saturating_sub(start_frame))
            .ok()
            .filter(|&n| n <= buffer.max_frames())
            .ok_or(czpix_core::Error::FrameRange {
                start: start_frame,
                end: end_frame,
                capacity: buffer.max_frames(),
            })?;

        let available = self.file_layout(path)?.frames;
        let frames_decoded = usize::try_from(end_frame.min(available).saturating_sub(start_frame))
            .unwrap_or(frames_requested)
            .min(frames_requested);
        if frames_decoded < frames_requested {
            log::warn!(
                "{}: requested frames {start_frame}..{end_frame} but the file has {available}; \
                 {} frames zero-filled",
                path.display(),
                frames_requested - frames_decoded
            );
        }

        let frame_bytes = self.frame_bytes();
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start_frame * frame_bytes as u64))?;

        let mut raw = vec![0u8; self.chunk_frames.min(frames_decoded.max(1)) * frame_bytes];
        let mut done = 0;
        while done < frames_decoded {
            let n = self.chunk_frames.min(frames_decoded - done);
            let bytes = &mut raw[..n * frame_bytes];
            file.read_exact(bytes)?;
            self.decode_sub_chunk(bytes, done, buffer)?;
            done += n;
            log::debug!("{}: decoded {done}/{frames_decoded} frames", path.display());
        }
        buffer.zero_from(frames_decoded);

        let stats = DecodeStats {
            frames_requested,
            frames_decoded,
            bytes_read: (frames_decoded * frame_bytes) as u64,
            elapsed: started.elapsed(),
        };
        log::info!(
            "{}: read {} frames ({start_frame}..{}) in {:.2} s, {:.1} MiB/s",
            path.display(),
            frames_decoded,
            start_frame + frames_decoded as u64,
            stats.elapsed.as_secs_f64(),
            stats.throughput_mib_s()
        );
        Ok(stats)
    }

    fn check_buffer(&self, buffer: &FrameBuffer) -> Result<()> {
        if buffer.n_crystals() != self.n_crystals || buffer.n_pixels() != self.n_pixels {
            return Err(Error::CoreError(czpix_core::Error::Config(format!(
                "frame buffer is {} crystals x {} pixels, decoder expects {} x {}",
                buffer.n_crystals(),
                buffer.n_pixels(),
                self.n_crystals,
                self.n_pixels
            ))));
        }
        Ok(())
    }

    /// Scatters the frames in `bytes` into slots starting at `first_slot`.
    fn decode_sub_chunk(
        &self,
        bytes: &[u8],
        first_slot: usize,
        buffer: &mut FrameBuffer,
    ) -> Result<()> {
        let frame_bytes = self.frame_bytes();
        let n_frames = bytes.len() / frame_bytes;
        let ranges = split_range(first_slot..first_slot + n_frames, self.n_threads);
        let parts = buffer.split_for_workers(&ranges)?;

        self.pool.install(|| {
            parts.into_par_iter().for_each(|mut part| {
                for slot in part.slots() {
                    let offset = (slot - first_slot) * frame_bytes;
                    self.scatter_frame(&bytes[offset..offset + frame_bytes], slot, &mut part);
                }
            });
        });
        Ok(())
    }

    fn scatter_frame(&self, frame: &[u8], slot: usize, part: &mut FramesMut<'_>) {
        for crystal in (0..self.n_crystals).filter(|&c| self.active[c]) {
            let image = part.frame_mut(crystal, slot);
            for (readout_slot, pixel) in self.order.mapped() {
                let at = (readout_slot * self.n_crystals + crystal) * 2;
                image[pixel] = u16::from_le_bytes([frame[at], frame[at + 1]]);
            }
        }
    }
}

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::MissingFile(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use czpix_core::geometry::{build_pixel_order, GeometryConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config() -> RunConfig {
        RunConfig::new(GeometryConfig::unmerged(2, 4, 2, 2), 2, 8, 2, vec![1.0, 1.0])
            .with_decode_chunk_frames(2)
    }

    fn decoder(config: &RunConfig) -> RawFrameDecoder {
        let order = Arc::new(build_pixel_order(&config.geometry));
        RawFrameDecoder::new(config, order).unwrap()
    }

    /// Frame `f`, readout slot `k`, crystal `c` carries `1000 f + 10 k + c`.
    fn write_frames(file: &mut NamedTempFile, n_frames: u16, n_slots: u16, n_crystals: u16) {
        for f in 0..n_frames {
            for k in 0..n_slots {
                for c in 0..n_crystals {
                    file.write_all(&(1000 * f + 10 * k + c).to_le_bytes()).unwrap();
                }
            }
        }
        file.flush().unwrap();
    }

    #[test]
    fn test_decode_remaps_slots_and_crystals() {
        let config = config();
        let decoder = decoder(&config);
        let mut file = NamedTempFile::new().unwrap();
        write_frames(&mut file, 5, 8, 2);

        let mut buffer = FrameBuffer::for_config(&config);
        let stats = decoder.decode(file.path(), 1, 4, &mut buffer).unwrap();
        assert_eq!(stats.frames_decoded, 3);
        assert_eq!(stats.bytes_read, 3 * 32);

        // readout order [0, 2, 1, 3, 4, 6, 5, 7]: pixel 2 is fed by slot 1
        assert_eq!(buffer.frame(0, 0)[2], 1000 + 10);
        assert_eq!(buffer.frame(1, 0)[2], 1000 + 10 + 1);
        assert_eq!(buffer.frame(1, 2)[7], 3000 + 70 + 1);
        assert!(buffer.frame(0, 3).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_inactive_crystal_is_left_zero() {
        let config = config();
        let decoder = decoder(&config).with_active_crystals(vec![false, true]).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        write_frames(&mut file, 2, 8, 2);

        let mut buffer = FrameBuffer::for_config(&config);
        decoder.decode(file.path(), 0, 2, &mut buffer).unwrap();
        assert!(buffer.frame(0, 1).iter().all(|&v| v == 0));
        assert_eq!(buffer.frame(1, 1)[0], 1001);
    }

    #[test]
    fn test_frames_in_file_ignores_partial_tail() {
        let config = config();
        let decoder = decoder(&config);
        let mut file = NamedTempFile::new().unwrap();
        write_frames(&mut file, 3, 8, 2);
        file.write_all(&[1, 2, 3]).unwrap();
        file.flush().unwrap();
        assert_eq!(decoder.frames_in_file(file.path()).unwrap(), 3);
        assert_eq!(
            decoder.file_layout(file.path()).unwrap(),
            FileLayout {
                frames: 3,
                trailing_bytes: 3
            }
        );

        // flows over the same file decode up to the last whole frame
        let mut buffer = FrameBuffer::for_config(&config);
        let first = decoder.decode(file.path(), 0, 2, &mut buffer).unwrap();
        let second = decoder.decode(file.path(), 2, 4, &mut buffer).unwrap();
        assert_eq!((first.frames_decoded, second.frames_decoded), (2, 1));
        assert_eq!(buffer.frame(1, 0)[0], 2001);
        assert!(buffer.frame(1, 1).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let config = config();
        let decoder = decoder(&config);
        let mut buffer = FrameBuffer::for_config(&config);
        let err = decoder
            .decode("/nonexistent/czpix/raw.bin", 0, 1, &mut buffer)
            .unwrap_err();
        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn test_range_larger_than_buffer_is_rejected() {
        let config = config();
        let decoder = decoder(&config);
        let mut file = NamedTempFile::new().unwrap();
        write_frames(&mut file, 1, 8, 2);
        let mut buffer = FrameBuffer::for_config(&config);
        assert!(decoder.decode(file.path(), 0, 9, &mut buffer).is_err());
    }
}
