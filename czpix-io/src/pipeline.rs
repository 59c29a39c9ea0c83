//! Raw files to bucketed cluster files.
//!
//! Each raw file is processed in flows of `max_frames_size` frames: decode
//! every crystal into the shared frame buffer, cluster each active crystal,
//! append the clusters to their bucket files, drop them. Memory use is
//! bounded by the flow size, not by the file size.

use crate::decoder::RawFrameDecoder;
use crate::writer::ClusterFileSet;
use crate::{Error, Result};
use czpix_algorithms::{FloodFillClustering, FloodFillConfig};
use czpix_core::calibration::{load_calibrations, Calibration, CalibrationSource};
use czpix_core::clustering::ClusteringStatistics;
use czpix_core::config::RunConfig;
use czpix_core::frame::FrameBuffer;
use czpix_core::geometry::{build_pixel_order, PixelOrder};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Totals of a pipeline run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineSummary {
    /// Raw files processed.
    pub files: usize,
    /// Flows (decode + cluster rounds) processed.
    pub flows: usize,
    /// Frames decoded.
    pub frames: u64,
    /// Bytes read from raw files.
    pub bytes_read: u64,
    /// Clusters written to bucket files.
    pub clusters_written: usize,
    /// Clusters larger than the largest bucket, not written.
    pub clusters_oversize: usize,
    /// Clustering counters per crystal; all zero for skipped crystals.
    pub crystal_statistics: Vec<ClusteringStatistics>,
    /// Wall time spent.
    pub elapsed: Duration,
}

impl PipelineSummary {
    fn merge(&mut self, other: &Self) {
        self.files += other.files;
        self.flows += other.flows;
        self.frames += other.frames;
        self.bytes_read += other.bytes_read;
        self.clusters_written += other.clusters_written;
        self.clusters_oversize += other.clusters_oversize;
        for (total, stats) in self
            .crystal_statistics
            .iter_mut()
            .zip(&other.crystal_statistics)
        {
            *total += *stats;
        }
        self.elapsed += other.elapsed;
    }
}

/// Decoding and clustering pipeline for one run.
pub struct ClusterPipeline {
    config: RunConfig,
    order: Arc<PixelOrder>,
    calibrations: Vec<Option<Calibration>>,
    decoder: RawFrameDecoder,
    engine: FloodFillClustering,
    files: ClusterFileSet,
    buffer: FrameBuffer,
}

impl ClusterPipeline {
    /// Prepares a run writing into `output_dir`.
    ///
    /// Validates `config`, builds the pixel order table, loads the
    /// calibration of every crystal and creates or truncates every bucket
    /// file of every non-skipped crystal.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, a calibration
    /// cannot be loaded, or the output files cannot be created.
    pub fn new<P: AsRef<Path>>(
        config: RunConfig,
        calibration_source: &dyn CalibrationSource,
        output_dir: P,
        extended_mode: bool,
    ) -> Result<Self> {
        Self::prepare(config, calibration_source, output_dir.as_ref(), extended_mode, true)
    }

    /// Like [`ClusterPipeline::new`], but appends to existing bucket files.
    ///
    /// # Errors
    /// Same as [`ClusterPipeline::new`].
    pub fn appending<P: AsRef<Path>>(
        config: RunConfig,
        calibration_source: &dyn CalibrationSource,
        output_dir: P,
        extended_mode: bool,
    ) -> Result<Self> {
        Self::prepare(config, calibration_source, output_dir.as_ref(), extended_mode, false)
    }

    fn prepare(
        config: RunConfig,
        calibration_source: &dyn CalibrationSource,
        output_dir: &Path,
        extended_mode: bool,
        truncate: bool,
    ) -> Result<Self> {
        config.validate()?;
        let order = Arc::new(build_pixel_order(&config.geometry));
        let calibrations = load_calibrations(calibration_source, &config)?;

        let active: Vec<bool> = calibrations.iter().map(Option::is_some).collect();
        let active_ids: Vec<usize> = (0..config.n_crystals).filter(|&c| active[c]).collect();
        if active_ids.is_empty() {
            log::warn!("every crystal is skipped; no clusters will be written");
        }

        let decoder =
            RawFrameDecoder::new(&config, Arc::clone(&order))?.with_active_crystals(active)?;
        let engine = FloodFillClustering::new(
            config.geometry.grid(),
            FloodFillConfig { extended_mode },
            config.n_threads,
        )?;
        let max_event_pixels = config.max_event_pixels;
        let files = if truncate {
            ClusterFileSet::create(output_dir, active_ids, max_event_pixels, extended_mode)?
        } else {
            ClusterFileSet::open_existing(output_dir, active_ids, max_event_pixels, extended_mode)?
        };
        let buffer = FrameBuffer::for_config(&config);

        Ok(Self {
            config,
            order,
            calibrations,
            decoder,
            engine,
            files,
            buffer,
        })
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Pixel order table shared with the decoder.
    #[must_use]
    pub fn pixel_order(&self) -> &PixelOrder {
        &self.order
    }

    /// Output files of this run.
    #[must_use]
    pub fn files(&self) -> &ClusterFileSet {
        &self.files
    }

    /// Processes `raw_files` one after another.
    ///
    /// # Errors
    /// Stops at the first file that is missing or fails to process.
    pub fn run<I, P>(&mut self, raw_files: I) -> Result<PipelineSummary>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut summary = self.empty_summary();
        for path in raw_files {
            let file_summary = self.process_file(path.as_ref())?;
            summary.merge(&file_summary);
        }
        log::info!(
            "finished {} files: {} frames, {} clusters written, {} oversize, {:.2} s",
            summary.files,
            summary.frames,
            summary.clusters_written,
            summary.clusters_oversize,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// Processes one raw file in flows of `max_frames_size` frames.
    ///
    /// Frame ids in the output restart at zero for every file.
    ///
    /// # Errors
    /// Returns [`Error::MissingFile`] if the file does not exist, or any
    /// decoding, clustering or write error.
    pub fn process_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PipelineSummary> {
        let path = path.as_ref();
        let started = Instant::now();
        let mut summary = self.empty_summary();
        summary.files = 1;

        let n_frames = self.decoder.frames_in_file(path)?;
        if n_frames == 0 {
            log::warn!("{}: no whole frames in file", path.display());
        }

        let flow = self.config.max_frames_size as u64;
        let mut start = 0;
        while start < n_frames {
            let end = (start + flow).min(n_frames);
            let start_frame_id = u32::try_from(start).map_err(|_| {
                Error::InvalidFormat(format!(
                    "{}: frame {start} does not fit a 32-bit frame id",
                    path.display()
                ))
            })?;

            let stats = self.decoder.decode(path, start, end, &mut self.buffer)?;
            summary.flows += 1;
            summary.frames += stats.frames_decoded as u64;
            summary.bytes_read += stats.bytes_read;

            for (crystal, calibration) in self.calibrations.iter().enumerate() {
                let Some(calibration) = calibration else {
                    continue;
                };
                let chunk = self.engine.cluster_chunk(
                    self.buffer.crystal_frames(crystal),
                    stats.frames_decoded,
                    calibration,
                    start_frame_id,
                )?;
                let counts = self.files.append(crystal, &chunk.clusters)?;
                log::debug!(
                    "crystal {crystal}, frames {start}..{end}: {} clusters, {} written",
                    chunk.clusters.len(),
                    counts.written
                );
                summary.clusters_written += counts.written;
                summary.clusters_oversize += counts.oversize;
                summary.crystal_statistics[crystal] += chunk.statistics;
            }

            log::info!(
                "{}: flow {} done, frames {start}..{end} of {n_frames}",
                path.display(),
                summary.flows
            );
            start = end;
        }

        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    fn empty_summary(&self) -> PipelineSummary {
        PipelineSummary {
            crystal_statistics: vec![ClusteringStatistics::default(); self.config.n_crystals],
            ..PipelineSummary::default()
        }
    }
}
