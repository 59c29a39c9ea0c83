//! czpix command-line interface.
//!
//! Decodes multiplexed raw acquisition files into bucketed cluster files and
//! inspects the results.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};

use czpix_core::calibration::CalibrationSource;
use czpix_core::config::RunConfig;
use czpix_io::calibration::SKIP;
use czpix_io::{
    is_hdf5_path, load_run_config, ClusterFileReader, ClusterPipeline, JsonCalibrationStore,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    CzpixIo(#[from] czpix_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] czpix_core::Error),

    #[error("{0}")]
    Usage(String),
}

/// Decoding and event clustering for multiplexed pixelated detectors.
#[derive(Parser)]
#[command(name = "czpix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run configuration (.txt key list or .json)
    #[arg(long, global = true, default_value = "config.txt")]
    config: PathBuf,

    /// Verbose (debug) logging; RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster raw files into per-crystal, per-size binary files
    #[command(name = "raw2clusters")]
    Raw2Clusters {
        /// Input raw file(s), processed in order
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// Calibration file per crystal (.json, or .h5 with the `hdf5` feature), or `skip`
        #[arg(short, long, num_args = 1.., required = true)]
        calibration: Vec<String>,

        /// Threshold file per crystal, or `from_calibration`
        #[arg(short, long, num_args = 1..)]
        thresholds: Vec<String>,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Dilate clusters with one ring of neighbouring pixels
        #[arg(long)]
        extended: bool,

        /// Append to existing cluster files instead of truncating them
        #[arg(long)]
        keep_existing: bool,

        /// Override the worker thread count of the configuration
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Show frame layout information about a raw file
    Info {
        /// Input raw file
        input: PathBuf,
    },

    /// Print the clusters stored in a cluster file
    ReadClusters {
        /// Input cluster file
        input: PathBuf,

        /// Maximum number of clusters to print
        #[arg(short = 'n', long, default_value = "20")]
        max: usize,

        /// Only clusters with this many pixels
        #[arg(long)]
        size: Option<usize>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: &Path, threads: Option<usize>) -> Result<RunConfig> {
    let mut config = load_run_config(path)?;
    if let Some(threads) = threads {
        config.n_threads = threads;
        config.validate()?;
    }
    Ok(config)
}

/// Picks the calibration store from the calibration file extensions.
fn calibration_store(
    calibration: &[String],
    thresholds: &[String],
    n_crystals: usize,
) -> Result<Box<dyn CalibrationSource>> {
    let files: Vec<&Path> = calibration
        .iter()
        .filter(|arg| arg.as_str() != SKIP)
        .map(Path::new)
        .collect();
    let n_hdf5 = files.iter().filter(|path| is_hdf5_path(path)).count();

    if n_hdf5 == 0 {
        return Ok(Box::new(JsonCalibrationStore::from_args(
            calibration,
            thresholds,
            n_crystals,
        )?));
    }
    if n_hdf5 != files.len() {
        return Err(CliError::Usage(
            "calibration files must be all HDF5 or all JSON".to_string(),
        ));
    }
    hdf5_store(calibration, thresholds, n_crystals)
}

#[cfg(feature = "hdf5")]
fn hdf5_store(
    calibration: &[String],
    thresholds: &[String],
    n_crystals: usize,
) -> Result<Box<dyn CalibrationSource>> {
    Ok(Box::new(czpix_io::Hdf5CalibrationStore::from_args(
        calibration,
        thresholds,
        n_crystals,
    )?))
}

#[cfg(not(feature = "hdf5"))]
fn hdf5_store(
    _calibration: &[String],
    _thresholds: &[String],
    _n_crystals: usize,
) -> Result<Box<dyn CalibrationSource>> {
    Err(CliError::Usage(
        "HDF5 calibration files need czpix built with the `hdf5` feature".to_string(),
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Raw2Clusters {
            input,
            calibration,
            thresholds,
            output,
            extended,
            keep_existing,
            threads,
        } => {
            let config = load_config(&cli.config, threads)?;
            log::debug!("run configuration: {config:?}");
            let store = calibration_store(&calibration, &thresholds, config.n_crystals)?;

            let mut pipeline = if keep_existing {
                ClusterPipeline::appending(config, store.as_ref(), &output, extended)?
            } else {
                ClusterPipeline::new(config, store.as_ref(), &output, extended)?
            };
            log::info!(
                "clustering {} raw files into {}",
                input.len(),
                output.display()
            );
            let summary = pipeline.run(&input)?;

            println!(
                "Processed {} files ({} frames) in {:.2}s",
                summary.files,
                summary.frames,
                summary.elapsed.as_secs_f64()
            );
            println!("Clusters written: {}", summary.clusters_written);
            println!("Clusters above bucket size: {}", summary.clusters_oversize);
            for (crystal, stats) in summary.crystal_statistics.iter().enumerate() {
                if stats.frames_processed == 0 {
                    continue;
                }
                println!(
                    "  crystal {}: {} regions, {} rejected, {} clusters",
                    crystal, stats.regions_found, stats.regions_rejected, stats.clusters_emitted
                );
            }
        }

        Commands::Info { input } => {
            let config = load_config(&cli.config, None)?;
            let file_size = std::fs::metadata(&input)?.len();
            let frame_bytes = config.frame_bytes() as u64;

            println!("File: {}", input.display());
            println!(
                "Size: {} bytes ({:.2} MB)",
                file_size,
                file_size as f64 / 1_000_000.0
            );
            println!(
                "Frame: {} crystals x {} pixels = {} bytes",
                config.n_crystals, config.geometry.n_pixels_premerge, frame_bytes
            );
            println!("Frames: {}", file_size / frame_bytes);
            println!("Trailing bytes: {}", file_size % frame_bytes);
            println!(
                "Flows of {} frames: {}",
                config.max_frames_size,
                (file_size / frame_bytes).div_ceil(config.max_frames_size as u64)
            );
            if config.geometry.is_merged() {
                println!(
                    "Merged grid: {} x {} ({} pixels)",
                    config.geometry.n_rows(),
                    config.geometry.n_cols,
                    config.geometry.n_pixels
                );
            }
        }

        Commands::ReadClusters { input, max, size } => {
            let reader = ClusterFileReader::open(&input)?;
            let records = match size {
                Some(size) => reader.clusters_of_size(size),
                None => reader.clusters(),
            };

            let mut total = 0usize;
            for cluster in records {
                let cluster = cluster?;
                if total < max {
                    println!(
                        "frame {:>8}  pixels {:>2}  energy {:>9.2} keV  ids {:?}",
                        cluster.frame_id,
                        cluster.len(),
                        cluster.total_energy(),
                        cluster.pixel_ids
                    );
                }
                total += 1;
            }
            println!("Clusters: {}", total);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_calibration_store_by_extension() {
        let json = args(&["a.json", "skip"]);
        assert!(calibration_store(&json, &[], 2).is_ok());

        let mixed = args(&["a.json", "b.h5"]);
        assert!(matches!(
            calibration_store(&mixed, &[], 2),
            Err(CliError::Usage(_))
        ));

        let hdf5 = args(&["a.h5", "skip"]);
        assert_eq!(calibration_store(&hdf5, &[], 2).is_ok(), cfg!(feature = "hdf5"));
    }
}
