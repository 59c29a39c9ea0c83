//! Run configuration loading.
//!
//! Two formats are accepted:
//! - `.json`: a serialized [`RunConfig`]
//! - `.txt`: the acquisition `KEY = v1 v2 ...` list, comments starting at
//!   `#` or `/`

use crate::{Error, Result};
use czpix_core::config::{RunConfig, DEFAULT_DECODE_CHUNK_FRAMES, DEFAULT_MAX_EVENT_PIXELS};
use czpix_core::geometry::GeometryConfig;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Loads and validates a run configuration from `path`.
///
/// # Errors
/// Returns an error if the file is missing, has an unsupported extension,
/// cannot be parsed, or describes an invalid configuration.
pub fn load_run_config<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }

    let config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader)?
        }
        Some("txt") => parse_legacy_config(&std::fs::read_to_string(path)?)?,
        _ => {
            return Err(Error::InvalidFormat(format!(
                "config file must be .json or .txt: {}",
                path.display()
            )))
        }
    };

    config.validate()?;
    log::info!("loaded configuration from {}", path.display());
    log::debug!("{config:?}");
    Ok(config)
}

/// Splits `KEY = v1 v2 ...` lines into a key map.
///
/// Text after `#` or `/` is ignored, as are lines without `=`. Values are
/// read up to the first token that is not a number.
fn parse_key_values(text: &str) -> HashMap<String, Vec<f64>> {
    text.lines()
        .filter_map(|line| {
            let line = line.find(['#', '/']).map_or(line, |at| &line[..at]);
            let (key, value) = line.split_once('=')?;
            let values = value
                .split_whitespace()
                .map_while(|token| token.parse::<f64>().ok())
                .collect();
            Some((key.trim().to_string(), values))
        })
        .collect()
}

struct LegacyKeys(HashMap<String, Vec<f64>>);

impl LegacyKeys {
    fn values(&self, key: &str) -> Result<&[f64]> {
        match self.0.get(key) {
            Some(values) if !values.is_empty() => Ok(values),
            Some(_) => Err(config_error(format!("{key} has no value"))),
            None => Err(config_error(format!("missing key {key}"))),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn count(&self, key: &str) -> Result<usize> {
        let value = self.values(key)?[0];
        if value < 0.0 || value.fract() != 0.0 {
            return Err(config_error(format!(
                "{key} must be a non-negative integer, got {value}"
            )));
        }
        Ok(value as usize)
    }

    fn count_or(&self, key: &str, default: usize) -> Result<usize> {
        if self.0.contains_key(key) {
            self.count(key)
        } else {
            Ok(default)
        }
    }
}

fn config_error(msg: String) -> Error {
    Error::CoreError(czpix_core::Error::Config(msg))
}

/// Parses the acquisition `KEY = values` format into a [`RunConfig`].
///
/// Merge keys default to no merging; `MAX_EVENT_PIXELS` and
/// `DECODE_CHUNK_FRAMES` are optional. Unknown keys are ignored.
///
/// # Errors
/// Returns an error naming the first missing or malformed key.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_legacy_config(text: &str) -> Result<RunConfig> {
    let keys = LegacyKeys(parse_key_values(text));

    let n_rows_premerge = keys.count("N_ROWS_PREMERGE")?;
    let n_cols_premerge = keys.count("N_COLS_PREMERGE")?;
    let geometry = GeometryConfig {
        n_rows_premerge,
        n_cols_premerge,
        n_readout_pixels: keys.count("N_READOUT_PIXELS")?,
        n_readout_groups: keys.count("N_READOUT_GROUPS")?,
        n_pixels_premerge: keys.count("N_PIXELS_PREMERGE")?,
        n_pixels: keys.count("N_PIXELS")?,
        row_merge_fold: keys.count_or("ROW_MERGE_FOLD", 1)?,
        col_merge_fold: keys.count_or("COL_MERGE_FOLD", 1)?,
        row_merge_index: keys.count_or("ROW_MERGE_INDEX", 0)?,
        col_merge_index: keys.count_or("COL_MERGE_INDEX", 0)?,
        n_cols: keys.count("N_COLS")?,
    };

    let secondary_threshold = keys
        .values("SECONDARY_THRESHOLD")?
        .iter()
        .map(|&v| v as f32)
        .collect();

    Ok(RunConfig::new(
        geometry,
        keys.count("N_CRYSTALS")?,
        keys.count("MAX_FRAMES_SIZE")?,
        keys.count("N_THREADS")?,
        secondary_threshold,
    )
    .with_decode_chunk_frames(keys.count_or("DECODE_CHUNK_FRAMES", DEFAULT_DECODE_CHUNK_FRAMES)?)
    .with_max_event_pixels(keys.count_or("MAX_EVENT_PIXELS", DEFAULT_MAX_EVENT_PIXELS)?))
}
