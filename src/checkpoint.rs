//! # Checkpoint Files
//!
//! Naming, discovery and atomic writing of training checkpoints.
//!
//! ## File Layout
//!
//! Every save produces a pair of files in the model directory sharing the
//! experiment id and the global step:
//!
//! ```text
//! model_path/
//! ├── <exp_id>-model-<step>.pt        # parameters + metadata fingerprint
//! └── <exp_id>-train-state-<step>.pt  # optimizer moments + global step
//! ```
//!
//! Both are safetensors documents. Files are written to a temporary file in
//! the same directory and renamed into place, so a crash never leaves a
//! truncated checkpoint behind.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mill_gns::checkpoint::{resolve_pair, CheckpointSelector};
//!
//! match resolve_pair("models/", "test", &CheckpointSelector::Latest, &CheckpointSelector::Latest)? {
//!     Some(pair) => trainer.resume(&pair)?,
//!     None => log::info!("no checkpoint, starting from scratch"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

use crate::error::GnsError;
use crate::GnsResult;

const MODEL_TAG: &str = "model";
const TRAIN_STATE_TAG: &str = "train-state";
const EXTENSION: &str = "pt";

/// Which checkpoint to resume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckpointSelector {
    /// Highest step found in the model directory, or none
    Latest,
    /// A file name inside the model directory
    File(String),
}

impl From<String> for CheckpointSelector {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("latest") {
            CheckpointSelector::Latest
        } else {
            CheckpointSelector::File(value)
        }
    }
}

impl From<CheckpointSelector> for String {
    fn from(value: CheckpointSelector) -> Self {
        value.to_string()
    }
}

impl FromStr for CheckpointSelector {
    type Err = GnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(GnsError::InvalidConfig("empty checkpoint name".to_string()));
        }
        Ok(CheckpointSelector::from(s.to_string()))
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointSelector::Latest => write!(f, "latest"),
            CheckpointSelector::File(name) => write!(f, "{}", name),
        }
    }
}

/// Matching model and train-state files for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPair {
    pub step: usize,
    pub model: PathBuf,
    pub train_state: PathBuf,
}

pub fn model_file_name(exp_id: &str, step: usize) -> String {
    format!("{}-{}-{}.{}", exp_id, MODEL_TAG, step, EXTENSION)
}

pub fn train_state_file_name(exp_id: &str, step: usize) -> String {
    format!("{}-{}-{}.{}", exp_id, TRAIN_STATE_TAG, step, EXTENSION)
}

/// Paths of the pair written at `step`
pub fn pair_for_step(model_dir: impl AsRef<Path>, exp_id: &str, step: usize) -> CheckpointPair {
    let dir = model_dir.as_ref();
    CheckpointPair {
        step,
        model: dir.join(model_file_name(exp_id, step)),
        train_state: dir.join(train_state_file_name(exp_id, step)),
    }
}

/// Step suffix of a checkpoint file name: `"a-model-250.pt"` → `Some(250)`.
///
/// Everything between the tag and the extension must be the step.
pub fn parse_step(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(&format!(".{}", EXTENSION))?;
    let (_, rest) = stem
        .rsplit_once(&format!("-{}-", TRAIN_STATE_TAG))
        .or_else(|| stem.rsplit_once(&format!("-{}-", MODEL_TAG)))?;
    parse_digits(rest)
}

fn parse_digits(text: &str) -> Option<usize> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Steps of every model file of `exp_id` in `model_dir`, highest first
pub fn list_checkpoints(model_dir: impl AsRef<Path>, exp_id: &str) -> GnsResult<Vec<usize>> {
    let dir = model_dir.as_ref();
    let mut steps = Vec::new();

    if !dir.exists() {
        return Ok(steps);
    }

    let prefix = format!("{}-{}-", exp_id, MODEL_TAG);
    let suffix = format!(".{}", EXTENSION);
    for entry in fs::read_dir(dir).map_err(|e| GnsError::Io(e.to_string()))? {
        let entry = entry.map_err(|e| GnsError::Io(e.to_string()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let step = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .and_then(parse_digits);
        if let Some(step) = step {
            steps.push(step);
        }
    }

    steps.sort_unstable_by(|a, b| b.cmp(a));
    Ok(steps)
}

pub fn latest_step(model_dir: impl AsRef<Path>, exp_id: &str) -> GnsResult<Option<usize>> {
    Ok(list_checkpoints(model_dir, exp_id)?.first().copied())
}

/// Resolve the checkpoint pair to resume from.
///
/// `Ok(None)` means both selectors are `Latest` and no checkpoint exists
/// yet. Named files must exist and carry the same step suffix.
pub fn resolve_pair(
    model_dir: impl AsRef<Path>,
    exp_id: &str,
    model_file: &CheckpointSelector,
    train_state_file: &CheckpointSelector,
) -> GnsResult<Option<CheckpointPair>> {
    let dir = model_dir.as_ref();
    let pair = match (model_file, train_state_file) {
        (CheckpointSelector::Latest, CheckpointSelector::Latest) => match latest_step(dir, exp_id)? {
            Some(step) => pair_for_step(dir, exp_id, step),
            None => return Ok(None),
        },
        (CheckpointSelector::File(model), CheckpointSelector::File(state)) => {
            let model_step = parse_step(model).ok_or_else(|| {
                GnsError::CheckpointMismatch(format!("cannot read a step from {}", model))
            })?;
            let state_step = parse_step(state).ok_or_else(|| {
                GnsError::CheckpointMismatch(format!("cannot read a step from {}", state))
            })?;
            if model_step != state_step {
                return Err(GnsError::CheckpointMismatch(format!(
                    "model file {} (step {}) and train state {} (step {}) differ",
                    model, model_step, state, state_step
                )));
            }
            CheckpointPair {
                step: model_step,
                model: dir.join(model),
                train_state: dir.join(state),
            }
        }
        _ => {
            return Err(GnsError::InvalidConfig(
                "model_file and train_state_file must both be latest or both name a file".to_string(),
            ))
        }
    };

    for path in [&pair.model, &pair.train_state] {
        if !path.exists() {
            return Err(GnsError::ModelNotFound(path.clone()));
        }
    }
    Ok(Some(pair))
}

/// Write `path` through a temporary file in the same directory.
pub fn write_atomic<F>(path: &Path, write: F) -> GnsResult<()>
where
    F: FnOnce(&Path) -> GnsResult<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| GnsError::Io(format!("Failed to create checkpoint dir {:?}: {}", dir, e)))?;

    let tmp = NamedTempFile::new_in(&dir)?;
    write(tmp.path())?;
    tmp.persist(path)
        .map_err(|e| GnsError::Io(format!("Failed to move checkpoint into {:?}: {}", path, e)))?;
    Ok(())
}
