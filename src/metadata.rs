//! Dataset metadata: dimension, timestep, domain bounds, cylinder geometry and
//! the offline acceleration/velocity statistics.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::GnsError;
use crate::GnsResult;

/// Cylinder description as stored in metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryMetadata {
    pub axis_start: Vec<f64>,
    pub axis_end: Vec<f64>,
    pub radius: f64,
}

/// Description of a trajectory dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Particle dimension (2 or 3)
    pub dim: usize,
    /// Positions per trajectory
    pub sequence_length: usize,
    /// Integration timestep
    pub dt: f64,
    /// `[min, max]` per axis
    pub bounds: Vec<[f64; 2]>,
    pub geometry: GeometryMetadata,
    pub acc_mean: Vec<f64>,
    pub acc_std: Vec<f64>,
    pub vel_mean: Vec<f64>,
    pub vel_std: Vec<f64>,
    /// Radius used to clamp wall distances; the cylinder radius when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_connectivity_radius: Option<f64>,
}

impl Metadata {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> GnsResult<Self> {
        let metadata: Self = serde_json::from_str(json)
            .map_err(|e| GnsError::InvalidConfig(format!("malformed metadata: {}", e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Read `metadata.json` from a dataset directory
    pub fn read(data_path: impl AsRef<Path>) -> GnsResult<Self> {
        let path = data_path.as_ref().join("metadata.json");
        let content = fs::read_to_string(&path)
            .map_err(|e| GnsError::Io(format!("Failed to read {:?}: {}", path, e)))?;
        let metadata = Self::from_json(&content)?;
        log::info!(
            "Loaded metadata from {:?}: dim={}, sequence_length={}, dt={}",
            path,
            metadata.dim,
            metadata.sequence_length,
            metadata.dt
        );
        Ok(metadata)
    }

    /// Radius used to clamp boundary distance features
    pub fn clamp_radius(&self) -> f64 {
        self.default_connectivity_radius
            .unwrap_or(self.geometry.radius)
    }

    pub fn validate(&self) -> GnsResult<()> {
        if self.dim != 2 && self.dim != 3 {
            return Err(GnsError::InvalidConfig(format!(
                "metadata dim must be 2 or 3, got {}",
                self.dim
            )));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(GnsError::InvalidConfig(format!(
                "metadata dt must be positive, got {}",
                self.dt
            )));
        }
        let per_dim: [(&str, usize); 7] = [
            ("bounds", self.bounds.len()),
            ("geometry.axis_start", self.geometry.axis_start.len()),
            ("geometry.axis_end", self.geometry.axis_end.len()),
            ("acc_mean", self.acc_mean.len()),
            ("acc_std", self.acc_std.len()),
            ("vel_mean", self.vel_mean.len()),
            ("vel_std", self.vel_std.len()),
        ];
        for (field, len) in per_dim {
            if len != self.dim {
                return Err(GnsError::InvalidConfig(format!(
                    "metadata field {} has {} entries, expected {}",
                    field, len, self.dim
                )));
            }
        }
        for (axis, [lo, hi]) in self.bounds.iter().enumerate() {
            if !(lo < hi) {
                return Err(GnsError::InvalidConfig(format!(
                    "bounds for axis {} are empty: [{}, {}]",
                    axis, lo, hi
                )));
            }
        }
        let radius = self.clamp_radius();
        if !(radius.is_finite() && radius > 0.0) {
            return Err(GnsError::InvalidConfig(format!(
                "clamp radius must be positive, got {}",
                radius
            )));
        }
        Ok(())
    }
}
