//! Mill geometry: the cylindrical vessel and the axis-aligned domain walls.
//!
//! A cylinder is given by the two end points of its axis and its radius.
//! For a point `p`, with `a` the axis start and `u` the unit axis direction:
//!
//! ```text
//! t       = (p - a) · u             distance past the start cap
//! r       = |(p - a) - t u|         radial distance from the axis
//! lateral = radius - r              positive inside the vessel
//! end     = length - t              distance before the end cap
//! ```

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::GnsError;
use crate::metadata::{GeometryMetadata, Metadata};
use crate::GnsResult;

/// Signed distances of a point to the cylinder surfaces
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CylinderDistance {
    pub lateral: f64,
    pub start_cap: f64,
    pub end_cap: f64,
}

/// Immutable cylindrical boundary
#[derive(Debug, Clone)]
pub struct Cylinder {
    axis_start: Vec<f64>,
    axis_end: Vec<f64>,
    radius: f64,
    length: f64,
    direction: Vec<f64>,
    start_t: Tensor,
    direction_col: Tensor,
    direction_row: Tensor,
}

impl Cylinder {
    pub fn new(
        axis_start: Vec<f64>,
        axis_end: Vec<f64>,
        radius: f64,
        device: &Device,
    ) -> GnsResult<Self> {
        if axis_start.len() != axis_end.len() {
            return Err(GnsError::DimensionMismatch {
                expected: axis_start.len(),
                got: axis_end.len(),
            });
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(GnsError::InvalidConfig(format!(
                "cylinder radius must be positive, got {}",
                radius
            )));
        }
        let axis: Vec<f64> = axis_end
            .iter()
            .zip(axis_start.iter())
            .map(|(e, s)| e - s)
            .collect();
        let length = axis.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !(length.is_finite() && length > 1e-12) {
            return Err(GnsError::InvalidConfig(
                "cylinder axis has zero length".to_string(),
            ));
        }
        let direction: Vec<f64> = axis.iter().map(|v| v / length).collect();

        let dim = direction.len();
        let to_f32 = |v: &[f64]| v.iter().map(|x| *x as f32).collect::<Vec<f32>>();
        let start_t = Tensor::from_vec(to_f32(&axis_start), (1, dim), device)?;
        let direction_col = Tensor::from_vec(to_f32(&direction), (dim, 1), device)?;
        let direction_row = direction_col.reshape((1, dim))?;

        Ok(Self {
            axis_start,
            axis_end,
            radius,
            length,
            direction,
            start_t,
            direction_col,
            direction_row,
        })
    }

    pub fn from_metadata(geometry: &GeometryMetadata, device: &Device) -> GnsResult<Self> {
        Self::new(
            geometry.axis_start.clone(),
            geometry.axis_end.clone(),
            geometry.radius,
            device,
        )
    }

    pub fn dim(&self) -> usize {
        self.direction.len()
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn axis_start(&self) -> &[f64] {
        &self.axis_start
    }

    pub fn axis_end(&self) -> &[f64] {
        &self.axis_end
    }

    /// Distances of a single point
    pub fn distance(&self, point: &[f64]) -> GnsResult<CylinderDistance> {
        if point.len() != self.dim() {
            return Err(GnsError::DimensionMismatch {
                expected: self.dim(),
                got: point.len(),
            });
        }
        let rel: Vec<f64> = point
            .iter()
            .zip(self.axis_start.iter())
            .map(|(p, a)| p - a)
            .collect();
        let t: f64 = rel.iter().zip(self.direction.iter()).map(|(r, u)| r * u).sum();
        let radial = rel
            .iter()
            .zip(self.direction.iter())
            .map(|(r, u)| (r - t * u).powi(2))
            .sum::<f64>()
            .sqrt();
        Ok(CylinderDistance {
            lateral: self.radius - radial,
            start_cap: t,
            end_cap: self.length - t,
        })
    }

    /// `[lateral, start_cap, end_cap]` for every row of `positions` `[N, D]`
    pub fn distances(&self, positions: &Tensor) -> GnsResult<Tensor> {
        let (_, dim) = positions.dims2()?;
        if dim != self.dim() {
            return Err(GnsError::DimensionMismatch {
                expected: self.dim(),
                got: dim,
            });
        }
        let rel = positions.broadcast_sub(&self.start_t)?;
        let t = rel.matmul(&self.direction_col)?;
        let radial = (rel - t.broadcast_mul(&self.direction_row)?)?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?;
        let lateral = radial.affine(-1.0, self.radius)?;
        let end_cap = t.affine(-1.0, self.length)?;
        Ok(Tensor::cat(&[&lateral, &t, &end_cap], 1)?)
    }

    /// `[start..., end..., radius]`, used to fingerprint checkpoints
    pub fn as_flat(&self) -> Vec<f64> {
        let mut flat = self.axis_start.clone();
        flat.extend_from_slice(&self.axis_end);
        flat.push(self.radius);
        flat
    }
}

/// Axis-aligned domain walls
#[derive(Debug, Clone)]
pub struct DomainBounds {
    bounds: Vec<[f64; 2]>,
    lower: Tensor,
    upper: Tensor,
}

impl DomainBounds {
    pub fn new(bounds: Vec<[f64; 2]>, device: &Device) -> GnsResult<Self> {
        let dim = bounds.len();
        let lower: Vec<f32> = bounds.iter().map(|b| b[0] as f32).collect();
        let upper: Vec<f32> = bounds.iter().map(|b| b[1] as f32).collect();
        Ok(Self {
            lower: Tensor::from_vec(lower, (1, dim), device)?,
            upper: Tensor::from_vec(upper, (1, dim), device)?,
            bounds,
        })
    }

    pub fn from_metadata(metadata: &Metadata, device: &Device) -> GnsResult<Self> {
        Self::new(metadata.bounds.clone(), device)
    }

    pub fn dim(&self) -> usize {
        self.bounds.len()
    }

    pub fn bounds(&self) -> &[[f64; 2]] {
        &self.bounds
    }

    /// `[p - min (per axis), max - p (per axis)]` for `positions` `[N, D]`
    pub fn distances(&self, positions: &Tensor) -> GnsResult<Tensor> {
        let to_lower = positions.broadcast_sub(&self.lower)?;
        let to_upper = self.upper.broadcast_sub(positions)?;
        Ok(Tensor::cat(&[&to_lower, &to_upper], 1)?)
    }
}

/// Divide by `radius` and clamp to `[-1, 1]`
pub fn clamp_to_radius(distances: &Tensor, radius: f64) -> GnsResult<Tensor> {
    Ok(distances.affine(1.0 / radius, 0.0)?.clamp(-1f32, 1f32)?)
}
