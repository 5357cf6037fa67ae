//! Adam with checkpointable state and the exponential learning-rate decay.
//!
//! Moments are keyed by parameter name, so a train-state file written on one
//! run can be restored into a freshly built simulator on the next.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::checkpoint::write_atomic;
use crate::error::GnsError;
use crate::GnsResult;

const STEP_KEY: &str = "__train_state__.global_step";
const ADAM_STEP_KEY: &str = "__train_state__.adam_step";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Snapshot of the optimizer: update count and `(m, v)` per parameter name
#[derive(Debug, Clone)]
pub struct AdamState {
    pub step: usize,
    pub moments: BTreeMap<String, (Tensor, Tensor)>,
}

impl AdamState {
    pub fn to_device(&self, device: &Device) -> GnsResult<Self> {
        let mut moments = BTreeMap::new();
        for (name, (m, v)) in &self.moments {
            moments.insert(name.clone(), (m.to_device(device)?, v.to_device(device)?));
        }
        Ok(Self {
            step: self.step,
            moments,
        })
    }
}

#[derive(Debug)]
struct Moments {
    m: Var,
    v: Var,
}

/// Adam over every variable of a [`VarMap`]
#[derive(Debug)]
pub struct Adam {
    vars: Vec<(String, Var)>,
    moments: BTreeMap<String, Moments>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdam) -> GnsResult<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| GnsError::SerializationError("parameter map lock poisoned".to_string()))?;
        let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(data);
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let mut moments = BTreeMap::new();
        for (name, var) in &vars {
            moments.insert(
                name.clone(),
                Moments {
                    m: Var::zeros(var.dims(), var.dtype(), var.device())?,
                    v: Var::zeros(var.dims(), var.dtype(), var.device())?,
                },
            );
        }
        Ok(Self {
            vars,
            moments,
            step_t: 0,
            params,
        })
    }

    /// Parameters in name order
    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    /// Number of updates applied so far
    pub fn adam_step(&self) -> usize {
        self.step_t
    }

    /// Apply one update; parameters without a gradient are left alone.
    pub fn step(&mut self, grads: &GradStore) -> GnsResult<()> {
        self.step_t += 1;
        let ParamsAdam { lr, beta1, beta2, eps } = self.params;
        let bias1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias2 = 1.0 - beta2.powi(self.step_t as i32);

        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let moments = self
                .moments
                .get(name)
                .ok_or_else(|| GnsError::CheckpointMismatch(format!("no optimizer state for {}", name)))?;

            let next_m = ((moments.m.as_tensor() * beta1)? + (grad * (1.0 - beta1))?)?;
            let next_v = ((moments.v.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m / bias1)?;
            let v_hat = (&next_v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (var.as_tensor() - (update * lr)?)?;

            moments.m.set(&next_m)?;
            moments.v.set(&next_v)?;
            var.set(&next_theta)?;
        }
        Ok(())
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            step: self.step_t,
            moments: self
                .moments
                .iter()
                .map(|(name, m)| (name.clone(), (m.m.as_tensor().clone(), m.v.as_tensor().clone())))
                .collect(),
        }
    }

    /// Backpropagate `loss` and apply the update
    pub fn backward_step(&mut self, loss: &Tensor) -> GnsResult<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Write moments and `global_step` to `path`
    pub fn save_state(&self, path: impl AsRef<Path>, global_step: usize) -> GnsResult<()> {
        let state = self.state().to_device(&Device::Cpu)?;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[global_step as i64], &Device::Cpu)?,
        );
        tensors.insert(
            ADAM_STEP_KEY.to_string(),
            Tensor::new(&[state.step as i64], &Device::Cpu)?,
        );
        for (name, (m, v)) in state.moments {
            tensors.insert(format!("m.{}", name), m);
            tensors.insert(format!("v.{}", name), v);
        }
        write_atomic(path.as_ref(), |tmp| {
            candle_core::safetensors::save(&tensors, tmp)?;
            Ok(())
        })?;
        log::info!("Saved train state at step {} to {:?}", global_step, path.as_ref());
        Ok(())
    }

    /// Restore moments and return the stored global step
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> GnsResult<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GnsError::ModelNotFound(path.to_path_buf()));
        }
        let stored = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| GnsError::SerializationError(format!("Failed to read {:?}: {}", path, e)))?;

        let read_counter = |key: &str| -> GnsResult<usize> {
            let tensor = stored
                .get(key)
                .ok_or_else(|| GnsError::CheckpointMismatch(format!("{:?} has no {}", path, key)))?;
            let values: Vec<i64> = tensor.to_dtype(DType::I64)?.to_vec1()?;
            values
                .first()
                .map(|v| *v as usize)
                .ok_or_else(|| GnsError::CheckpointMismatch(format!("{:?} has an empty {}", path, key)))
        };
        let global_step = read_counter(STEP_KEY)?;
        let adam_step = read_counter(ADAM_STEP_KEY)?;

        for (name, moments) in &self.moments {
            for (prefix, target) in [("m", &moments.m), ("v", &moments.v)] {
                let key = format!("{}.{}", prefix, name);
                let tensor = stored.get(&key).ok_or_else(|| {
                    GnsError::CheckpointMismatch(format!("{:?} has no optimizer state {}", path, key))
                })?;
                if tensor.dims() != target.dims() {
                    return Err(GnsError::CheckpointMismatch(format!(
                        "optimizer state {} has shape {:?}, expected {:?}",
                        key,
                        tensor.dims(),
                        target.dims()
                    )));
                }
                target.set(&tensor.to_dtype(target.dtype())?.to_device(target.device())?)?;
            }
        }
        self.step_t = adam_step;
        log::info!("Loaded train state from {:?} (step {})", path, global_step);
        Ok(global_step)
    }
}

/// `lr(step) = lr_init · lr_decay^(step / lr_decay_steps) · world_size`
#[derive(Debug, Clone)]
pub struct LRScheduler {
    lr_init: f64,
    lr_decay: f64,
    lr_decay_steps: usize,
    world_size: usize,
    current_step: usize,
}

impl LRScheduler {
    pub fn new(lr_init: f64, lr_decay: f64, lr_decay_steps: usize, world_size: usize) -> Self {
        Self {
            lr_init,
            lr_decay,
            lr_decay_steps: lr_decay_steps.max(1),
            world_size: world_size.max(1),
            current_step: 0,
        }
    }

    pub fn get_lr(&self) -> f64 {
        let exponent = self.current_step as f64 / self.lr_decay_steps as f64;
        self.lr_init * self.lr_decay.powf(exponent) * self.world_size as f64
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Jump to `step` (after a resume)
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}
