//! # MLP Builder
//!
//! Fully connected networks used by every learned function of the
//! simulator. A network is an explicit list of [`Linear`] layers; every layer
//! except the last is followed by the hidden activation, the last one by the
//! output activation.
//!
//! ```text
//! input ─► Linear ─► act ─► Linear ─► act ─► … ─► Linear ─► output_act
//! ```

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::GnsError;
use crate::GnsResult;

/// Element-wise activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Identity => Ok(x.clone()),
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(x),
        }
    }
}

/// Shape of an MLP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpConfig {
    pub input_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub output_size: Option<usize>,
    pub activation: Activation,
    pub output_activation: Activation,
}

impl MlpConfig {
    pub fn new(input_size: usize, hidden_sizes: Vec<usize>) -> Self {
        Self {
            input_size,
            hidden_sizes,
            output_size: None,
            activation: Activation::Relu,
            output_activation: Activation::Identity,
        }
    }

    pub fn with_output(mut self, output_size: usize) -> Self {
        self.output_size = Some(output_size);
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_output_activation(mut self, activation: Activation) -> Self {
        self.output_activation = activation;
        self
    }

    /// `[input] + hidden + [output?]`
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.hidden_sizes.len() + 2);
        sizes.push(self.input_size);
        sizes.extend_from_slice(&self.hidden_sizes);
        if let Some(output) = self.output_size {
            sizes.push(output);
        }
        sizes
    }

    /// Width of the network output
    pub fn out_size(&self) -> usize {
        self.output_size
            .or_else(|| self.hidden_sizes.last().copied())
            .unwrap_or(self.input_size)
    }

    pub fn build(&self, vb: VarBuilder) -> GnsResult<Mlp> {
        if self.hidden_sizes.is_empty() {
            return Err(GnsError::InvalidConfig(
                "an MLP needs at least one hidden layer".to_string(),
            ));
        }
        if let Some(zero) = self.layer_sizes().iter().position(|&s| s == 0) {
            return Err(GnsError::InvalidConfig(format!(
                "MLP layer {} has zero width",
                zero
            )));
        }

        let sizes = self.layer_sizes();
        let mut layers = Vec::with_capacity(sizes.len() - 1);
        for (i, pair) in sizes.windows(2).enumerate() {
            layers.push(linear(pair[0], pair[1], vb.pp(format!("linear_{}", i)))?);
        }

        Ok(Mlp {
            layers,
            activation: self.activation,
            output_activation: self.output_activation,
        })
    }
}

/// Build an MLP with ReLU hidden activations and identity output.
pub fn build_mlp(
    input_size: usize,
    hidden_sizes: &[usize],
    output_size: Option<usize>,
    vb: VarBuilder,
) -> GnsResult<Mlp> {
    let mut config = MlpConfig::new(input_size, hidden_sizes.to_vec());
    config.output_size = output_size;
    config.build(vb)
}

/// Feed-forward network
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    output_activation: Activation,
}

impl Mlp {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let last = self.layers.len() - 1;
        let mut hidden = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            hidden = if i == last {
                self.output_activation.apply(&hidden)?
            } else {
                self.activation.apply(&hidden)?
            };
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_layer_count_and_shape() {
        let varmap = VarMap::new();
        let mlp = build_mlp(7, &[32, 32], Some(3), vb(&varmap)).unwrap();
        assert_eq!(mlp.num_layers(), 3);

        let x = Tensor::randn(0f32, 1.0, (5, 7), &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap();
        assert_eq!(y.dims(), &[5, 3]);
    }

    #[test]
    fn test_without_output_size() {
        let varmap = VarMap::new();
        let config = MlpConfig::new(4, vec![8, 6]);
        assert_eq!(config.out_size(), 6);
        let mlp = config.build(vb(&varmap)).unwrap();
        assert_eq!(mlp.num_layers(), 2);
    }

    #[test]
    fn test_empty_hidden_rejected() {
        let varmap = VarMap::new();
        let result = build_mlp(4, &[], Some(2), vb(&varmap));
        assert!(matches!(result, Err(GnsError::InvalidConfig(_))));
    }

    #[test]
    fn test_output_activation_applied() {
        let varmap = VarMap::new();
        let mlp = MlpConfig::new(3, vec![8])
            .with_output(4)
            .with_output_activation(Activation::Relu)
            .build(vb(&varmap))
            .unwrap();
        let x = Tensor::randn(0f32, 10.0, (16, 3), &Device::Cpu).unwrap();
        let y: Vec<f32> = mlp.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|v| *v >= 0.0));
    }
}
