//! Activation functions fused into convolution outputs.
//!
//! Layers select an activation with an integer type id and an optional
//! parameter array, both read from the layer's parameter dictionary.

use crate::errors::{LayerError, LayerResult};

/// Activation applied once per output element after accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    /// f(x) = x.
    #[default]
    Identity,
    /// f(x) = max(0, x).
    Relu,
    /// f(x) = x for x >= 0, slope * x otherwise.
    LeakyRelu { slope: f32 },
    /// f(x) = min(max(x, min), max).
    Clip { min: f32, max: f32 },
    /// f(x) = 1 / (1 + exp(-x)).
    Sigmoid,
}

impl Activation {
    /// Builds an activation from its type id and parameters.
    ///
    /// Ids: 0 identity, 1 ReLU, 2 leaky ReLU (`[slope]`), 3 clip
    /// (`[min, max]`), 4 sigmoid. `param_key` names the parameter the id came
    /// from for error reporting.
    pub fn from_params(activation_type: i32, params: &[f32], param_key: usize) -> LayerResult<Self> {
        let missing = |expected: usize| LayerError::InvalidParam {
            key: param_key,
            reason: format!(
                "activation type {activation_type} needs {expected} parameters, got {}",
                params.len()
            ),
        };

        match activation_type {
            0 => Ok(Activation::Identity),
            1 => Ok(Activation::Relu),
            2 => match params {
                [slope, ..] => Ok(Activation::LeakyRelu { slope: *slope }),
                _ => Err(missing(1)),
            },
            3 => match params {
                [min, max, ..] => Ok(Activation::Clip {
                    min: *min,
                    max: *max,
                }),
                _ => Err(missing(2)),
            },
            4 => Ok(Activation::Sigmoid),
            other => Err(LayerError::InvalidParam {
                key: param_key,
                reason: format!("unknown activation type {other}"),
            }),
        }
    }

    /// Integer id understood by [`Activation::from_params`].
    pub fn type_id(&self) -> i32 {
        match self {
            Activation::Identity => 0,
            Activation::Relu => 1,
            Activation::LeakyRelu { .. } => 2,
            Activation::Clip { .. } => 3,
            Activation::Sigmoid => 4,
        }
    }

    /// Parameters in the order [`Activation::from_params`] reads them.
    pub fn params(&self) -> [f32; 2] {
        match *self {
            Activation::LeakyRelu { slope } => [slope, 0.0],
            Activation::Clip { min, max } => [min, max],
            _ => [0.0, 0.0],
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Activation::Identity)
    }

    /// Apply the activation function to a single value.
    #[inline(always)]
    pub fn apply_single(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { slope } => {
                if x < 0.0 {
                    x * slope
                } else {
                    x
                }
            }
            Activation::Clip { min, max } => x.max(min).min(max),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// Apply the activation function to a slice of values in place.
    pub fn apply_in_place(self, values: &mut [f32]) {
        if self.is_identity() {
            return;
        }
        for val in values.iter_mut() {
            *val = self.apply_single(*val);
        }
    }
}
