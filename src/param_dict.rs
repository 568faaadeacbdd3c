//! Key-indexed layer parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single parameter value.
///
/// Deserialized untagged, so `3` is an int, `0.5` a float and `[1, 2]` an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Array(Vec<f32>),
}

/// Parameters of one layer instance, addressed by integer key.
///
/// Missing keys resolve to the default the caller passes in, so each layer
/// documents its own defaults at the read site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamDict {
    values: BTreeMap<usize, ParamValue>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_int(&self, key: usize, default: i32) -> i32 {
        match self.values.get(&key) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) => *v as i32,
            _ => default,
        }
    }

    pub fn get_float(&self, key: usize, default: f32) -> f32 {
        match self.values.get(&key) {
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f32,
            _ => default,
        }
    }

    pub fn get_array(&self, key: usize, default: &[f32]) -> Vec<f32> {
        match self.values.get(&key) {
            Some(ParamValue::Array(v)) => v.clone(),
            Some(ParamValue::Float(v)) => vec![*v],
            Some(ParamValue::Int(v)) => vec![*v as f32],
            None => default.to_vec(),
        }
    }

    pub fn set_int(&mut self, key: usize, value: i32) {
        self.values.insert(key, ParamValue::Int(value));
    }

    pub fn set_float(&mut self, key: usize, value: f32) {
        self.values.insert(key, ParamValue::Float(value));
    }

    pub fn set_array(&mut self, key: usize, value: Vec<f32>) {
        self.values.insert(key, ParamValue::Array(value));
    }

    pub fn contains(&self, key: usize) -> bool {
        self.values.contains_key(&key)
    }

    /// Chainable form of [`ParamDict::set_int`].
    pub fn with_int(mut self, key: usize, value: i32) -> Self {
        self.set_int(key, value);
        self
    }

    /// Chainable form of [`ParamDict::set_float`].
    pub fn with_float(mut self, key: usize, value: f32) -> Self {
        self.set_float(key, value);
        self
    }

    /// Chainable form of [`ParamDict::set_array`].
    pub fn with_array(mut self, key: usize, value: Vec<f32>) -> Self {
        self.set_array(key, value);
        self
    }
}
