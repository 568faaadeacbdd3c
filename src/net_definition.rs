//! Serializable description of a layer graph.

use serde::{Deserialize, Serialize};

use crate::errors::{NetError, NetResult};
use crate::param_dict::ParamDict;

/// Ordered list of layers. A blob is referenced by name and must be produced
/// by an earlier layer before any layer consumes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetDefinition {
    pub layers: Vec<LayerDefinition>,
}

/// One layer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDefinition {
    #[serde(rename = "type")]
    pub layer_type: String,
    pub name: String,
    #[serde(default)]
    pub bottoms: Vec<String>,
    #[serde(default)]
    pub tops: Vec<String>,
    #[serde(default)]
    pub params: ParamDict,
}

impl NetDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> NetResult<Self> {
        serde_json::from_str(json).map_err(|e| NetError::InvalidDefinition {
            message: e.to_string(),
        })
    }

    pub fn to_json_string(&self) -> NetResult<String> {
        serde_json::to_string(self).map_err(|e| NetError::InvalidDefinition {
            message: e.to_string(),
        })
    }

    pub fn with_layer(mut self, layer: LayerDefinition) -> Self {
        self.layers.push(layer);
        self
    }
}

impl LayerDefinition {
    pub fn new(layer_type: &str, name: &str, bottoms: &[&str], tops: &[&str]) -> Self {
        Self {
            layer_type: layer_type.to_string(),
            name: name.to_string(),
            bottoms: bottoms.iter().map(|s| s.to_string()).collect(),
            tops: tops.iter().map(|s| s.to_string()).collect(),
            params: ParamDict::new(),
        }
    }

    pub fn with_params(mut self, params: ParamDict) -> Self {
        self.params = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "layers": [
                {"type": "Input", "name": "data", "tops": ["data"], "params": {"0": 4, "1": 4, "2": 3}},
                {"type": "ReLU", "name": "relu", "bottoms": ["data"], "tops": ["out"], "params": {"0": 0.1}}
            ]
        }"#;
        let def = NetDefinition::from_json_str(json).unwrap();
        assert_eq!(def.layers.len(), 2);
        assert_eq!(def.layers[0].params.get_int(2, 0), 3);
        assert!(def.layers[0].bottoms.is_empty());
        assert!((def.layers[1].params.get_float(0, 0.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_json() {
        let result = NetDefinition::from_json_str("{\"layers\": [{\"name\": 3}]}");
        assert!(matches!(result, Err(NetError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_json_round_trip() {
        let def = NetDefinition::new().with_layer(
            LayerDefinition::new("Crop", "crop", &["a", "b"], &["c"])
                .with_params(ParamDict::new().with_int(0, -233)),
        );
        let json = def.to_json_string().unwrap();
        assert_eq!(NetDefinition::from_json_str(&json).unwrap(), def);
    }
}
