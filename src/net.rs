//! Static layer graph and its blob table.
//!
//! A [`Net`] is built once from a [`NetDefinition`] and a weight source, then
//! shared read-only by any number of [`Extractor`] sessions. Layers are kept
//! in definition order, which is a valid topological order: every blob's
//! producer precedes all of its consumers.

use log::{debug, info};

use crate::config::RuntimeConfig;
use crate::errors::{LayerError, NetError, NetResult};
use crate::extractor::Extractor;
use crate::layers::{create_layer, Layer};
use crate::model_bin::ModelBin;
use crate::net_definition::NetDefinition;

/// A layer instance with its blob wiring.
pub struct LayerNode {
    type_name: String,
    name: String,
    bottoms: Vec<usize>,
    tops: Vec<usize>,
    layer: Box<dyn Layer>,
}

impl LayerNode {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bottoms(&self) -> &[usize] {
        &self.bottoms
    }

    pub fn tops(&self) -> &[usize] {
        &self.tops
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }

    pub fn is_input(&self) -> bool {
        self.type_name == "Input"
    }
}

impl std::fmt::Debug for LayerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerNode")
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .field("bottoms", &self.bottoms)
            .field("tops", &self.tops)
            .finish()
    }
}

/// A named slot in the blob table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    name: String,
    producer: Option<usize>,
    consumers: Vec<usize>,
}

impl Blob {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the layer writing this blob.
    pub fn producer(&self) -> Option<usize> {
        self.producer
    }

    /// Indices of the layers reading this blob, one entry per read.
    pub fn consumers(&self) -> &[usize] {
        &self.consumers
    }
}

#[derive(Debug, Default)]
pub struct Net {
    config: RuntimeConfig,
    layers: Vec<LayerNode>,
    blobs: Vec<Blob>,
}

impl Net {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            config,
            layers: Vec::new(),
            blobs: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Replaces the configuration. Pipelines already created keep the
    /// configuration they were built with.
    pub fn set_config(&mut self, config: RuntimeConfig) {
        self.config = config;
    }

    /// Builds the layer list and blob table, replacing any previous graph.
    pub fn load_param(&mut self, definition: &NetDefinition) -> NetResult<()> {
        self.clear();

        for (layer_index, def) in definition.layers.iter().enumerate() {
            let mut layer = create_layer(&def.layer_type).ok_or_else(|| NetError::UnknownLayerType {
                layer_type: def.layer_type.clone(),
                name: def.name.clone(),
            })?;

            if def.tops.is_empty() {
                return Err(NetError::EmptyLayerBlobs {
                    layer: def.name.clone(),
                    what: "top".to_string(),
                });
            }

            let flags = layer.flags();
            let is_input = def.layer_type == "Input";
            if !is_input {
                if flags.one_blob_only && (def.bottoms.len() != 1 || def.tops.len() != 1) {
                    return Err(NetError::layer(
                        &def.name,
                        LayerError::shape("single-blob layer bottoms", 1, def.bottoms.len()),
                    ));
                }
                if flags.support_inplace && def.bottoms.len() != def.tops.len() {
                    return Err(NetError::layer(
                        &def.name,
                        LayerError::shape("in-place layer tops", def.bottoms.len(), def.tops.len()),
                    ));
                }
            }

            let mut bottoms = Vec::with_capacity(def.bottoms.len());
            for name in &def.bottoms {
                let blob_index = self.blob_index(name).ok_or_else(|| NetError::UndefinedBlob {
                    name: name.clone(),
                    layer: def.name.clone(),
                })?;
                self.blobs[blob_index].consumers.push(layer_index);
                bottoms.push(blob_index);
            }

            let mut tops = Vec::with_capacity(def.tops.len());
            for name in &def.tops {
                if self.blob_index(name).is_some() {
                    return Err(NetError::DuplicateProducer { name: name.clone() });
                }
                self.blobs.push(Blob {
                    name: name.clone(),
                    producer: Some(layer_index),
                    consumers: Vec::new(),
                });
                tops.push(self.blobs.len() - 1);
            }

            layer
                .load_param(&def.params)
                .map_err(|e| NetError::layer(&def.name, e))?;

            self.layers.push(LayerNode {
                type_name: def.layer_type.clone(),
                name: def.name.clone(),
                bottoms,
                tops,
                layer,
            });
        }

        info!(
            "Loaded net with {} layers and {} blobs",
            self.layers.len(),
            self.blobs.len()
        );
        Ok(())
    }

    /// Parses a JSON definition and loads it.
    pub fn load_param_json(&mut self, json: &str) -> NetResult<()> {
        let definition = NetDefinition::from_json_str(json)?;
        self.load_param(&definition)
    }

    /// Reads every layer's weights in order, creates the pipelines and runs
    /// the requantize fusion pass.
    pub fn load_model(&mut self, mb: &mut dyn ModelBin) -> NetResult<()> {
        let config = &self.config;
        for node in &mut self.layers {
            node.layer
                .load_model(mb)
                .map_err(|e| NetError::layer(&node.name, e))?;
            node.layer
                .create_pipeline(config)
                .map_err(|e| NetError::layer(&node.name, e))?;
        }

        let fused = self.fuse_requantize();
        info!(
            "Loaded weights for {} layers ({} requantize fusions)",
            self.layers.len(),
            fused
        );
        Ok(())
    }

    /// Switches int8 convolutions whose only output feeds int8 convolutions
    /// with a common input scale to int8 output. Returns the number of
    /// layers switched.
    pub fn fuse_requantize(&mut self) -> usize {
        let mut fused = 0;
        for index in 0..self.layers.len() {
            let node = &self.layers[index];
            if node.layer.int8_input_scale().is_none() || node.tops.len() != 1 {
                continue;
            }

            let consumers = &self.blobs[node.tops[0]].consumers;
            let scales: Option<Vec<f32>> = consumers
                .iter()
                .map(|&c| self.layers[c].layer.int8_input_scale())
                .collect();
            let Some((&scale, rest)) = scales.as_deref().and_then(|s| s.split_first()) else {
                continue;
            };
            if rest.iter().any(|&s| s != scale) {
                continue;
            }

            let node = &mut self.layers[index];
            match node.layer.enable_int8_requantize(scale) {
                Ok(()) => {
                    debug!("Fused requantize into {} at scale {scale}", node.name);
                    fused += 1;
                }
                Err(e) => debug!("Kept float output for {}: {e}", node.name),
            }
        }
        fused
    }

    /// Destroys every pipeline and empties the graph.
    pub fn clear(&mut self) {
        let config = &self.config;
        for node in &mut self.layers {
            if let Err(e) = node.layer.destroy_pipeline(config) {
                debug!("Failed to destroy pipeline of {}: {e}", node.name);
            }
        }
        self.layers.clear();
        self.blobs.clear();
    }

    pub fn blob_index(&self, name: &str) -> Option<usize> {
        self.blobs.iter().position(|blob| blob.name == name)
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|node| node.name == name)
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn layers(&self) -> &[LayerNode] {
        &self.layers
    }

    /// Blobs the caller must provide, in definition order.
    pub fn input_names(&self) -> Vec<&str> {
        self.blobs
            .iter()
            .filter(|blob| self.is_input_blob(blob))
            .map(|blob| blob.name.as_str())
            .collect()
    }

    /// Blobs no layer consumes, in definition order.
    pub fn output_names(&self) -> Vec<&str> {
        self.blobs
            .iter()
            .filter(|blob| blob.consumers.is_empty())
            .map(|blob| blob.name.as_str())
            .collect()
    }

    pub(crate) fn is_input_blob(&self, blob: &Blob) -> bool {
        blob.producer
            .and_then(|p| self.layers.get(p))
            .is_some_and(LayerNode::is_input)
    }

    /// Starts a session using a copy of the net's configuration.
    pub fn create_extractor(&self) -> Extractor<'_> {
        Extractor::new(self, self.config.clone())
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        self.clear();
    }
}
