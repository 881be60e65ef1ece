//! Typed model of an API-format workflow graph.
//!
//! A workflow is a JSON object of node objects; node inputs reference
//! other nodes as `["<node_id>", <output_index>]` pairs. Instead of
//! chasing those pairs through untyped maps, [`WorkflowGraph`] exposes
//! fallible accessors that turn every shape mismatch into a
//! [`WorkflowError`]. Patching injects the prompt texts and per-cell
//! parameter overrides, leaving every other node untouched.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Identifier of one node in the graph.
pub type NodeId = String;

const CLASS_KSAMPLER: &str = "KSampler";
const CLASS_TEXT_ENCODE: &str = "CLIPTextEncode";
const CLASS_EMPTY_LATENT: &str = "EmptyLatentImage";
const CLASS_SAVE_IMAGE: &str = "SaveImage";

/// Shape mismatches and lookup failures in a workflow graph.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow json must be an object of node objects")]
    InvalidShape,

    #[error("workflow json is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("referenced node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node {node} expected class_type={expected}, got {actual}")]
    WrongClassType {
        node: NodeId,
        expected: &'static str,
        actual: String,
    },

    #[error("invalid reference at {node}.inputs.{input}")]
    InvalidReference { node: NodeId, input: String },

    #[error("no KSampler node found in workflow")]
    SamplerNotFound,

    #[error("multiple KSampler nodes found; specify one of: {0}")]
    SamplerAmbiguous(String),
}

/// Per-cell parameter overrides applied while patching.
///
/// `None` fields leave the graph's own value in place.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOverrides {
    pub seed: Option<u64>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub denoise: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
}

/// Generation defaults read back out of a workflow graph.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefaults {
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub denoise: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
}

/// A validated workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Map<String, Value>,
}

impl WorkflowGraph {
    /// Build a graph from a parsed JSON value, validating that it is an
    /// object whose values are all objects.
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        let Value::Object(nodes) = value else {
            return Err(WorkflowError::InvalidShape);
        };
        if nodes.values().any(|node| !node.is_object()) {
            return Err(WorkflowError::InvalidShape);
        }
        Ok(Self { nodes })
    }

    /// Load and validate a workflow file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let contents = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(serde_json::from_str(&contents)?)
    }

    /// The graph as a JSON value, for submission.
    pub fn to_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    fn node(&self, id: &str) -> Result<&Map<String, Value>, WorkflowError> {
        self.nodes
            .get(id)
            .and_then(Value::as_object)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.to_string()))
    }

    /// The node's `class_type`, if present.
    pub fn class_type(&self, id: &str) -> Option<&str> {
        self.nodes.get(id)?.get("class_type")?.as_str()
    }

    /// Resolve the node id referenced by `inputs.<input_name>`.
    ///
    /// References are `["<node_id>", <output_index>]` arrays; anything
    /// else is a shape error.
    pub fn resolve_reference(&self, node_id: &str, input_name: &str) -> Result<NodeId, WorkflowError> {
        let invalid = || WorkflowError::InvalidReference {
            node: node_id.to_string(),
            input: input_name.to_string(),
        };

        let node = self.node(node_id)?;
        let reference = node
            .get("inputs")
            .and_then(Value::as_object)
            .and_then(|inputs| inputs.get(input_name))
            .and_then(Value::as_array)
            .ok_or_else(invalid)?;
        let target = reference
            .first()
            .and_then(Value::as_str)
            .ok_or_else(invalid)?;
        if target.is_empty() {
            return Err(invalid());
        }
        Ok(target.to_string())
    }

    /// Check a node exists and carries the expected `class_type`.
    pub fn require_class_type(
        &self,
        node_id: &str,
        expected: &'static str,
    ) -> Result<(), WorkflowError> {
        let node = self.node(node_id)?;
        let actual = node.get("class_type").and_then(Value::as_str).unwrap_or("");
        if actual != expected {
            return Err(WorkflowError::WrongClassType {
                node: node_id.to_string(),
                expected,
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Find the sampler node to drive.
    ///
    /// With an explicit id the node must exist and be a `KSampler`.
    /// Otherwise there must be exactly one `KSampler` in the graph;
    /// multiple candidates are listed (with their `_meta.title`) in the
    /// error so the caller can pick one.
    pub fn find_sampler(&self, requested: Option<&str>) -> Result<NodeId, WorkflowError> {
        let candidates: Vec<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| self.class_type(id) == Some(CLASS_KSAMPLER))
            .collect();

        if candidates.is_empty() {
            return Err(WorkflowError::SamplerNotFound);
        }

        if let Some(requested) = requested {
            if !self.nodes.contains_key(requested) {
                return Err(WorkflowError::NodeNotFound(requested.to_string()));
            }
            self.require_class_type(requested, CLASS_KSAMPLER)?;
            return Ok(requested.to_string());
        }

        if candidates.len() > 1 {
            let details = candidates
                .iter()
                .map(|id| self.format_node_title(id))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(WorkflowError::SamplerAmbiguous(details));
        }

        Ok(candidates[0].to_string())
    }

    fn format_node_title(&self, node_id: &str) -> String {
        let title = self
            .nodes
            .get(node_id)
            .and_then(|node| node.get("_meta"))
            .and_then(|meta| meta.get("title"))
            .and_then(Value::as_str)
            .filter(|title| !title.is_empty());
        match title {
            Some(title) => format!("{node_id} ({title})"),
            None => format!("{node_id} (<no title>)"),
        }
    }

    /// Read the generation defaults wired into the sampler: the negative
    /// prompt text, the latent image dimensions, and the sampler's own
    /// inputs. Values with unexpected types read as `None`.
    pub fn extract_defaults(&self, sampler_id: &str) -> Result<WorkflowDefaults, WorkflowError> {
        let negative_id = self.resolve_reference(sampler_id, "negative")?;
        let latent_id = self.resolve_reference(sampler_id, "latent_image")?;

        self.require_class_type(&negative_id, CLASS_TEXT_ENCODE)?;
        self.require_class_type(&latent_id, CLASS_EMPTY_LATENT)?;

        let inputs = |id: &str| -> Map<String, Value> {
            self.nodes
                .get(id)
                .and_then(|node| node.get("inputs"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        let sampler_inputs = inputs(sampler_id);
        let negative_inputs = inputs(&negative_id);
        let latent_inputs = inputs(&latent_id);

        Ok(WorkflowDefaults {
            negative_prompt: negative_inputs
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            width: coerce_u32(latent_inputs.get("width")),
            height: coerce_u32(latent_inputs.get("height")),
            batch_size: coerce_u32(latent_inputs.get("batch_size")),
            steps: coerce_u32(sampler_inputs.get("steps")),
            cfg: coerce_f64(sampler_inputs.get("cfg")),
            denoise: coerce_f64(sampler_inputs.get("denoise")),
            sampler_name: coerce_string(sampler_inputs.get("sampler_name")),
            scheduler: coerce_string(sampler_inputs.get("scheduler")),
        })
    }

    /// Produce a patched copy of the graph for one generation.
    ///
    /// Injects the prompt texts into the text-encode nodes wired to the
    /// sampler's `positive`/`negative` inputs, applies the provided
    /// overrides to the sampler and latent nodes, and (when given) sets
    /// the filename prefix on every `SaveImage` node.
    pub fn patch(
        &self,
        positive_prompt: &str,
        negative_prompt: &str,
        overrides: &WorkflowOverrides,
        sampler_id: &str,
        save_image_prefix: Option<&str>,
    ) -> Result<WorkflowGraph, WorkflowError> {
        let positive_id = self.resolve_reference(sampler_id, "positive")?;
        let negative_id = self.resolve_reference(sampler_id, "negative")?;
        let latent_id = self.resolve_reference(sampler_id, "latent_image")?;

        self.require_class_type(&positive_id, CLASS_TEXT_ENCODE)?;
        self.require_class_type(&negative_id, CLASS_TEXT_ENCODE)?;
        self.require_class_type(&latent_id, CLASS_EMPTY_LATENT)?;

        let mut patched = self.clone();
        patched.set_input(&positive_id, "text", positive_prompt.into());
        patched.set_input(&negative_id, "text", negative_prompt.into());

        let sampler_values: [(&str, Option<Value>); 6] = [
            ("seed", overrides.seed.map(Value::from)),
            ("steps", overrides.steps.map(Value::from)),
            ("cfg", overrides.cfg.map(Value::from)),
            ("denoise", overrides.denoise.map(Value::from)),
            ("sampler_name", overrides.sampler_name.clone().map(Value::from)),
            ("scheduler", overrides.scheduler.clone().map(Value::from)),
        ];
        for (key, value) in sampler_values {
            if let Some(value) = value {
                patched.set_input(sampler_id, key, value);
            }
        }

        let latent_values: [(&str, Option<Value>); 3] = [
            ("width", overrides.width.map(Value::from)),
            ("height", overrides.height.map(Value::from)),
            ("batch_size", overrides.batch_size.map(Value::from)),
        ];
        for (key, value) in latent_values {
            if let Some(value) = value {
                patched.set_input(&latent_id, key, value);
            }
        }

        if let Some(prefix) = save_image_prefix {
            let save_nodes: Vec<NodeId> = patched
                .nodes
                .keys()
                .filter(|id| patched.class_type(id) == Some(CLASS_SAVE_IMAGE))
                .cloned()
                .collect();
            for id in save_nodes {
                patched.set_input(&id, "filename_prefix", prefix.into());
            }
        }

        Ok(patched)
    }

    fn set_input(&mut self, node_id: &str, key: &str, value: Value) {
        // Callers have already validated the node exists.
        let Some(node) = self.nodes.get_mut(node_id).and_then(Value::as_object_mut) else {
            return;
        };
        let inputs = node
            .entry("inputs")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(inputs) = inputs.as_object_mut() {
            inputs.insert(key.to_string(), value);
        }
    }
}

fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return u32::try_from(v).ok();
            }
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 {
                return Some(f as u32);
            }
            None
        }
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}
