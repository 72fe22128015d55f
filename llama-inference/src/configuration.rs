#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use crate::tensor::Tensor;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Key naming the model architecture
const ARCHITECTURE_KEY: &str = "general.architecture";
/// Architecture assumed when the parameters do not name one
const DEFAULT_ARCHITECTURE: &str = "llama";
/// Key prefixes that are never qualified with the architecture name
const ABSOLUTE_PREFIXES: &[&str] = &["general.", "tokenizer."];

/// Hyperparameter source: a flat map of GGUF-style keys such as `llama.embedding_length`.
///
/// Accessors take architecture-relative keys (`embedding_length`), keys under `general.` and
/// `tokenizer.` are used as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: Map<String, Value>,
}

impl Parameters {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse parameters as a JSON object")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters: {}", path.display()))?;

        Self::from_json_str(&content).with_context(|| format!("Invalid parameters file: {}", path.display()))
    }

    /// Sets a value, resolving `key` the same way accessors do.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let key = self.resolve_key(key);
        self.values.insert(key, value.into());
        self
    }

    pub fn architecture(&self) -> &str {
        self.values.get(ARCHITECTURE_KEY).and_then(Value::as_str).unwrap_or(DEFAULT_ARCHITECTURE)
    }

    fn resolve_key(&self, key: &str) -> String {
        if ABSOLUTE_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            key.to_string()
        } else {
            format!("{}.{key}", self.architecture())
        }
    }

    fn lookup(&self, key: &str) -> (String, Option<&Value>) {
        let key = self.resolve_key(key);
        let value = self.values.get(&key);
        (key, value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).1.is_some()
    }

    pub fn uint(&self, key: &str) -> Result<u32> {
        match self.lookup(key) {
            (key, Some(value)) => as_u32(&key, value),
            (key, None) => anyhow::bail!("Missing parameter: {key}"),
        }
    }

    pub fn uint_or(&self, key: &str, default: u32) -> Result<u32> {
        match self.lookup(key) {
            (key, Some(value)) => as_u32(&key, value),
            (_, None) => Ok(default),
        }
    }

    pub fn float(&self, key: &str) -> Result<f32> {
        match self.lookup(key) {
            (key, Some(value)) => as_f32(&key, value),
            (key, None) => anyhow::bail!("Missing parameter: {key}"),
        }
    }

    pub fn float_or(&self, key: &str, default: f32) -> Result<f32> {
        match self.lookup(key) {
            (key, Some(value)) => as_f32(&key, value),
            (_, None) => Ok(default),
        }
    }

    pub fn string(&self, key: &str) -> Result<&str> {
        match self.lookup(key) {
            (key, Some(value)) => {
                value.as_str().with_context(|| format!("Parameter {key} is not a string: {value}"))
            }
            (key, None) => anyhow::bail!("Missing parameter: {key}"),
        }
    }

    pub fn strings(&self, key: &str) -> Result<Vec<String>> {
        self.array(key)?
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                value
                    .as_str()
                    .map(str::to_string)
                    .with_context(|| format!("Element {idx} of {key} is not a string"))
            })
            .collect()
    }

    pub fn floats(&self, key: &str) -> Result<Vec<f32>> {
        self.array(key)?
            .iter()
            .enumerate()
            .map(|(idx, value)| as_f32(&format!("{key}[{idx}]"), value))
            .collect()
    }

    fn array(&self, key: &str) -> Result<&Vec<Value>> {
        match self.lookup(key) {
            (key, Some(value)) => value.as_array().with_context(|| format!("Parameter {key} is not an array")),
            (key, None) => anyhow::bail!("Missing parameter: {key}"),
        }
    }
}

fn as_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .with_context(|| format!("Parameter {key} is not an unsigned 32-bit integer: {value}"))
}

fn as_f32(key: &str, value: &Value) -> Result<f32> {
    value.as_f64().map(|v| v as f32).with_context(|| format!("Parameter {key} is not a number: {value}"))
}

/// Architecture hyperparameters shared by every layer of a loaded model.
#[derive(Debug, Clone)]
pub struct Options {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    /// RMS normalization epsilon
    pub eps: f32,
    pub rope_base: f32,
    /// Multiplier applied to every rotary angle (1 = no scaling)
    pub rope_scale: f32,
    /// Number of leading head dimensions that are rotated
    pub rope_dim: usize,
    /// Optional per-pair divisors of the rotary frequencies, `[rope_dim / 2]`
    pub rope_factors: Option<Tensor>,
}

impl Options {
    /// Reads hyperparameters. Values are not validated here, see [`Options::validate`].
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let hidden_size = params.uint("embedding_length")? as usize;
        let num_heads = params.uint("attention.head_count")? as usize;
        let num_kv_heads = params.uint_or("attention.head_count_kv", num_heads as u32)? as usize;
        let head_dim = hidden_size.checked_div(num_heads).unwrap_or_default();

        Ok(Self {
            hidden_size,
            num_heads,
            num_kv_heads,
            eps: params.float("attention.layer_norm_rms_epsilon")?,
            rope_base: params.float("rope.freq_base")?,
            rope_scale: params.float_or("rope.freq_scale", 1.0)?,
            rope_dim: params.uint_or("rope.dimension_count", head_dim as u32)? as usize,
            rope_factors: None,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Width of the key/value projections.
    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.num_kv_heads
    }

    /// Query heads served by each key/value head.
    pub fn kv_group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Checks the invariants the attention layout relies on.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("hidden_size", self.hidden_size),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!("Invalid {name}: must be positive");
            }
        }

        if self.hidden_size % self.num_heads != 0 {
            anyhow::bail!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size,
                self.num_heads
            );
        }

        if self.num_heads % self.num_kv_heads != 0 {
            anyhow::bail!(
                "num_heads {} must be divisible by num_kv_heads {}",
                self.num_heads,
                self.num_kv_heads
            );
        }

        let head_dim = self.head_dim();
        if self.rope_dim % 2 != 0 || self.rope_dim > head_dim {
            anyhow::bail!("rope_dim {} must be even and at most head_dim {head_dim}", self.rope_dim);
        }

        if self.eps <= 0.0 || self.rope_base <= 0.0 || self.rope_scale <= 0.0 {
            anyhow::bail!(
                "eps ({}), rope_base ({}) and rope_scale ({}) must be positive",
                self.eps,
                self.rope_base,
                self.rope_scale
            );
        }

        if let Some(factors) = &self.rope_factors {
            if factors.len() != self.rope_dim / 2 {
                anyhow::bail!("Expected {} rope factors, got {}", self.rope_dim / 2, factors.len());
            }
        }

        Ok(())
    }
}
