#[cfg(test)]
#[path = "../tests/unit/weights_test.rs"]
mod weights_test;

use crate::configuration::Parameters;
use crate::tensor::{Tensor, expand_shape};
use anyhow::{Context, Result};
use std::collections::HashMap;

/// Named weight tensors, consumed once while a model is constructed.
///
/// Names follow the GGML convention (`token_embd.weight`, `blk.0.attn_q.weight`, ...),
/// shapes are in GGML order (`[in_features, out_features]` for projections).
#[derive(Default)]
pub struct WeightRegistry {
    tensors: HashMap<String, Tensor>,
}

impl WeightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Remaining tensor names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Removes a required tensor, checking its shape.
    pub fn take(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        self.take_optional(name, shape)?.with_context(|| format!("Missing tensor: {name}"))
    }

    /// Removes a tensor that may be absent, checking its shape when present.
    pub fn take_optional(&mut self, name: &str, shape: &[usize]) -> Result<Option<Tensor>> {
        let Some(tensor) = self.tensors.remove(name) else {
            return Ok(None);
        };

        let expected = expand_shape(shape);
        if tensor.shape() != expected {
            anyhow::bail!("Tensor {name} has shape {:?}, expected {expected:?}", tensor.shape());
        }

        Ok(Some(tensor))
    }
}

impl std::fmt::Debug for WeightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightRegistry")
            .field("tensors", &self.tensors.len())
            .field("elements", &self.tensors.values().map(Tensor::len).sum::<usize>())
            .finish()
    }
}

/// Role of a tensor within an architecture, used to pick initial values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    /// Normalization scale, initialized to ones
    Norm,
    /// Required projection or embedding matrix
    Projection,
    /// Projection that falls back to another tensor when absent
    OptionalProjection,
    /// Rotary frequency correction factors (optional)
    RopeFactors,
}

/// Describes one tensor an architecture expects.
#[derive(Debug, Clone)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: WeightKind,
}

impl WeightSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], kind: WeightKind) -> Self {
        Self { name: name.into(), shape: shape.to_vec(), kind }
    }
}

/// Generates a complete set of random weights for a parameter set.
///
/// Used for smoke runs and tests where real checkpoints are not available. Values are
/// uniform in `[-scale, scale]`, norm weights are ones and rope factors are left out.
#[derive(Debug, Clone)]
pub struct SyntheticWeights {
    seed: u64,
    scale: f32,
    tie_output: bool,
}

impl SyntheticWeights {
    pub fn new(seed: u64) -> Self {
        Self { seed, scale: 0.1, tie_output: false }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Skips the output projection so the model reuses the token embedding.
    pub fn with_tied_output(mut self, tie_output: bool) -> Self {
        self.tie_output = tie_output;
        self
    }

    pub fn build(&self, params: &Parameters) -> Result<WeightRegistry> {
        let mut rng = XorShiftRng::new(self.seed);
        let mut registry = WeightRegistry::new();

        for spec in crate::models::weight_specs(params)? {
            let size = spec.shape.iter().product::<usize>();
            let data = match spec.kind {
                WeightKind::Norm => vec![1.0; size],
                WeightKind::Projection => rng.uniform_vec(size, self.scale),
                WeightKind::OptionalProjection if !self.tie_output => rng.uniform_vec(size, self.scale),
                WeightKind::OptionalProjection | WeightKind::RopeFactors => continue,
            };
            registry.insert(spec.name, Tensor::new(data, &spec.shape));
        }

        Ok(registry)
    }
}

/// Xorshift-based random number generator.
pub(crate) struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> Self {
        const MIX: u64 = 0x9E37_79B9_7F4A_7C15;
        // xorshift never leaves a zero state
        let state = seed ^ MIX;
        Self { state: if state == 0 { MIX } else { state } }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }

    pub fn uniform_vec(&mut self, size: usize, scale: f32) -> Vec<f32> {
        (0..size).map(|_| (self.next_f32() * 2.0 - 1.0) * scale).collect()
    }
}
