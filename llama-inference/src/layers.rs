use crate::tensor::{IndexTensor, Tensor};
use anyhow::{Context, Result};

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [hidden_size, vocab_size], one column per token
/// **Note**: Often shared with output projection weights (weight tying)
#[derive(Clone)]
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn dim(&self) -> usize {
        self.weight.dim(0)
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dim(1)
    }

    /// Looks up `tokens`, producing `[hidden_size, tokens.len()]`.
    pub fn forward(&self, tokens: &IndexTensor) -> Result<Tensor> {
        self.weight.rows(tokens).context("Token id out of vocabulary")
    }
}

impl std::fmt::Debug for Embedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedding")
            .field("dim", &self.dim())
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm {
    pub weight: Tensor,
}

impl RMSNorm {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn forward(&self, x: &Tensor, eps: f32) -> Tensor {
        x.rms_norm(eps).mul(&self.weight)
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.dim(0)).finish()
    }
}

/// Linear layer without bias, weight stored as `[in_features, out_features]`
#[derive(Clone)]
pub struct Linear {
    pub weight: Tensor,
}

impl Linear {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn in_features(&self) -> usize {
        self.weight.dim(0)
    }

    pub fn out_features(&self) -> usize {
        self.weight.dim(1)
    }

    /// `[in_features, seq_len]` -> `[out_features, seq_len]`
    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.weight.mulmat(x)
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .finish()
    }
}
