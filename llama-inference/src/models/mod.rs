use crate::{
    cache::Cache,
    configuration::{Options, Parameters},
    tensor::{Context, Tensor},
    tokenizer::{SharedTextProcessor, TextProcessor, Vocabulary},
    weights::{WeightRegistry, WeightSpec},
};
use anyhow::{Context as _, Result};
use std::sync::Arc;

mod llama;

pub use llama::LlamaModel;

/// Inputs of a single forward pass.
pub struct ModelInputs<'a> {
    /// Token ids, one per new position
    pub tokens: &'a [i32],
    /// Absolute position of every token
    pub positions: &'a [i32],
    /// Positions whose logits are returned, defaults to the last one
    pub outputs: Option<&'a [i32]>,
    pub cache: &'a mut dyn Cache,
}

impl<'a> ModelInputs<'a> {
    pub fn new(tokens: &'a [i32], positions: &'a [i32], cache: &'a mut dyn Cache) -> Self {
        Self { tokens, positions, outputs: None, cache }
    }

    pub fn with_outputs(mut self, outputs: &'a [i32]) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

/// Contains the main inference logic of a decoder model.
pub trait Model {
    /// Runs the forward pass, returning logits of shape `[vocab_size, outputs.len()]`.
    fn forward(&self, ctx: &Context, inputs: ModelInputs<'_>) -> Result<Tensor>;

    fn options(&self) -> &Options;

    fn num_layers(&self) -> usize;

    fn vocab_size(&self) -> usize;

    fn text_processor(&self) -> Option<&(dyn TextProcessor + Send + Sync)>;
}

#[non_exhaustive]
pub enum Models {
    Llama(LlamaModel),
}

impl Model for Models {
    fn forward(&self, ctx: &Context, inputs: ModelInputs<'_>) -> Result<Tensor> {
        match self {
            Models::Llama(model) => model.forward(ctx, inputs),
        }
    }

    fn options(&self) -> &Options {
        match self {
            Models::Llama(model) => model.options(),
        }
    }

    fn num_layers(&self) -> usize {
        match self {
            Models::Llama(model) => model.num_layers(),
        }
    }

    fn vocab_size(&self) -> usize {
        match self {
            Models::Llama(model) => model.vocab_size(),
        }
    }

    fn text_processor(&self) -> Option<&(dyn TextProcessor + Send + Sync)> {
        match self {
            Models::Llama(model) => model.text_processor(),
        }
    }
}

impl std::fmt::Debug for Models {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Models::Llama(model) => std::fmt::Debug::fmt(model, f),
        }
    }
}

/// Lists the tensors the architecture named in `params` expects.
pub fn weight_specs(params: &Parameters) -> Result<Vec<WeightSpec>> {
    match params.architecture() {
        llama::ARCHITECTURE => llama::weight_specs(params),
        x => anyhow::bail!("Unknown architecture: {x}"),
    }
}

/// Builder pattern for creating models
pub struct ModelBuilder {
    params: Parameters,
    weights: Option<WeightRegistry>,
    text_processor: Option<SharedTextProcessor>,
}

impl ModelBuilder {
    pub fn new(params: Parameters) -> Self {
        Self { params, weights: None, text_processor: None }
    }

    pub fn with_weights(mut self, weights: WeightRegistry) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Overrides the text processor built from `tokenizer.ggml.*` parameters.
    pub fn with_text_processor(mut self, text_processor: SharedTextProcessor) -> Self {
        self.text_processor = Some(text_processor);
        self
    }

    pub fn build(self) -> Result<Models> {
        let weights = self.weights.context("Model weights are required")?;

        let text_processor = match self.text_processor {
            Some(text_processor) => Some(text_processor),
            None if self.params.contains("tokenizer.ggml.tokens") => {
                let vocabulary = Vocabulary::from_parameters(&self.params).context("Failed to load vocabulary")?;
                Some(Arc::new(vocabulary) as SharedTextProcessor)
            }
            None => None,
        };

        match self.params.architecture() {
            llama::ARCHITECTURE => Ok(Models::Llama(LlamaModel::new(&self.params, weights, text_processor)?)),
            x => anyhow::bail!("Unknown architecture: {x}"),
        }
    }
}
