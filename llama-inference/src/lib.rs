//! Forward pass of LLaMA-family decoder models.
//!
//! The crate provides the computation graph (token embedding, decoder layers with rotary
//! self-attention and key/value caching, gated feed-forward, output projection) together with
//! the collaborators it needs to run on its own: a CPU tensor engine, a key/value cache, a
//! parameter source, a weight registry and a BPE vocabulary.

pub mod cache;
pub mod configuration;
pub mod generation;
pub mod layers;
pub mod models;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

use anyhow::{Context as _, Result};
use log::{debug, info};
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::cache::{Cache, KvCache, LayerCache};
pub use crate::configuration::{Options, Parameters};
pub use crate::generation::{argmax, generate_greedy, top_k};
pub use crate::models::{Model, ModelBuilder, ModelInputs, Models};
pub use crate::tensor::{Context, IndexTensor, Tensor};
pub use crate::tokenizer::{SharedTextProcessor, TextProcessor, Vocabulary};
pub use crate::weights::{SyntheticWeights, WeightRegistry};

/// Context length used when neither the caller nor the parameters set one.
const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub parameters_path: String,
    pub seed: u64,
    pub ctx_length: Option<usize>,
    pub mode: String,
    pub tokens: Option<Vec<i32>>,
    pub prompt: Option<String>,
    pub steps: usize,
    pub top_k: usize,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    parameters_path: Option<String>,
    seed: Option<u64>,
    ctx_length: Option<usize>,
    mode: Option<String>,
    tokens: Option<Vec<i32>>,
    prompt: Option<String>,
    steps: Option<usize>,
    top_k: Option<usize>,
}

impl RunConfigBuilder {
    pub fn parameters_path(mut self, path: Option<&String>) -> Self {
        self.parameters_path = path.cloned();
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn mode(mut self, mode: Option<&str>) -> Self {
        self.mode = mode.map(str::to_string);
        self
    }
    pub fn tokens(mut self, tokens: Option<Vec<i32>>) -> Self {
        self.tokens = tokens;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn build(self) -> Result<RunConfig, String> {
        Ok(RunConfig {
            parameters_path: self.parameters_path.ok_or("parameters_path is required")?,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|duration| duration.as_secs()).unwrap_or_default()
            }),
            ctx_length: self.ctx_length,
            mode: self.mode.unwrap_or_else(|| "forward".to_string()),
            tokens: self.tokens,
            prompt: self.prompt,
            steps: self.steps.unwrap_or(16),
            top_k: self.top_k.unwrap_or(5),
        })
    }
}

/// Builds a model over synthetic weights and runs it in the configured mode.
pub fn run(config: RunConfig) -> Result<()> {
    debug!("{config:#?}");

    let params = Parameters::from_json_file(&config.parameters_path)?;
    let weights = SyntheticWeights::new(config.seed).build(&params).context("Failed to generate weights")?;
    let model = ModelBuilder::new(params.clone()).with_weights(weights).build()?;

    debug!("{model:#?}");

    let capacity = match config.ctx_length {
        Some(ctx_length) => ctx_length,
        None => params.uint_or("context_length", DEFAULT_CONTEXT_LENGTH)? as usize,
    };
    let mut cache = KvCache::new(model.num_layers(), capacity);
    let ctx = Context::new();

    let tokens = prompt_tokens(&model, &config)?;
    info!("Running {} over {} prompt tokens", config.mode, tokens.len());

    match config.mode.as_str() {
        "forward" => {
            let positions: Vec<i32> = (0..tokens.len() as i32).collect();
            let logits = model.forward(&ctx, ModelInputs::new(&tokens, &positions, &mut cache))?;

            println!("logits shape: {:?}", &logits.shape()[..2]);
            for (id, logit) in top_k(&logits, 0, config.top_k) {
                println!("{id:>8} {logit:>12.6} {}", render(&model, id as i32));
            }
            Ok(())
        }
        "generate" => {
            let stop = model.text_processor().and_then(|processor| processor.eos_token_id());
            let generated = generate_greedy(&model, &ctx, &mut cache, &tokens, config.steps, stop)?;

            println!("{generated:?}");
            if let Some(processor) = model.text_processor() {
                println!("{}", processor.decode(&generated)?);
            }
            Ok(())
        }
        _ => anyhow::bail!("Unknown mode: {}", config.mode),
    }
}

fn prompt_tokens(model: &Models, config: &RunConfig) -> Result<Vec<i32>> {
    match (&config.tokens, &config.prompt, model.text_processor()) {
        (Some(tokens), _, _) => Ok(tokens.clone()),
        (None, Some(prompt), Some(processor)) => {
            let mut tokens: Vec<i32> = processor.bos_token_id().into_iter().collect();
            tokens.extend(processor.encode(prompt)?);
            Ok(tokens)
        }
        (None, Some(_), None) => anyhow::bail!("A prompt needs tokenizer.ggml.tokens in the parameters"),
        (None, None, _) => anyhow::bail!("Please provide tokens or a prompt"),
    }
}

fn render(model: &Models, id: i32) -> String {
    model.text_processor().and_then(|processor| processor.decode(&[id]).ok()).unwrap_or_default()
}
