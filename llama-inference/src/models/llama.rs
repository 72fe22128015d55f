#[cfg(test)]
#[path = "../../tests/unit/llama_test.rs"]
mod llama_test;

use crate::{
    cache::LayerCache,
    configuration::{Options, Parameters},
    layers::{Embedding, Linear, RMSNorm},
    models::ModelInputs,
    tensor::{Context, IndexTensor, Tensor},
    tokenizer::{SharedTextProcessor, TextProcessor},
    weights::{WeightKind, WeightRegistry, WeightSpec},
};
use anyhow::{Context as _, Result};
use log::{info, trace, warn};

pub(crate) const ARCHITECTURE: &str = "llama";

const TOKEN_EMBEDDING: &str = "token_embd.weight";
const OUTPUT_NORM: &str = "output_norm.weight";
const OUTPUT: &str = "output.weight";
const ROPE_FREQS: &str = "rope_freqs.weight";

const ATTN_NORM: &str = "attn_norm";
const ATTN_Q: &str = "attn_q";
const ATTN_K: &str = "attn_k";
const ATTN_V: &str = "attn_v";
const ATTN_OUTPUT: &str = "attn_output";
const FFN_NORM: &str = "ffn_norm";
const FFN_UP: &str = "ffn_up";
const FFN_GATE: &str = "ffn_gate";
const FFN_DOWN: &str = "ffn_down";

fn layer_tensor(layer: usize, name: &str) -> String {
    format!("blk.{layer}.{name}.weight")
}

/// Vocabulary size from `vocab_size`, falling back to the tokenizer token count.
fn vocab_size(params: &Parameters) -> Result<usize> {
    if !params.contains("vocab_size") && params.contains("tokenizer.ggml.tokens") {
        return Ok(params.strings("tokenizer.ggml.tokens")?.len());
    }
    Ok(params.uint("vocab_size")? as usize)
}

/// Tensors of a llama model described by `params`, in GGML order.
pub(crate) fn weight_specs(params: &Parameters) -> Result<Vec<WeightSpec>> {
    let options = Options::from_parameters(params)?;
    options.validate()?;

    let vocab_size = vocab_size(params)?;
    let ff = params.uint("feed_forward_length")? as usize;
    let num_layers = params.uint("block_count")? as usize;
    let (hidden, kv_dim) = (options.hidden_size, options.kv_dim());

    let mut specs = vec![WeightSpec::new(TOKEN_EMBEDDING, &[hidden, vocab_size], WeightKind::Projection)];

    for layer in 0..num_layers {
        let tensors: [(&str, &[usize], WeightKind); 9] = [
            (ATTN_NORM, &[hidden], WeightKind::Norm),
            (ATTN_Q, &[hidden, hidden], WeightKind::Projection),
            (ATTN_K, &[hidden, kv_dim], WeightKind::Projection),
            (ATTN_V, &[hidden, kv_dim], WeightKind::Projection),
            (ATTN_OUTPUT, &[hidden, hidden], WeightKind::Projection),
            (FFN_NORM, &[hidden], WeightKind::Norm),
            (FFN_UP, &[hidden, ff], WeightKind::Projection),
            (FFN_GATE, &[hidden, ff], WeightKind::Projection),
            (FFN_DOWN, &[ff, hidden], WeightKind::Projection),
        ];
        specs.extend(
            tensors.into_iter().map(|(name, shape, kind)| WeightSpec::new(layer_tensor(layer, name), shape, kind)),
        );
    }

    specs.push(WeightSpec::new(OUTPUT_NORM, &[hidden], WeightKind::Norm));
    specs.push(WeightSpec::new(OUTPUT, &[hidden, vocab_size], WeightKind::OptionalProjection));
    specs.push(WeightSpec::new(ROPE_FREQS, &[options.rope_dim / 2], WeightKind::RopeFactors));

    Ok(specs)
}

/// Multi-head self-attention with grouped-query key/value heads and rotary positions.
///
/// Query head `h` reads key/value head `h / kv_group_size`.
pub struct SelfAttention {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub output: Linear,
}

impl SelfAttention {
    /// `[hidden_size, seq_len]` -> `[hidden_size, seq_len]`, appending this step's keys and
    /// values to `cache`.
    pub fn forward(
        &self,
        hidden_state: &Tensor,
        positions: &IndexTensor,
        cache: &mut dyn LayerCache,
        opts: &Options,
    ) -> Result<Tensor> {
        let seq_len = hidden_state.dim(1);
        let head_dim = opts.head_dim();
        let rope = |x: Tensor| {
            x.rope(positions, opts.rope_factors.as_ref(), opts.rope_dim, opts.rope_base, opts.rope_scale)
        };

        let q = rope(self.query.forward(hidden_state).reshape(&[head_dim, opts.num_heads, seq_len]));
        let k = rope(self.key.forward(hidden_state).reshape(&[head_dim, opts.num_kv_heads, seq_len]));
        let v = self.value.forward(hidden_state).reshape(&[head_dim, opts.num_kv_heads, seq_len]);

        let past = cache.cached_len();
        let (k, v) = cache.put(&k, &v)?;

        // [head_dim, seq, heads], [head_dim, total, kv_heads], [total, head_dim, kv_heads]
        let q = q.permute([0, 2, 1, 3]).contiguous();
        let k = k.permute([0, 2, 1, 3]).contiguous();
        let v = v.permute([1, 2, 0, 3]).contiguous();

        // [total, seq, heads]
        let kq = k.mulmat(&q).scale((head_dim as f32).sqrt().recip()).mask_causal(past).softmax();

        let kqv = v.mulmat(&kq).permute([0, 2, 1, 3]).contiguous().reshape(&[opts.hidden_size, seq_len]);

        Ok(self.output.forward(&kqv))
    }
}

impl std::fmt::Debug for SelfAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfAttention")
            .field("query", &self.query)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("output", &self.output)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// **Formula**: `Down · (SiLU(Gate · x) ⊙ (Up · x))`
pub struct Mlp {
    pub up: Linear,
    pub down: Linear,
    pub gate: Linear,
}

impl Mlp {
    pub fn forward(&self, hidden_state: &Tensor) -> Tensor {
        let gated = self.gate.forward(hidden_state).silu().mul(&self.up.forward(hidden_state));
        self.down.forward(&gated)
    }
}

impl std::fmt::Debug for Mlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mlp")
            .field("hidden_dim", &self.up.out_features())
            .field("up", &self.up)
            .field("gate", &self.gate)
            .field("down", &self.down)
            .finish()
    }
}

/// Decoder layer: pre-normalized attention and feed-forward blocks, each with a residual add.
pub struct Layer {
    pub attention_norm: RMSNorm,
    pub self_attention: SelfAttention,
    pub mlp_norm: RMSNorm,
    pub mlp: Mlp,
}

impl Layer {
    pub fn forward(
        &self,
        hidden_state: &Tensor,
        positions: &IndexTensor,
        cache: &mut dyn LayerCache,
        opts: &Options,
    ) -> Result<Tensor> {
        let normed = self.attention_norm.forward(hidden_state, opts.eps);
        let hidden_state = self.self_attention.forward(&normed, positions, cache, opts)?.add(hidden_state);

        let normed = self.mlp_norm.forward(&hidden_state, opts.eps);
        Ok(self.mlp.forward(&normed).add(&hidden_state))
    }

    fn load(weights: &mut WeightRegistry, layer: usize, opts: &Options) -> Result<Self> {
        let (hidden, kv_dim) = (opts.hidden_size, opts.kv_dim());
        let ff = weights
            .get(&layer_tensor(layer, FFN_UP))
            .map(|tensor| tensor.dim(1))
            .with_context(|| format!("Missing tensor: {}", layer_tensor(layer, FFN_UP)))?;
        if ff == 0 {
            anyhow::bail!("Invalid feed-forward width: {} has no columns", layer_tensor(layer, FFN_UP));
        }

        let mut take = |name: &str, shape: &[usize]| weights.take(&layer_tensor(layer, name), shape);

        Ok(Self {
            attention_norm: RMSNorm::new(take(ATTN_NORM, &[hidden])?),
            self_attention: SelfAttention {
                query: Linear::new(take(ATTN_Q, &[hidden, hidden])?),
                key: Linear::new(take(ATTN_K, &[hidden, kv_dim])?),
                value: Linear::new(take(ATTN_V, &[hidden, kv_dim])?),
                output: Linear::new(take(ATTN_OUTPUT, &[hidden, hidden])?),
            },
            mlp_norm: RMSNorm::new(take(FFN_NORM, &[hidden])?),
            mlp: Mlp {
                up: Linear::new(take(FFN_UP, &[hidden, ff])?),
                down: Linear::new(take(FFN_DOWN, &[ff, hidden])?),
                gate: Linear::new(take(FFN_GATE, &[hidden, ff])?),
            },
        })
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("attention_norm", &self.attention_norm)
            .field("self_attention", &self.self_attention)
            .field("mlp_norm", &self.mlp_norm)
            .field("mlp", &self.mlp)
            .finish()
    }
}

/// LLaMA-family decoder-only model.
pub struct LlamaModel {
    token_embedding: Embedding,
    layers: Vec<Layer>,
    output_norm: RMSNorm,
    /// Output projection, sharing the embedding table when the checkpoint has none
    output: Linear,
    options: Options,
    text_processor: Option<SharedTextProcessor>,
}

impl LlamaModel {
    pub fn new(
        params: &Parameters,
        mut weights: WeightRegistry,
        text_processor: Option<SharedTextProcessor>,
    ) -> Result<Self> {
        let mut options = Options::from_parameters(params)?;
        options.validate().context("Invalid llama configuration")?;
        options.rope_factors = weights.take_optional(ROPE_FREQS, &[options.rope_dim / 2])?;

        let num_layers = params.uint("block_count")? as usize;
        let hidden = options.hidden_size;

        let vocab_size = weights
            .get(TOKEN_EMBEDDING)
            .map(|tensor| tensor.dim(1))
            .with_context(|| format!("Missing tensor: {TOKEN_EMBEDDING}"))?;
        let token_embedding = Embedding::new(weights.take(TOKEN_EMBEDDING, &[hidden, vocab_size])?);

        let layers = (0..num_layers)
            .map(|layer| {
                Layer::load(&mut weights, layer, &options).with_context(|| format!("Failed to load layer {layer}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let output_norm = RMSNorm::new(weights.take(OUTPUT_NORM, &[hidden])?);
        let output = match weights.take_optional(OUTPUT, &[hidden, vocab_size])? {
            Some(weight) => Linear::new(weight),
            None => Linear::new(token_embedding.weight.clone()),
        };

        for name in weights.names() {
            warn!("Unused tensor: {name}");
        }

        if let Some(processor) = &text_processor {
            if processor.vocab_size() != vocab_size {
                warn!("Text processor has {} tokens, model vocabulary has {vocab_size}", processor.vocab_size());
            }
        }

        info!(
            "Loaded llama model: {num_layers} layers, hidden {hidden}, heads {}/{} (group {}), vocab {vocab_size}",
            options.num_heads,
            options.num_kv_heads,
            options.kv_group_size()
        );

        Ok(Self { token_embedding, layers, output_norm, output, options, text_processor })
    }

    /// Forward pass over a batch of new tokens of one sequence
    ///
    /// **Process Flow:**
    /// 1. **Validation**: Inputs are checked before any cache is touched
    /// 2. **Token Embedding**: Token ids to `[hidden_size, seq_len]`
    /// 3. **Decoder Layers**: Each layer reads and extends its cache slot
    /// 4. **Final Normalization** and **Output Projection** to `[vocab_size, seq_len]`
    /// 5. **Row Selection**: Columns listed in `outputs` (default: the last position)
    pub fn forward(&self, ctx: &Context, inputs: ModelInputs<'_>) -> Result<Tensor> {
        let ModelInputs { tokens, positions, outputs, cache } = inputs;
        let seq_len = tokens.len();

        if seq_len == 0 {
            anyhow::bail!("Empty input: at least one token is required");
        }

        if positions.len() != seq_len {
            anyhow::bail!("Got {seq_len} tokens but {} positions", positions.len());
        }

        if cache.num_layers() != self.layers.len() {
            anyhow::bail!("Cache holds {} layers, model has {}", cache.num_layers(), self.layers.len());
        }

        let vocab_size = self.vocab_size();
        if let Some(&id) = tokens.iter().find(|&&id| id < 0 || id as usize >= vocab_size) {
            anyhow::bail!("Token id {id} out of range [0, {vocab_size})");
        }

        if let Some(&pos) = positions.iter().find(|&&pos| pos < 0) {
            anyhow::bail!("Negative position {pos}");
        }

        let last = [seq_len as i32 - 1];
        let outputs = outputs.unwrap_or(&last[..]);
        if outputs.is_empty() {
            anyhow::bail!("At least one output position is required");
        }
        if let Some(&idx) = outputs.iter().find(|&&idx| idx < 0 || idx as usize >= seq_len) {
            anyhow::bail!("Output index {idx} out of range [0, {seq_len})");
        }

        let inputs = ctx.from_int_slice(tokens).context("Failed to create input tensor")?;
        let positions = ctx.from_int_slice(positions).context("Failed to create position tensor")?;
        let outputs = ctx.from_int_slice(outputs).context("Failed to create output tensor")?;

        let mut hidden_state = self.token_embedding.forward(&inputs)?;

        for (idx, layer) in self.layers.iter().enumerate() {
            trace!("Layer {idx}: {hidden_state:?}");
            let layer_cache = cache.sub(idx)?;
            hidden_state = layer
                .forward(&hidden_state, &positions, layer_cache, &self.options)
                .with_context(|| format!("Layer {idx} failed"))?;
        }

        let hidden_state = self.output_norm.forward(&hidden_state, self.options.eps);
        let logits = self.output.forward(&hidden_state);

        logits.rows(&outputs)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn vocab_size(&self) -> usize {
        self.token_embedding.vocab_size()
    }

    pub fn text_processor(&self) -> Option<&(dyn TextProcessor + Send + Sync)> {
        self.text_processor.as_deref()
    }
}

impl std::fmt::Debug for LlamaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct LayersSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for LayersSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("LlamaModel")
            .field("options", &self.options)
            .field("token_embedding", &self.token_embedding)
            .field("layers", &LayersSummary(&self.layers))
            .field("output_norm", &self.output_norm)
            .field("output", &self.output)
            .field("text_processor", &self.text_processor.is_some())
            .finish()
    }
}
