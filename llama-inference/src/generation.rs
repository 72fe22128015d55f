use crate::cache::Cache;
use crate::models::{Model, ModelInputs};
use crate::tensor::{Context, Tensor};
use anyhow::Result;
use log::{debug, info};
use std::time::Instant;

/// Index of the largest logit in column `column`; ties resolve to the lowest index.
pub fn argmax(logits: &Tensor, column: usize) -> usize {
    logits
        .column(column)
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, &value)| if value > best.1 { (idx, value) } else { best })
        .0
}

/// `k` highest logits of column `column`, sorted descending.
pub fn top_k(logits: &Tensor, column: usize, k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = logits.column(column).into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}

/// Greedy decoding: the prompt is prefilled in one call, then one token is decoded per call.
///
/// Returns the generated tokens (without the prompt). Decoding ends after `max_new_tokens`
/// tokens or right after a token equal to `stop` is produced.
pub fn generate_greedy(
    model: &dyn Model,
    ctx: &Context,
    cache: &mut dyn Cache,
    prompt: &[i32],
    max_new_tokens: usize,
    stop: Option<i32>,
) -> Result<Vec<i32>> {
    if prompt.is_empty() {
        anyhow::bail!("Please provide a prompt");
    }

    let mut metrics = TokenMetrics::new();
    let mut generated = Vec::with_capacity(max_new_tokens);
    if max_new_tokens == 0 {
        return Ok(generated);
    }

    let positions: Vec<i32> = (0..prompt.len() as i32).collect();
    let logits = model.forward(ctx, ModelInputs::new(prompt, &positions, cache))?;
    debug!("Prefilled {} prompt tokens", prompt.len());

    let mut token = argmax(&logits, 0) as i32;
    let mut pos = prompt.len() as i32;

    metrics.start_generation();
    loop {
        generated.push(token);
        metrics.increment_token();

        if Some(token) == stop || generated.len() == max_new_tokens {
            break;
        }

        let logits = model.forward(ctx, ModelInputs::new(&[token], &[pos], cache))?;
        token = argmax(&logits, 0) as i32;
        pos += 1;
    }

    metrics.report_and_reset();
    Ok(generated)
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!(
                    "Generated {} tokens in {:.2}s - {:.2} tokens/sec",
                    self.generated_count,
                    duration.as_secs_f64(),
                    tps
                );
            }
        }
        self.generated_count = 0;
    }
}
