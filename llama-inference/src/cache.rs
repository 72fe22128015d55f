#[cfg(test)]
#[path = "../tests/unit/cache_test.rs"]
mod cache_test;

use crate::tensor::Tensor;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Key/value store consulted by the model, one slot per decoder layer.
pub trait Cache {
    /// Number of layer slots this cache holds.
    fn num_layers(&self) -> usize;

    /// Returns the cache handle of a single layer.
    fn sub(&mut self, layer: usize) -> Result<&mut dyn LayerCache>;
}

/// Per-layer cache handle.
pub trait LayerCache {
    /// Number of positions stored before the next `put`.
    fn cached_len(&self) -> usize;

    /// Appends `key`/`value` of shape `[head_dim, n_kv_heads, seq_len]` and returns the full
    /// history (previous + current), each `[head_dim, n_kv_heads, cached_len]`.
    fn put(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// In-memory key/value cache for a single generation sequence.
///
/// **Layout**: per layer, keys and values are `[head_dim, n_kv_heads, len]` buffers that grow
/// along the last axis on demand. The history returned by `put` is a view over the same
/// buffer, so a decode step copies only its own entries.
#[derive(Debug)]
pub struct KvCache {
    layers: Vec<LayerKv>,
    capacity: usize,
}

impl KvCache {
    /// Creates an empty cache for `num_layers` layers holding at most `capacity` positions.
    pub fn new(num_layers: usize, capacity: usize) -> Self {
        Self { layers: (0..num_layers).map(|_| LayerKv::new(capacity)).collect(), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of positions stored (identical across layers after a completed forward pass).
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all cached positions, keeping the allocations.
    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(LayerKv::clear);
    }
}

impl Cache for KvCache {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn sub(&mut self, layer: usize) -> Result<&mut dyn LayerCache> {
        let num_layers = self.layers.len();
        match self.layers.get_mut(layer) {
            Some(slot) => Ok(slot as &mut dyn LayerCache),
            None => anyhow::bail!("Cache has no layer {layer}: it holds {num_layers} layers"),
        }
    }
}

#[derive(Debug)]
struct LayerKv {
    /// Shared with the history tensors handed out by `put`, written in place once those drop
    keys: Arc<[f32]>,
    values: Arc<[f32]>,
    /// `[head_dim, n_kv_heads]` of the stored entries, fixed by the first `put`
    head_shape: Option<(usize, usize)>,
    len: usize,
    capacity: usize,
}

impl LayerKv {
    fn new(capacity: usize) -> Self {
        Self { keys: Arc::from([]), values: Arc::from([]), head_shape: None, len: 0, capacity }
    }

    fn clear(&mut self) {
        self.head_shape = None;
        self.len = 0;
    }
}

impl LayerCache for LayerKv {
    fn cached_len(&self) -> usize {
        self.len
    }

    fn put(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let [head_dim, n_kv_heads, seq_len, batch] = key.shape();

        if value.shape() != key.shape() || batch != 1 {
            anyhow::bail!("Key {:?} and value {:?} must share a 3D shape", key.shape(), value.shape());
        }

        match self.head_shape {
            Some(expected) if expected != (head_dim, n_kv_heads) => anyhow::bail!(
                "Cache entry shape mismatch: expected {expected:?}, got {:?}",
                (head_dim, n_kv_heads)
            ),
            _ => {}
        }

        let total = self.len + seq_len;
        if total > self.capacity {
            anyhow::bail!(
                "KV cache overflow: {} cached + {seq_len} new positions exceed capacity {}",
                self.len,
                self.capacity
            );
        }

        let entry_size = head_dim * n_kv_heads;
        let offset = entry_size * self.len;
        let limit = entry_size.checked_mul(self.capacity).unwrap_or(usize::MAX);

        append(&mut self.keys, offset, &key.to_vec(), limit)?;
        append(&mut self.values, offset, &value.to_vec(), limit)?;
        self.head_shape = Some((head_dim, n_kv_heads));
        self.len = total;

        let shape = [head_dim, n_kv_heads, total];
        Ok((Tensor::from_shared(self.keys.clone(), &shape), Tensor::from_shared(self.values.clone(), &shape)))
    }
}

/// Writes `entry` after the first `offset` elements of `buffer`.
///
/// The buffer grows by doubling, never past `limit` elements. It is copied only when it is
/// too small or a history tensor from an earlier `put` still holds it.
fn append(buffer: &mut Arc<[f32]>, offset: usize, entry: &[f32], limit: usize) -> Result<()> {
    let required = offset.checked_add(entry.len()).context("KV cache size overflows usize")?;

    let reusable = buffer.len() >= required && Arc::get_mut(buffer).is_some();
    if !reusable {
        let size = if buffer.len() >= required {
            buffer.len()
        } else {
            required.max(buffer.len().saturating_mul(2).min(limit))
        };
        let mut grown = vec![0.0; size];
        grown[..offset].copy_from_slice(&buffer[..offset]);
        *buffer = grown.into();
    }

    let data = Arc::get_mut(buffer).context("KV cache buffer is still shared")?;
    data[offset..required].copy_from_slice(entry);

    Ok(())
}
