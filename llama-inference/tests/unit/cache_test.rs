use super::*;
use anyhow::Result;

/// `[head_dim = 2, n_kv_heads = 1, seq_len]` entry filled with `start, start + 1, ...`
fn entry(start: f32, seq_len: usize) -> Tensor {
    Tensor::new((0..2 * seq_len).map(|i| start + i as f32).collect(), &[2, 1, seq_len])
}

#[test]
fn test_put_returns_full_history() -> Result<()> {
    let mut cache = KvCache::new(2, 8);
    let layer = cache.sub(1)?;

    assert_eq!(layer.cached_len(), 0);
    let (keys, values) = layer.put(&entry(0.0, 2), &entry(100.0, 2))?;
    assert_eq!(keys.shape(), [2, 1, 2, 1]);
    assert_eq!(values.to_vec(), vec![100.0, 101.0, 102.0, 103.0]);

    let (keys, values) = layer.put(&entry(4.0, 1), &entry(104.0, 1))?;
    assert_eq!(layer.cached_len(), 3);
    assert_eq!(keys.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(values.shape(), [2, 1, 3, 1]);

    // layers are independent
    assert_eq!(cache.sub(0)?.cached_len(), 0);

    Ok(())
}

#[test]
fn test_overflow_leaves_cache_untouched() -> Result<()> {
    let mut cache = KvCache::new(1, 3);
    let layer = cache.sub(0)?;
    layer.put(&entry(0.0, 2), &entry(0.0, 2))?;

    let err = layer.put(&entry(0.0, 2), &entry(0.0, 2)).unwrap_err();

    assert!(err.to_string().contains("KV cache overflow"), "{err}");
    assert_eq!(layer.cached_len(), 2);
    let (keys, _) = layer.put(&entry(10.0, 1), &entry(10.0, 1))?;
    assert_eq!(keys.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0]);

    Ok(())
}

#[test]
fn test_put_rejects_mismatched_shapes() -> Result<()> {
    let mut cache = KvCache::new(1, 8);
    let layer = cache.sub(0)?;

    assert!(layer.put(&entry(0.0, 2), &entry(0.0, 1)).is_err());

    layer.put(&entry(0.0, 1), &entry(0.0, 1))?;
    let wider = Tensor::zeros(&[2, 2, 1]);
    let err = layer.put(&wider, &wider).unwrap_err();
    assert!(err.to_string().contains("shape mismatch"), "{err}");

    Ok(())
}

#[test]
fn test_sub_rejects_unknown_layer() {
    let mut cache = KvCache::new(2, 4);

    assert_eq!(cache.num_layers(), 2);
    let err = cache.sub(2).err().unwrap();
    assert!(err.to_string().contains("no layer 2"), "{err}");
}

#[test]
fn test_reset_clears_all_layers() -> Result<()> {
    let mut cache = KvCache::new(2, 4);
    for layer in 0..2 {
        cache.sub(layer)?.put(&entry(0.0, 2), &entry(0.0, 2))?;
    }
    assert_eq!(cache.len(), 2);

    cache.reset();

    assert!(cache.is_empty());
    assert_eq!(cache.capacity(), 4);
    assert_eq!(cache.sub(1)?.cached_len(), 0);

    Ok(())
}

#[test]
fn test_large_capacity_allocates_on_demand() -> Result<()> {
    let mut cache = KvCache::new(1, usize::MAX / 8);
    let entry = Tensor::full(&[4, 2, 1], 1.5);

    let (keys, values) = cache.sub(0)?.put(&entry, &entry)?;

    assert_eq!(keys.shape(), [4, 2, 1, 1]);
    assert_eq!(values.to_vec(), vec![1.5; 8]);
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[test]
fn test_history_is_not_changed_by_later_puts() -> Result<()> {
    let mut cache = KvCache::new(1, 8);
    let layer = cache.sub(0)?;

    let (first, _) = layer.put(&entry(0.0, 1), &entry(0.0, 1))?;
    let (second, _) = layer.put(&entry(2.0, 2), &entry(2.0, 2))?;
    drop(second);
    let (third, _) = layer.put(&entry(6.0, 1), &entry(6.0, 1))?;

    assert_eq!(first.to_vec(), vec![0.0, 1.0]);
    assert_eq!(third.to_vec(), (0..8).map(|i| i as f32).collect::<Vec<_>>());
    assert_eq!(third.permute([0, 2, 1, 3]).column(3), vec![6.0, 7.0]);

    Ok(())
}

#[test]
fn test_reset_reuses_buffers_for_new_shape() -> Result<()> {
    let mut cache = KvCache::new(1, 4);
    cache.sub(0)?.put(&entry(0.0, 3), &entry(0.0, 3))?;

    cache.reset();
    let wider = Tensor::full(&[2, 2, 1], 9.0);
    let (keys, _) = cache.sub(0)?.put(&wider, &wider)?;

    assert_eq!(keys.shape(), [2, 2, 1, 1]);
    assert_eq!(keys.to_vec(), vec![9.0; 4]);

    Ok(())
}
