use super::*;

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "element {idx}: {a} != {e}");
    }
}

#[test]
fn test_new_pads_shape_to_four_dims() {
    let tensor = Tensor::new(vec![0.0; 6], &[2, 3]);

    assert_eq!(tensor.shape(), [2, 3, 1, 1]);
    assert_eq!(tensor.len(), 6);
    assert!(tensor.is_contiguous());
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 0.0, -1.0, 5.0, 100.0, 100.0, 100.0], &[3, 3]);

    let probs = tensor.softmax();

    for column in 0..3 {
        let sum: f32 = probs.column(column).iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "column {column} sums to {sum}");
    }
    assert_close(&probs.column(2), &[1.0 / 3.0; 3], 1e-6);
}

#[test]
fn test_rms_norm_has_unit_mean_square() {
    let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -0.5, 0.25, 8.0, -3.0], &[4, 2]);

    let normed = tensor.rms_norm(1e-6);

    for column in 0..2 {
        let values = normed.column(column);
        let mean_square = values.iter().map(|x| x * x).sum::<f32>() / values.len() as f32;
        assert!((mean_square - 1.0).abs() < 1e-4, "column {column}: {mean_square}");
    }
}

#[test]
fn test_permute_and_contiguous() {
    let tensor = Tensor::new((0..6).map(|x| x as f32).collect(), &[2, 3]);

    let transposed = tensor.permute([1, 0, 2, 3]);

    assert_eq!(transposed.shape(), [3, 2, 1, 1]);
    assert!(!transposed.is_contiguous());
    for i in 0..3 {
        for j in 0..2 {
            assert_eq!(transposed.get([i, j, 0, 0]), tensor.get([j, i, 0, 0]));
        }
    }
    assert_eq!(transposed.contiguous().to_vec(), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
}

#[test]
fn test_permute_moves_source_axis_to_target_position() {
    let tensor = Tensor::zeros(&[2, 3, 4]);

    assert_eq!(tensor.permute([0, 2, 1, 3]).shape(), [2, 4, 3, 1]);
    assert_eq!(tensor.permute([1, 2, 0, 3]).shape(), [4, 2, 3, 1]);
}

#[test]
fn test_reshape_keeps_data() {
    let tensor = Tensor::new((0..8).map(|x| x as f32).collect(), &[8]);

    let reshaped = tensor.reshape(&[2, 2, 2]);

    assert_eq!(reshaped.shape(), [2, 2, 2, 1]);
    assert_eq!(reshaped.get([1, 0, 1, 0]), 5.0);
}

#[test]
fn test_mulmat_contracts_first_dimension() {
    // columns of `a` are [1, 2] and [3, 4]
    let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = Tensor::new(vec![3.0, 4.0, 1.0, 0.0], &[2, 2]);

    let result = a.mulmat(&b);

    assert_eq!(result.shape(), [2, 2, 1, 1]);
    assert_eq!(result.to_vec(), vec![11.0, 25.0, 1.0, 3.0]);
}

#[test]
fn test_mulmat_broadcasts_over_third_dimension() {
    let a = Tensor::new(vec![1.0, 10.0], &[1, 1, 2]);
    let b = Tensor::full(&[1, 1, 4], 1.0);

    let result = a.mulmat(&b);

    assert_eq!(result.shape(), [1, 1, 4, 1]);
    assert_eq!(result.to_vec(), vec![1.0, 1.0, 10.0, 10.0]);
}

#[test]
fn test_add_and_mul_repeat_smaller_operand() {
    let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let bias = Tensor::new(vec![10.0, 20.0], &[2]);

    assert_eq!(tensor.add(&bias).to_vec(), vec![11.0, 22.0, 13.0, 24.0]);
    assert_eq!(tensor.mul(&bias).to_vec(), vec![10.0, 40.0, 30.0, 80.0]);
    assert_eq!(tensor.scale(0.5).to_vec(), vec![0.5, 1.0, 1.5, 2.0]);
}

#[test]
fn test_silu() {
    let tensor = Tensor::new(vec![0.0, 20.0, -20.0], &[3]);

    let activated = tensor.silu().to_vec();

    assert_eq!(activated[0], 0.0);
    assert!((activated[1] - 20.0).abs() < 1e-4);
    assert!(activated[2].abs() < 1e-6);
}

#[test]
fn test_rope_is_identity_at_position_zero() {
    let ctx = Context::new();
    let positions = ctx.from_int_slice(&[0]).unwrap();
    let tensor = Tensor::new(vec![0.1, -0.2, 0.3, 0.4, 1.5, -1.0, 2.0, 0.5], &[4, 2, 1]);

    let rotated = tensor.rope(&positions, None, 4, 10000.0, 1.0);

    assert_close(&rotated.to_vec(), &tensor.to_vec(), 1e-7);
}

#[test]
fn test_rope_rotates_adjacent_pairs_up_to_rope_dim() {
    let ctx = Context::new();
    let positions = ctx.from_int_slice(&[1]).unwrap();
    let tensor = Tensor::new(vec![1.0, 0.0, 1.0, 0.0], &[4, 1, 1]);

    let rotated = tensor.rope(&positions, None, 2, 10000.0, 1.0).to_vec();

    // first pair rotates by 1 rad, dims past rope_dim pass through
    assert_close(&rotated, &[1.0f32.cos(), 1.0f32.sin(), 1.0, 0.0], 1e-6);
}

#[test]
fn test_rope_applies_scale_and_factors() {
    let ctx = Context::new();
    let positions = ctx.from_int_slice(&[2]).unwrap();
    let tensor = Tensor::new(vec![1.0, 0.0], &[2, 1, 1]);
    let factors = Tensor::new(vec![4.0], &[1]);

    let rotated = tensor.rope(&positions, Some(&factors), 2, 10000.0, 0.5).to_vec();

    // angle = 2 * 0.5 / 4
    assert_close(&rotated, &[0.25f32.cos(), 0.25f32.sin()], 1e-6);
}

#[test]
fn test_mask_causal_hides_future_slots() {
    let scores = Tensor::zeros(&[3, 2, 1]);

    let probs = scores.mask_causal(1).softmax();

    assert_close(&probs.column(0), &[0.5, 0.5, 0.0], 1e-6);
    assert_close(&probs.column(1), &[1.0 / 3.0; 3], 1e-6);
}

#[test]
fn test_rows_selects_columns() {
    let ctx = Context::new();
    let tensor = Tensor::new((0..6).map(|x| x as f32).collect(), &[2, 3]);
    let ids = ctx.from_int_slice(&[2, 0]).unwrap();

    let selected = tensor.rows(&ids).unwrap();

    assert_eq!(selected.shape(), [2, 2, 1, 1]);
    assert_eq!(selected.to_vec(), vec![4.0, 5.0, 0.0, 1.0]);
}

#[test]
fn test_rows_rejects_out_of_range_ids() {
    let ctx = Context::new();
    let tensor = Tensor::zeros(&[2, 3]);

    for id in [3, -1] {
        let ids = ctx.from_int_slice(&[id]).unwrap();
        let err = tensor.rows(&ids).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }
}

#[test]
fn test_context_budget_limits_input_tensors() {
    let ctx = Context::new().with_max_elements(2);

    assert!(ctx.from_int_slice(&[1, 2]).is_ok());
    let err = ctx.from_int_slice(&[1, 2, 3]).unwrap_err();
    assert!(err.to_string().contains("Failed to allocate"), "{err}");
    assert!(ctx.from_float_slice(&[1.0, 2.0, 3.0], &[3]).is_err());
}

#[test]
fn test_from_float_slice_validates_shape() {
    let ctx = Context::new();

    assert_eq!(ctx.from_float_slice(&[1.0; 6], &[3, 2]).unwrap().shape(), [3, 2, 1, 1]);
    assert!(ctx.from_float_slice(&[1.0; 5], &[3, 2]).is_err());
    assert!(ctx.from_float_slice(&[1.0; 2], &[]).is_err());
}

#[test]
fn test_shared_view_ignores_trailing_buffer() {
    let buffer: Arc<[f32]> = (0..10).map(|i| i as f32).collect::<Vec<_>>().into();
    let view = Tensor::from_shared(buffer, &[2, 3]);

    assert_eq!(view.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(view.scale(2.0).to_vec(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    assert_eq!(view.add(&Tensor::full(&[1], 1.0)).column(2), vec![5.0, 6.0]);
    assert_eq!(view.permute([1, 0, 2, 3]).to_vec(), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
}
