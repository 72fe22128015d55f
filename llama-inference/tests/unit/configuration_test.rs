use super::*;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

const LLAMA_PARAMETERS: &str = r#"{
    "general.architecture": "llama",
    "llama.embedding_length": 4096,
    "llama.attention.head_count": 32,
    "llama.attention.head_count_kv": 8,
    "llama.attention.layer_norm_rms_epsilon": 1e-5,
    "llama.rope.freq_base": 500000.0,
    "llama.rope.dimension_count": 128,
    "llama.block_count": 32,
    "tokenizer.ggml.tokens": ["<unk>", "<s>", "</s>"]
}"#;

fn options(hidden_size: usize, num_heads: usize, num_kv_heads: usize, rope_dim: usize) -> Options {
    Options {
        hidden_size,
        num_heads,
        num_kv_heads,
        eps: 1e-5,
        rope_base: 10000.0,
        rope_scale: 1.0,
        rope_dim,
        rope_factors: None,
    }
}

#[test]
fn test_options_from_parameters() -> Result<()> {
    let params = Parameters::from_json_str(LLAMA_PARAMETERS)?;

    let options = Options::from_parameters(&params)?;

    assert_eq!(options.hidden_size, 4096);
    assert_eq!(options.num_heads, 32);
    assert_eq!(options.num_kv_heads, 8);
    assert!((options.eps - 1e-5).abs() < 1e-12);
    assert_eq!(options.rope_base, 500000.0);
    assert_eq!(options.rope_scale, 1.0);
    assert_eq!(options.rope_dim, 128);
    assert_eq!(options.head_dim(), 128);
    assert_eq!(options.kv_dim(), 1024);
    assert_eq!(options.kv_group_size(), 4);
    options.validate()?;

    Ok(())
}

#[test]
fn test_options_defaults() -> Result<()> {
    let params = Parameters::default()
        .with("embedding_length", 64)
        .with("attention.head_count", 4)
        .with("attention.layer_norm_rms_epsilon", 1e-6)
        .with("rope.freq_base", 10000.0);

    let options = Options::from_parameters(&params)?;

    assert_eq!(options.num_kv_heads, 4);
    assert_eq!(options.rope_scale, 1.0);
    assert_eq!(options.rope_dim, 16);
    assert!(options.rope_factors.is_none());

    Ok(())
}

#[test]
fn test_missing_parameter_names_resolved_key() {
    let params = Parameters::default().with("attention.head_count", 4);

    let err = Options::from_parameters(&params).unwrap_err();

    assert_eq!(err.to_string(), "Missing parameter: llama.embedding_length");
}

#[test]
fn test_keys_resolve_against_architecture() -> Result<()> {
    let params = Parameters::from_json_str(
        r#"{
            "general.architecture": "mistral",
            "mistral.block_count": 2,
            "llama.block_count": 7,
            "tokenizer.ggml.bos_token_id": 1
        }"#,
    )?;

    assert_eq!(params.architecture(), "mistral");
    assert_eq!(params.uint("block_count")?, 2);
    assert_eq!(params.uint("tokenizer.ggml.bos_token_id")?, 1);
    assert_eq!(params.string("general.architecture")?, "mistral");
    assert!(!params.contains("embedding_length"));
    assert_eq!(params.uint_or("embedding_length", 9)?, 9);

    Ok(())
}

#[test]
fn test_typed_accessors_reject_wrong_types() -> Result<()> {
    let params = Parameters::default()
        .with("block_count", "two")
        .with("rope.freq_base", -1)
        .with("tokenizer.ggml.tokens", vec!["a", "b"]);

    assert!(params.uint("block_count").is_err());
    assert!(params.uint("rope.freq_base").is_err());
    assert_eq!(params.float("rope.freq_base")?, -1.0);
    assert_eq!(params.strings("tokenizer.ggml.tokens")?, vec!["a".to_string(), "b".to_string()]);
    assert!(params.floats("tokenizer.ggml.tokens").is_err());
    assert!(Parameters::from_json_str("[1, 2]").is_err());

    Ok(())
}

#[test]
fn test_parameters_from_json_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("params.json");
    fs::write(&path, LLAMA_PARAMETERS)?;

    let params = Parameters::from_json_file(&path)?;

    assert_eq!(params.uint("block_count")?, 32);
    assert_eq!(params.strings("tokenizer.ggml.tokens")?.len(), 3);

    let missing = Parameters::from_json_file(temp_dir.path().join("missing.json")).unwrap_err();
    assert!(missing.to_string().starts_with("Failed to read parameters"), "{missing}");

    Ok(())
}

#[test]
fn test_validate_rejects_indivisible_hidden_size() {
    let err = options(10, 4, 4, 2).validate().unwrap_err();

    assert!(err.to_string().contains("must be divisible by num_heads"), "{err}");
}

#[test]
fn test_validate_rejects_invalid_layouts() {
    assert!(options(64, 8, 3, 8).validate().is_err());
    assert!(options(64, 0, 1, 8).validate().is_err());
    assert!(options(64, 8, 2, 7).validate().is_err());
    assert!(options(64, 8, 2, 10).validate().is_err());
    assert!(options(64, 8, 2, 8).validate().is_ok());
}

#[test]
fn test_validate_checks_rope_factor_count() {
    let mut options = options(64, 8, 2, 8);

    options.rope_factors = Some(Tensor::full(&[3], 1.0));
    assert!(options.validate().is_err());

    options.rope_factors = Some(Tensor::full(&[4], 1.0));
    assert!(options.validate().is_ok());
}
