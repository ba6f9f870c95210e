use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::{DynamicImage, Rgb, RgbImage};
use qwen_vl_core::{SessionState, VlmError};
use qwen_vl_infer_qwen2_vl::{GenerateOptions, ModelConfig, ModelFamily, QwenVlModel};
use serde_json::{Value, json};

const IMAGE: i64 = 20;
const VISION_START: i64 = 22;
const VISION_END: i64 = 23;

fn tiny_config() -> Value {
    json!({
        "model_type": "qwen2_5_vl",
        "hidden_size": 16,
        "intermediate_size": 24,
        "num_hidden_layers": 2,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "vocab_size": 32,
        "rope_theta": 10000.0,
        "rope_scaling": { "type": "mrope", "mrope_section": [2, 1, 1] },
        "tie_word_embeddings": false,
        "image_token_id": IMAGE,
        "video_token_id": 21,
        "vision_start_token_id": VISION_START,
        "vision_end_token_id": VISION_END,
        "vision_token_id": 24,
        "some_unknown_field": { "ignored": true },
        "vision_config": {
            "depth": 2,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_heads": 2,
            "out_hidden_size": 16,
            "patch_size": 2,
            "spatial_merge_size": 2,
            "temporal_patch_size": 2,
            "window_size": 8,
            "fullatt_block_indexes": [1],
            "tokens_per_second": 2
        }
    })
}

/// Materialise random weights for `config`, then save them as two shards using the legacy
/// `visual.` / `model.` / `lm_head.` key layout.
fn write_snapshot(dir: &Path, config: &Value) -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    QwenVlModel::new(ModelConfig::from_json(config)?, &vb)?;

    let mut visual = HashMap::new();
    let mut text = HashMap::new();
    for (name, var) in varmap.data().lock().unwrap().iter() {
        let dims = var.as_tensor().dims().to_vec();
        let value = if name.contains("norm") || name.contains("ln_q") {
            Tensor::ones(dims, DType::F32, &device)?
        } else {
            Tensor::randn(0f32, 0.2, dims, &device)?
        };
        if let Some(rest) = name.strip_prefix("vision_tower.") {
            visual.insert(format!("visual.{rest}"), value);
        } else if let Some(rest) = name.strip_prefix("language_model.model.") {
            text.insert(format!("model.{rest}"), value);
        } else if let Some(rest) = name.strip_prefix("language_model.") {
            text.insert(rest.to_string(), value);
        }
    }
    candle_core::safetensors::save(&visual, dir.join("model-00001-of-00002.safetensors"))?;
    candle_core::safetensors::save(&text, dir.join("model-00002-of-00002.safetensors"))?;
    fs::write(dir.join("config.json"), serde_json::to_vec_pretty(config)?)?;
    fs::write(
        dir.join("preprocessor_config.json"),
        r#"{ "min_pixels": 16, "max_pixels": 64 }"#,
    )?;
    Ok(())
}

fn load(dir: &Path) -> Result<QwenVlModel> {
    let path = dir.to_str().expect("utf-8 temp path");
    QwenVlModel::load_pretrained(path, &Device::Cpu, DType::F32)
}

fn test_image() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(8, 8, |x, y| {
        Rgb([(x * 30) as u8, (y * 30) as u8, 128])
    }))
}

#[test]
fn loads_legacy_sharded_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_snapshot(dir.path(), &tiny_config())?;
    let model = load(dir.path())?;
    assert_eq!(model.config().family, ModelFamily::Qwen25Vl);
    assert_eq!(model.image_processor().max_pixels, 64);
    assert_eq!(model.model_dir(), Some(dir.path()));
    Ok(())
}

#[test]
fn sequential_steps_grow_cache_by_new_tokens() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_snapshot(dir.path(), &tiny_config())?;
    let model = load(dir.path())?;

    // 8x8 pixels -> 4x4 patches -> 2x2 merged placeholders.
    let visual = model.prepare_images(&[test_image()])?;
    assert_eq!(visual.pixel_values.dims(), &[16, 3 * 2 * 2 * 2]);
    let prompt = [1, 2, VISION_START, IMAGE, IMAGE, IMAGE, IMAGE, VISION_END, 3];

    let mut session = model.new_session();
    assert_eq!(session.state(), SessionState::NoCache);
    let logits = model.step(&prompt, Some(&visual), Some(&mut session))?;
    assert_eq!(logits.dims(), &[1, 9, 32]);
    assert_eq!(session.cached_len(), 9);
    assert_eq!(session.state(), SessionState::Primed);
    // Positions end at 6 (grid spans 2 rows/cols), so the next step starts at 7.
    assert_eq!(session.rope_delta(), -2);

    let logits = model.step(&[5, 6], None, Some(&mut session))?;
    assert_eq!(logits.dims(), &[1, 2, 32]);
    assert_eq!(session.cached_len(), 11);
    Ok(())
}

#[test]
fn generation_stops_at_token_budget() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_snapshot(dir.path(), &tiny_config())?;
    let model = load(dir.path())?;
    let visual = model.prepare_images(&[test_image()])?;
    let prompt = [1, VISION_START, IMAGE, IMAGE, IMAGE, IMAGE, VISION_END];

    let options = GenerateOptions {
        max_new_tokens: 3,
        ..GenerateOptions::default()
    };
    let mut streamed = Vec::new();
    let output = model.generate(&prompt, Some(&visual), &options, |token| {
        streamed.push(token);
        Ok(())
    })?;
    assert_eq!(output.prompt_tokens, prompt.len());
    assert_eq!(output.tokens.len(), 3);
    assert!(!output.stopped_on_eos);
    assert_eq!(streamed, output.tokens);
    Ok(())
}

#[test]
fn config_without_weights_is_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("config.json"),
        serde_json::to_vec(&tiny_config())?,
    )?;
    let err = match load(dir.path()) {
        Ok(_) => panic!("no safetensors archives were written"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<VlmError>(),
        Some(VlmError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn pixels_without_placeholders_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_snapshot(dir.path(), &tiny_config())?;
    let model = load(dir.path())?;
    let visual = model.prepare_images(&[test_image()])?;
    let mut session = model.new_session();
    let err = model
        .step(&[1, 2, 3], Some(&visual), Some(&mut session))
        .expect_err("no placeholders for four features");
    assert!(err.to_string().contains("expected 0 visual features"));
    assert!(
        err.downcast_ref::<VlmError>()
            .is_some_and(VlmError::is_shape_mismatch)
    );
    assert_eq!(session.cached_len(), 0);
    Ok(())
}
