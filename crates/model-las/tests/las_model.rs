//! Сквозные сценарии LasModel на CPU с маленькой конфигурацией.

use asr_core::{AsrError, FeatureBatch, TargetBatch};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model_las::{vocab, LasConfig, LasModel, StopReason};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn random_model(config: LasConfig) -> (LasModel, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = LasModel::new(config, vb).unwrap();
    (model, varmap)
}

/// Модель с нулевыми весами, у которой логиты всегда равны `bias`.
fn constant_model(favourite: u32) -> (LasModel, VarMap) {
    let (model, mut varmap) = random_model(LasConfig::tiny());
    for var in varmap.all_vars() {
        var.set(&var.zeros_like().unwrap()).unwrap();
    }
    let mut bias = vec![0f32; vocab::VOCAB_SIZE];
    bias[favourite as usize] = 10.0;
    let bias = Tensor::new(bias, &Device::Cpu).unwrap();
    varmap.set_one("speller.char_dist.out.bias", &bias).unwrap();
    (model, varmap)
}

fn zero_features(frames: usize) -> FeatureBatch {
    let features = Tensor::zeros((1, frames, 40), DType::F32, &Device::Cpu).unwrap();
    FeatureBatch::unmasked(features).unwrap()
}

fn random_features(batch: usize, frames: usize) -> Tensor {
    Tensor::randn(0f32, 1f32, (batch, frames, 40), &Device::Cpu).unwrap()
}

fn target_batch(texts: &[&str]) -> TargetBatch {
    let device = Device::Cpu;
    let encoded: Vec<Vec<u32>> = texts.iter().map(|t| vocab::encode(t, 300).unwrap()).collect();
    let len = encoded.iter().map(Vec::len).max().unwrap();

    let mut rows = Vec::new();
    for ids in &encoded {
        let one_hot = vocab::one_hot(ids, vocab::VOCAB_SIZE, &device).unwrap();
        let pad = Tensor::zeros((len - ids.len(), vocab::VOCAB_SIZE), DType::F32, &device).unwrap();
        rows.push(Tensor::cat(&[&one_hot, &pad], 0).unwrap());
    }
    TargetBatch::from_padded(Tensor::stack(&rows, 0).unwrap()).unwrap()
}

#[test]
fn test_listener_on_160_zero_frames() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let memory = model.listen(&zero_features(160)).unwrap();

    assert_eq!(memory.features.dims(), &[1, 20, model.config().listener_dim()]);
    assert_eq!(memory.keys.dims(), &[1, 20, model.config().attention_dim]);
    let mask: Vec<Vec<u8>> = memory.mask.to_vec2().unwrap();
    assert!(mask[0].iter().all(|&m| m == 1));
}

#[test]
fn test_listener_ignores_padded_frame_content() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let device = Device::Cpu;
    let valid = 20;

    let mut mask = vec![0u8; 32];
    mask[..valid].fill(1);
    let mask = Tensor::from_vec(mask, (1, 32), &device).unwrap();

    let clean = random_features(1, valid);
    let tail_zeros = Tensor::zeros((1, 32 - valid, 40), DType::F32, &device).unwrap();
    let tail_noise = random_features(1, 32 - valid);

    let a = FeatureBatch::new(Tensor::cat(&[&clean, &tail_zeros], 1).unwrap(), mask.clone()).unwrap();
    let b = FeatureBatch::new(Tensor::cat(&[&clean, &tail_noise], 1).unwrap(), mask).unwrap();

    let fa: Vec<f32> = model.listen(&a).unwrap().features.flatten_all().unwrap().to_vec1().unwrap();
    let fb: Vec<f32> = model.listen(&b).unwrap().features.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(fa, fb);
}

#[test]
fn test_listener_rejects_unaligned_frames() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let features = zero_features(30);
    assert!(matches!(model.listen(&features), Err(AsrError::Shape(_))));

    let trimmed = features.trim_to_multiple(model.config().downsample_factor()).unwrap();
    assert_eq!(trimmed.num_frames(), 24);
    assert!(model.listen(&trimmed).is_ok());
}

#[test]
fn test_teacher_forced_cat_gives_four_steps() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let (inputs, _targets) = target_batch(&["cat"]).teacher_forcing_split().unwrap();

    let logits = model.forward(&zero_features(160), &inputs).unwrap();
    assert_eq!(logits.dims(), &[1, 4, vocab::VOCAB_SIZE]);
}

#[test]
fn test_teacher_forced_is_deterministic() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let features = FeatureBatch::unmasked(random_features(2, 64)).unwrap();
    let (inputs, _) = target_batch(&["cat", "hello"]).teacher_forcing_split().unwrap();

    let a: Vec<f32> = model.forward(&features, &inputs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = model.forward(&features, &inputs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_blend_is_reproducible_and_zero_fraction_matches_plain() {
    let features = FeatureBatch::unmasked(random_features(2, 32)).unwrap();
    let (inputs, _) = target_batch(&["abc", "xyz"]).teacher_forcing_split().unwrap();

    let config = LasConfig {
        prev_prediction_fraction: 1.0,
        ..LasConfig::tiny()
    };
    let (model, _vm) = random_model(config);
    let run = |seed: u64| -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        model
            .forward_blended(&features, &inputs, &mut rng)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    };
    assert_eq!(run(11), run(11));

    let config = LasConfig {
        prev_prediction_fraction: 0.0,
        ..LasConfig::tiny()
    };
    let (model, _vm) = random_model(config);
    let mut rng = StdRng::seed_from_u64(11);
    let blended: Vec<f32> = model
        .forward_blended(&features, &inputs, &mut rng)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    let plain: Vec<f32> = model.forward(&features, &inputs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(blended, plain);
}

#[test]
fn test_score_ignores_masked_target_content() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let features = FeatureBatch::unmasked(random_features(2, 32)).unwrap();
    let clean = target_batch(&["cat", "hi"]);

    // Портим паддинг второго примера, маску оставляем прежней
    let noise = Tensor::ones((1, 1, vocab::VOCAB_SIZE), DType::F32, &Device::Cpu).unwrap();
    let row0 = clean.one_hot.i(0..1).unwrap();
    let row1 = clean.one_hot.i((1..2, 0..4)).unwrap();
    let row1 = Tensor::cat(&[&row1, &noise], 1).unwrap();
    let noisy = TargetBatch::new(Tensor::cat(&[&row0, &row1], 0).unwrap(), clean.mask.clone()).unwrap();

    let a = model.score(&features, &clean).unwrap();
    let b = model.score(&features, &noisy).unwrap();
    assert_eq!(a.loss_value().unwrap(), b.loss_value().unwrap());
    assert_eq!(a.accuracy_value().unwrap(), b.accuracy_value().unwrap());

    let loss = a.loss_value().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
}

#[test]
fn test_attention_map_shape() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let (inputs, _) = target_batch(&["cat"]).teacher_forcing_split().unwrap();
    let (logits, attention) = model.attention_map(&zero_features(160), &inputs).unwrap();

    assert_eq!(logits.dims(), &[1, 4, vocab::VOCAB_SIZE]);
    assert_eq!(attention.dims(), &[1, 4, 20]);
    let sums: Vec<Vec<f32>> = attention.sum(2).unwrap().to_vec2().unwrap();
    assert!(sums[0].iter().all(|s| (s - 1.0).abs() < 1e-5));
}

#[test]
fn test_decode_stops_at_cap_without_end_token() {
    let (model, _vm) = constant_model('a' as u32);
    let out = model.decode_with_limit(&zero_features(160), 5).unwrap();

    assert_eq!(out.tokens.len(), 5);
    assert_eq!(out.stop_reason, StopReason::MaxSteps);
    assert_eq!(out.text(), "aaaaa");
}

#[test]
fn test_decode_stops_early_on_end_token() {
    let (model, _vm) = constant_model(vocab::EOS_ID);
    let out = model.decode_with_limit(&zero_features(160), 5).unwrap();

    assert_eq!(out.tokens, vec![vocab::EOS_ID]);
    assert_eq!(out.stop_reason, StopReason::EndToken);
    assert_eq!(out.text(), "");
}

#[test]
fn test_decode_uses_configured_cap() {
    let (model, _vm) = constant_model('b' as u32);
    let out = model.decode(&zero_features(160)).unwrap();
    assert_eq!(out.tokens.len(), model.config().max_decode_steps);
    assert_eq!(model.transcribe(&zero_features(160)).unwrap().len(), model.config().max_decode_steps);
}

#[test]
fn test_decode_rejects_batch() {
    let (model, _vm) = random_model(LasConfig::tiny());
    let features = FeatureBatch::unmasked(random_features(2, 32)).unwrap();
    assert!(matches!(model.decode(&features), Err(AsrError::Shape(_))));
}

#[test]
fn test_load_from_directory() {
    let (model, varmap) = random_model(LasConfig::tiny());
    let dir = tempfile::tempdir().unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(model.config()).unwrap(),
    )
    .unwrap();

    let loaded = LasModel::load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(loaded.config(), model.config());

    let features = FeatureBatch::unmasked(random_features(1, 32)).unwrap();
    let (inputs, _) = target_batch(&["ok"]).teacher_forcing_split().unwrap();
    let a: Vec<f32> = model.forward(&features, &inputs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = loaded.forward(&features, &inputs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);
}
