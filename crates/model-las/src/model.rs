//! LasModel — listener, проектор ключей и speller вместе.
//!
//! Операции уровня модели:
//! - [`LasModel::listen`] — признаки → память внимания
//! - [`LasModel::forward`] / [`LasModel::forward_blended`] — teacher forcing
//! - [`LasModel::score`] / [`LasModel::score_blended`] — маскированные loss и accuracy
//! - [`LasModel::attention_map`] — веса внимания для визуализации
//! - [`LasModel::decode`] / [`LasModel::transcribe`] — greedy-декодирование

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::RngCore;
use tracing::{debug, info, warn};

use asr_core::{AsrError, AsrResult, FeatureBatch, ModelFiles, StepControl, TargetBatch};

use crate::attention::{AttentionMemory, KeyProjector};
use crate::config::LasConfig;
use crate::decode::{self, GreedyOutput};
use crate::listener::Listener;
use crate::scoring;
use crate::speller::Speller;
use crate::vocab;

/// Loss и accuracy одного батча (скаляры; loss дифференцируем через `VarMap`).
#[derive(Debug, Clone)]
pub struct Scores {
    pub loss: Tensor,
    pub accuracy: Tensor,
}

impl Scores {
    pub fn loss_value(&self) -> AsrResult<f32> {
        Ok(self.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    pub fn accuracy_value(&self) -> AsrResult<f32> {
        Ok(self.accuracy.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }
}

/// Listen, Attend and Spell.
pub struct LasModel {
    listener: Listener,
    key_projector: KeyProjector,
    speller: Speller,
    config: LasConfig,
    device: Device,
}

impl LasModel {
    /// Собрать модель из `VarBuilder`.
    ///
    /// С `VarMap` веса создаются и инициализируются, с safetensors — читаются.
    /// Ключи: `listener.*`, `key_projector.*`, `speller.*`.
    pub fn new(config: LasConfig, vb: VarBuilder) -> AsrResult<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let listener = Listener::load(&config, vb.pp("listener"))?;
        let key_projector =
            KeyProjector::load(config.listener_dim(), config.attention_dim, vb.pp("key_projector"))?;
        let speller = Speller::load(&config, vb.pp("speller"))?;
        debug!(
            "LAS: depth={}, listener_hidden={}, decoder_hidden={}, attention={}",
            config.pyramid_depth, config.listener_hidden, config.decoder_hidden, config.attention_dim
        );

        Ok(Self {
            listener,
            key_projector,
            speller,
            config,
            device,
        })
    }

    /// Загрузить модель из директории.
    ///
    /// Ожидаемые файлы:
    /// - `config.json` — конфигурация (без него берётся [`LasConfig::librispeech`])
    /// - `model.safetensors` или `model.safetensors.index.json` + шарды
    pub fn load(model_dir: impl AsRef<Path>, device: &Device) -> AsrResult<Self> {
        let model_dir = model_dir.as_ref();
        info!("LAS: загрузка модели из {:?}", model_dir);

        let files = ModelFiles::discover(model_dir)?;
        let config = match &files.config {
            Some(path) => LasConfig::from_json_file(path)?,
            None => {
                warn!("LAS: config.json не найден, использую конфигурацию по умолчанию");
                LasConfig::librispeech()
            }
        };
        info!(
            "LAS: {} (depth={}, vocab={})",
            config.model_name, config.pyramid_depth, config.vocab_size
        );

        let start = Instant::now();
        // SAFETY: файлы весов не изменяются, пока модель загружена.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, DType::F32, device)? };
        let model = Self::new(config, vb)?;

        info!("LAS: модель загружена за {:.2}с", start.elapsed().as_secs_f64());
        Ok(model)
    }

    pub fn config(&self) -> &LasConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn check_features(&self, features: &FeatureBatch) -> AsrResult<()> {
        if features.num_mels() != self.config.n_mels {
            return Err(AsrError::Shape(format!(
                "ожидается {} mel-каналов, получено {}",
                self.config.n_mels,
                features.num_mels()
            )));
        }
        let factor = self.config.downsample_factor();
        let frames = features.num_frames();
        if frames == 0 || frames % factor != 0 {
            return Err(AsrError::Shape(format!(
                "число фреймов {frames} должно быть положительным и кратным {factor} \
                 (используйте FeatureBatch::trim_to_multiple)"
            )));
        }
        Ok(())
    }

    fn check_targets(&self, features: &FeatureBatch, targets: &TargetBatch) -> AsrResult<()> {
        if targets.batch_size() != features.batch_size() {
            return Err(AsrError::Shape(format!(
                "batch признаков {} не совпадает с batch символов {}",
                features.batch_size(),
                targets.batch_size()
            )));
        }
        let vocab = targets.one_hot.dims()[2];
        if vocab != self.config.vocab_size {
            return Err(AsrError::Shape(format!(
                "ширина one-hot {vocab} не совпадает со словарём {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// Прогнать listener и посчитать ключи внимания.
    pub fn listen(&self, features: &FeatureBatch) -> AsrResult<AttentionMemory> {
        self.check_features(features)?;
        let x = features.features.to_device(&self.device)?.to_dtype(DType::F32)?;
        let mask = features.mask.to_device(&self.device)?;

        let out = self.listener.forward(&x, &mask)?;
        let keys = self.key_projector.forward(&out.features)?;
        Ok(AttentionMemory {
            features: out.features,
            keys,
            mask: out.mask,
        })
    }

    fn teacher_forced(
        &self,
        features: &FeatureBatch,
        inputs: &TargetBatch,
        control: &mut StepControl<'_>,
    ) -> AsrResult<decode::TeacherForcedOutput> {
        self.check_targets(features, inputs)?;
        if inputs.is_empty() {
            return Err(AsrError::Shape("пустая последовательность входных символов".into()));
        }
        let memory = self.listen(features)?;
        let one_hot = inputs.one_hot.to_device(&self.device)?.to_dtype(DType::F32)?;
        Ok(decode::teacher_forced(&self.speller, &memory, &one_hot, control)?)
    }

    /// Логиты `[batch, chars, vocab]` при teacher forcing, без смешивания входов.
    ///
    /// `inputs` — уже сдвинутые входы (без `$`). Детерминировано.
    pub fn forward(&self, features: &FeatureBatch, inputs: &TargetBatch) -> AsrResult<Tensor> {
        let mut control = StepControl::plain();
        Ok(self.teacher_forced(features, inputs, &mut control)?.logits)
    }

    /// Как [`LasModel::forward`], но со scheduled sampling через `rng`.
    pub fn forward_blended(
        &self,
        features: &FeatureBatch,
        inputs: &TargetBatch,
        rng: &mut dyn RngCore,
    ) -> AsrResult<Tensor> {
        let mut control = StepControl::blended(rng);
        Ok(self.teacher_forced(features, inputs, &mut control)?.logits)
    }

    fn score_with(
        &self,
        features: &FeatureBatch,
        ground_truth: &TargetBatch,
        control: &mut StepControl<'_>,
    ) -> AsrResult<Scores> {
        let (inputs, targets) = ground_truth.teacher_forcing_split()?;
        let logits = self.teacher_forced(features, &inputs, control)?.logits;

        let one_hot = targets.one_hot.to_device(&self.device)?;
        let mask = targets.mask.to_device(&self.device)?;
        let loss = scoring::masked_cross_entropy(&logits, &one_hot, &mask)
            .map_err(|e| AsrError::Inference(format!("loss: {e}")))?;
        let accuracy = scoring::masked_accuracy(&logits, &one_hot, &mask)
            .map_err(|e| AsrError::Inference(format!("accuracy: {e}")))?;
        Ok(Scores { loss, accuracy })
    }

    /// Loss и accuracy по полному ground truth `^…$`.
    ///
    /// Входы — все символы кроме последнего, цели — все кроме первого.
    pub fn score(&self, features: &FeatureBatch, ground_truth: &TargetBatch) -> AsrResult<Scores> {
        let mut control = StepControl::plain();
        self.score_with(features, ground_truth, &mut control)
    }

    /// Как [`LasModel::score`], но со scheduled sampling (шаг обучения).
    pub fn score_blended(
        &self,
        features: &FeatureBatch,
        ground_truth: &TargetBatch,
        rng: &mut dyn RngCore,
    ) -> AsrResult<Scores> {
        let mut control = StepControl::blended(rng);
        self.score_with(features, ground_truth, &mut control)
    }

    /// Логиты и веса внимания `[batch, chars, positions]` при teacher forcing.
    pub fn attention_map(
        &self,
        features: &FeatureBatch,
        inputs: &TargetBatch,
    ) -> AsrResult<(Tensor, Tensor)> {
        let mut control = StepControl::plain().with_capture(true);
        let out = self.teacher_forced(features, inputs, &mut control)?;
        let attention = out
            .attention
            .ok_or_else(|| AsrError::Inference("веса внимания не были собраны".into()))?;
        Ok((out.logits, attention))
    }

    /// Greedy-декодирование одного высказывания с лимитом из конфигурации.
    pub fn decode(&self, features: &FeatureBatch) -> AsrResult<GreedyOutput> {
        self.decode_with_limit(features, self.config.max_decode_steps)
    }

    /// Greedy-декодирование с явным лимитом шагов.
    pub fn decode_with_limit(
        &self,
        features: &FeatureBatch,
        max_steps: usize,
    ) -> AsrResult<GreedyOutput> {
        if features.batch_size() != 1 {
            return Err(AsrError::Shape(format!(
                "свободное декодирование поддерживает только batch = 1, получено {}",
                features.batch_size()
            )));
        }
        let start = Instant::now();
        let memory = self.listen(features)?;
        let sos = vocab::one_hot(&[vocab::SOS_ID], self.config.vocab_size, &self.device)?;

        let out = decode::greedy(&self.speller, &memory, &sos, vocab::EOS_ID, max_steps)?;
        info!(
            "LAS: {} символов за {:.2}с ({:?})",
            out.tokens.len(),
            start.elapsed().as_secs_f64(),
            out.stop_reason
        );
        Ok(out)
    }

    /// Распознать высказывание и вернуть текст без `^` и `$`.
    pub fn transcribe(&self, features: &FeatureBatch) -> AsrResult<String> {
        Ok(self.decode(features)?.text())
    }
}
