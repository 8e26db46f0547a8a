//! Конфигурация модели Listen, Attend and Spell.

use std::path::Path;

use serde::{Deserialize, Serialize};

use asr_core::{AsrError, AsrResult};

use crate::vocab;

/// Корневая конфигурация LAS.
///
/// Фиксируется при создании модели и не меняется во время работы.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LasConfig {
    /// Название модели.
    pub model_name: String,

    /// Количество лог-mel каналов на входе (40).
    pub n_mels: usize,

    /// Количество пирамидальных слоёв listener'а (3 → даунсемплинг 8×).
    pub pyramid_depth: usize,

    /// Размер каждого направления BiLSTM в listener'е (256).
    pub listener_hidden: usize,

    /// Размер внутренних LSTM-ячеек speller'а (512).
    pub decoder_hidden: usize,

    /// Размерность пространства внимания (ключи и запросы, 512).
    pub attention_dim: usize,

    /// Размер словаря: код самого старшего символа + 1 (`'z'` = 122 → 123).
    pub vocab_size: usize,

    /// Доля шагов, на которых вход speller'а берётся из его же предыдущего
    /// предсказания вместо ground truth (только при смешивании).
    pub prev_prediction_fraction: f64,

    /// Максимум шагов свободного декодирования, если `$` так и не появился.
    pub max_decode_steps: usize,

    /// Максимальная длина текста в символах (без `^` и `$`).
    pub max_target_chars: usize,
}

impl Default for LasConfig {
    fn default() -> Self {
        Self::librispeech()
    }
}

impl LasConfig {
    /// Конфигурация для LibriSpeech train-clean-100.
    pub fn librispeech() -> Self {
        Self {
            model_name: "las-librispeech".to_string(),
            n_mels: 40,
            pyramid_depth: 3,
            listener_hidden: 256,
            decoder_hidden: 512,
            attention_dim: 512,
            vocab_size: vocab::VOCAB_SIZE,
            prev_prediction_fraction: 0.1,
            max_decode_steps: 300,
            max_target_chars: 300,
        }
    }

    /// Маленькая конфигурация для тестов и проверки установки.
    pub fn tiny() -> Self {
        Self {
            model_name: "las-tiny".to_string(),
            n_mels: 40,
            pyramid_depth: 3,
            listener_hidden: 8,
            decoder_hidden: 16,
            attention_dim: 8,
            vocab_size: vocab::VOCAB_SIZE,
            prev_prediction_fraction: 0.1,
            max_decode_steps: 20,
            max_target_chars: 300,
        }
    }

    /// Загрузить конфигурацию из JSON-файла и проверить её.
    ///
    /// Отсутствующие поля берутся из [`LasConfig::librispeech`].
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            AsrError::Config(format!("Ошибка парсинга {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Проверить согласованность параметров.
    pub fn validate(&self) -> AsrResult<()> {
        let widths = [
            ("n_mels", self.n_mels),
            ("listener_hidden", self.listener_hidden),
            ("decoder_hidden", self.decoder_hidden),
            ("attention_dim", self.attention_dim),
            ("max_decode_steps", self.max_decode_steps),
            ("max_target_chars", self.max_target_chars),
        ];
        for (name, value) in widths {
            if value == 0 {
                return Err(AsrError::Config(format!("{name} должен быть > 0")));
            }
        }
        if self.vocab_size < vocab::VOCAB_SIZE {
            return Err(AsrError::Config(format!(
                "vocab_size={} меньше алфавита ({})",
                self.vocab_size,
                vocab::VOCAB_SIZE
            )));
        }
        if !(0.0..=1.0).contains(&self.prev_prediction_fraction) {
            return Err(AsrError::Config(format!(
                "prev_prediction_fraction={} вне [0, 1]",
                self.prev_prediction_fraction
            )));
        }
        // 2^depth должен помещаться в usize с запасом
        if self.pyramid_depth >= usize::BITS as usize / 2 {
            return Err(AsrError::Config(format!(
                "pyramid_depth={} слишком велик",
                self.pyramid_depth
            )));
        }
        Ok(())
    }

    /// Временной даунсемплинг listener'а: `2^pyramid_depth`.
    pub fn downsample_factor(&self) -> usize {
        1 << self.pyramid_depth
    }

    /// Размерность выхода listener'а (BiLSTM: два направления).
    pub fn listener_dim(&self) -> usize {
        2 * self.listener_hidden
    }

    /// Размерность входа первой LSTM-ячейки speller'а: `[s, y, c]`.
    pub fn speller_input_dim(&self) -> usize {
        self.decoder_hidden + self.vocab_size + self.listener_dim()
    }
}
