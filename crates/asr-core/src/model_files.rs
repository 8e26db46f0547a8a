//! Поиск файлов модели (config.json + safetensors) в директории.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AsrError, AsrResult};

/// Имя файла конфигурации модели.
pub const CONFIG_FILE: &str = "config.json";

/// Имя одиночного файла весов.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Имя индекса шардированных весов.
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Файлы модели, найденные на диске.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// `config.json`, если он есть (иначе модель берёт конфигурацию по умолчанию).
    pub config: Option<PathBuf>,
    /// Файлы весов в детерминированном порядке.
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Найти конфигурацию и веса в `model_dir`.
    ///
    /// Поддерживает:
    /// - `model.safetensors` (один файл)
    /// - `model.safetensors.index.json` + шарды, перечисленные в `weight_map`
    pub fn discover(model_dir: impl AsRef<Path>) -> AsrResult<Self> {
        let model_dir = model_dir.as_ref();
        if !model_dir.is_dir() {
            return Err(AsrError::Model(format!(
                "Директория модели не найдена: {}",
                model_dir.display()
            )));
        }

        let config = Some(model_dir.join(CONFIG_FILE)).filter(|p| p.exists());
        let weights = resolve_safetensors_files(model_dir)?;

        debug!(
            "Файлы модели в {}: config={}, шардов={}",
            model_dir.display(),
            config.is_some(),
            weights.len()
        );

        Ok(Self { config, weights })
    }
}

/// Разрешить список safetensors-файлов в директории модели.
pub fn resolve_safetensors_files(model_dir: impl AsRef<Path>) -> AsrResult<Vec<PathBuf>> {
    let model_dir = model_dir.as_ref();

    let single = model_dir.join(WEIGHTS_FILE);
    if single.exists() {
        return Ok(vec![single]);
    }

    let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
    if !index_path.exists() {
        return Err(AsrError::Model(format!(
            "В директории модели нет ни {WEIGHTS_FILE}, ни {WEIGHTS_INDEX_FILE}: {}",
            model_dir.display()
        )));
    }

    let data = std::fs::read(&index_path)?;
    let idx: SafetensorsIndex = serde_json::from_slice(&data)?;

    // BTreeSet: один шард встречается в weight_map много раз, порядок фиксируем.
    let shards: BTreeSet<&String> = idx.weight_map.values().collect();
    if shards.is_empty() {
        return Err(AsrError::Model(format!(
            "Пустой weight_map в {}",
            index_path.display()
        )));
    }

    shards
        .into_iter()
        .map(|shard| {
            let p = model_dir.join(shard);
            if p.exists() {
                Ok(p)
            } else {
                Err(AsrError::Model(format!(
                    "В index.json указан шард, но файл не найден: {}",
                    p.display()
                )))
            }
        })
        .collect()
}
