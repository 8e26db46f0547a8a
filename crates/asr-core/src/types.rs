//! Общие типы для ASR-операций.
//!
//! Тензоры на границе ядра распознавания: батч акустических признаков с маской
//! валидных фреймов и батч one-hot целевых символов с маской позиций. Паддинг и
//! сборку батчей делает внешний пайплайн; здесь только проверка контрактов и
//! преобразования, которые ядро ожидает от границы.

use candle_core::{DType, Tensor, D};

use crate::{AsrError, AsrResult};

/// Маска валидных позиций из батча, дополненного нулями.
///
/// Позиция считается валидной, если сумма по последней оси не равна нулю.
/// `x`: `[batch, time, dim]` → `[batch, time]` (u8).
pub fn mask_from_padding(x: &Tensor) -> AsrResult<Tensor> {
    let sums = x.to_dtype(DType::F32)?.sum(D::Minus1)?;
    Ok(sums.ne(0f32)?)
}

/// Привести маску к u8 (1 — валидная позиция).
fn normalize_mask(mask: &Tensor) -> AsrResult<Tensor> {
    if mask.dtype() == DType::U8 {
        Ok(mask.clone())
    } else {
        Ok(mask.to_dtype(DType::F32)?.ne(0f32)?)
    }
}

// ---------------------------------------------------------------------------
// Акустические признаки
// ---------------------------------------------------------------------------

/// Батч лог-mel признаков с маской валидных фреймов.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    /// `[batch, frames, n_mels]`, f32.
    pub features: Tensor,
    /// `[batch, frames]`, u8.
    pub mask: Tensor,
}

impl FeatureBatch {
    /// Создать батч, проверив согласованность форм.
    pub fn new(features: Tensor, mask: Tensor) -> AsrResult<Self> {
        let (batch, frames, _n_mels) = features.dims3().map_err(|_| {
            AsrError::Shape(format!(
                "признаки должны иметь форму [batch, frames, n_mels], получено {:?}",
                features.dims()
            ))
        })?;
        if mask.dims() != [batch, frames] {
            return Err(AsrError::Shape(format!(
                "маска фреймов {:?} не совпадает с признаками [{batch}, {frames}]",
                mask.dims()
            )));
        }
        let mask = normalize_mask(&mask)?;
        Ok(Self { features, mask })
    }

    /// Батч без паддинга: все фреймы валидны.
    pub fn unmasked(features: Tensor) -> AsrResult<Self> {
        let (batch, frames, _) = features.dims3().map_err(|_| {
            AsrError::Shape(format!(
                "признаки должны иметь форму [batch, frames, n_mels], получено {:?}",
                features.dims()
            ))
        })?;
        let mask = Tensor::ones((batch, frames), DType::U8, features.device())?;
        Ok(Self { features, mask })
    }

    /// Размер батча.
    pub fn batch_size(&self) -> usize {
        self.features.dims()[0]
    }

    /// Количество фреймов.
    pub fn num_frames(&self) -> usize {
        self.features.dims()[1]
    }

    /// Количество mel-каналов.
    pub fn num_mels(&self) -> usize {
        self.features.dims()[2]
    }

    /// Отрезать хвостовые фреймы так, чтобы их число делилось на `factor`.
    ///
    /// Пирамидальный энкодер требует длину, кратную `2^depth`, и сам ничего не
    /// обрезает: это делается здесь, на границе, до вызова модели.
    pub fn trim_to_multiple(&self, factor: usize) -> AsrResult<Self> {
        if factor == 0 {
            return Err(AsrError::Shape("коэффициент кратности должен быть > 0".into()));
        }
        let frames = self.num_frames();
        let kept = frames / factor * factor;
        if kept == 0 {
            return Err(AsrError::Shape(format!(
                "{frames} фреймов меньше коэффициента даунсемплинга {factor}"
            )));
        }
        if kept == frames {
            return Ok(self.clone());
        }
        Ok(Self {
            features: self.features.narrow(1, 0, kept)?,
            mask: self.mask.narrow(1, 0, kept)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Целевые символы
// ---------------------------------------------------------------------------

/// Батч one-hot символов с маской валидных позиций.
#[derive(Debug, Clone)]
pub struct TargetBatch {
    /// `[batch, chars, vocab]`, f32 со значениями {0, 1}.
    pub one_hot: Tensor,
    /// `[batch, chars]`, u8.
    pub mask: Tensor,
}

impl TargetBatch {
    /// Создать батч, проверив согласованность форм.
    pub fn new(one_hot: Tensor, mask: Tensor) -> AsrResult<Self> {
        let (batch, chars, _vocab) = one_hot.dims3().map_err(|_| {
            AsrError::Shape(format!(
                "символы должны иметь форму [batch, chars, vocab], получено {:?}",
                one_hot.dims()
            ))
        })?;
        if mask.dims() != [batch, chars] {
            return Err(AsrError::Shape(format!(
                "маска символов {:?} не совпадает с символами [{batch}, {chars}]",
                mask.dims()
            )));
        }
        let mask = normalize_mask(&mask)?;
        Ok(Self { one_hot, mask })
    }

    /// Батч из дополненных нулями one-hot векторов: маска выводится из паддинга.
    pub fn from_padded(one_hot: Tensor) -> AsrResult<Self> {
        let mask = mask_from_padding(&one_hot)?;
        Self::new(one_hot, mask)
    }

    /// Размер батча.
    pub fn batch_size(&self) -> usize {
        self.one_hot.dims()[0]
    }

    /// Длина последовательности.
    pub fn len(&self) -> usize {
        self.one_hot.dims()[1]
    }

    /// `true`, если позиций нет.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Разбить ground truth на входы и цели для teacher forcing.
    ///
    /// Входы — все позиции кроме последней (без `$`), цели — все кроме первой
    /// (без `^`). Возвращает `(inputs, targets)`.
    pub fn teacher_forcing_split(&self) -> AsrResult<(TargetBatch, TargetBatch)> {
        let n = self.len();
        if n < 2 {
            return Err(AsrError::Shape(format!(
                "для teacher forcing нужно минимум 2 позиции (^ и $), получено {n}"
            )));
        }
        let inputs = TargetBatch {
            one_hot: self.one_hot.narrow(1, 0, n - 1)?,
            mask: self.mask.narrow(1, 0, n - 1)?,
        };
        let targets = TargetBatch {
            one_hot: self.one_hot.narrow(1, 1, n - 1)?,
            mask: self.mask.narrow(1, 1, n - 1)?,
        };
        Ok((inputs, targets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_mask_from_padding() {
        let x = Tensor::new(
            &[[[1f32, 0.0], [0.0, 0.0], [0.5, -0.25]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask: Vec<Vec<u8>> = mask_from_padding(&x).unwrap().to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 0, 1]]);
    }

    #[test]
    fn test_feature_batch_rejects_mismatched_mask() {
        let device = Device::Cpu;
        let features = Tensor::zeros((2, 16, 40), DType::F32, &device).unwrap();
        let mask = Tensor::ones((2, 15), DType::U8, &device).unwrap();
        assert!(matches!(
            FeatureBatch::new(features, mask),
            Err(AsrError::Shape(_))
        ));
    }

    #[test]
    fn test_feature_batch_float_mask_is_normalized() {
        let device = Device::Cpu;
        let features = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device).unwrap();
        let batch = FeatureBatch::new(features, mask).unwrap();
        assert_eq!(batch.mask.dtype(), DType::U8);
        let mask: Vec<Vec<u8>> = batch.mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 0]]);
    }

    #[test]
    fn test_trim_to_multiple() {
        let device = Device::Cpu;
        let features = Tensor::zeros((1, 171, 40), DType::F32, &device).unwrap();
        let batch = FeatureBatch::unmasked(features).unwrap();
        let trimmed = batch.trim_to_multiple(8).unwrap();
        assert_eq!(trimmed.num_frames(), 168);
        assert_eq!(trimmed.mask.dims(), &[1, 168]);

        let short = FeatureBatch::unmasked(Tensor::zeros((1, 7, 40), DType::F32, &device).unwrap())
            .unwrap();
        assert!(short.trim_to_multiple(8).is_err());
    }

    #[test]
    fn test_teacher_forcing_split() {
        let device = Device::Cpu;
        // 4 позиции, последняя — паддинг
        let one_hot = Tensor::new(
            &[[[1f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]]],
            &device,
        )
        .unwrap();
        let batch = TargetBatch::from_padded(one_hot).unwrap();
        let (inputs, targets) = batch.teacher_forcing_split().unwrap();

        assert_eq!(inputs.one_hot.dims(), &[1, 3, 3]);
        assert_eq!(targets.one_hot.dims(), &[1, 3, 3]);
        let in_mask: Vec<Vec<u8>> = inputs.mask.to_vec2().unwrap();
        let tar_mask: Vec<Vec<u8>> = targets.mask.to_vec2().unwrap();
        assert_eq!(in_mask, vec![vec![1, 1, 1]]);
        assert_eq!(tar_mask, vec![vec![1, 1, 0]]);
    }

    #[test]
    fn test_teacher_forcing_split_too_short() {
        let one_hot = Tensor::ones((1, 1, 5), DType::F32, &Device::Cpu).unwrap();
        let batch = TargetBatch::from_padded(one_hot).unwrap();
        assert!(batch.teacher_forcing_split().is_err());
    }
}
