//! Listener: пирамидальный BiLSTM-энкодер.
//!
//! Каждая пирамидальная ступень прогоняет BiLSTM (2*H на шаг) и склеивает
//! соседние пары шагов в вектор 4*H, вдвое сокращая длину. После `depth`
//! ступеней идёт финальный BiLSTM без даунсемплинга.
//!
//! Весовые ключи:
//! - `pyramid.{i}.{forward,backward}.*` — ступени
//! - `final.{forward,backward}.*` — финальный слой

use candle_core::{bail, Result, Tensor, D};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::LasConfig;
use crate::lstm::BiLstm;

/// Одна пирамидальная ступень: BiLSTM + склейка пар шагов.
#[derive(Debug, Clone)]
pub struct PyramidStage {
    bilstm: BiLstm,
}

impl PyramidStage {
    pub fn load(input_dim: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            bilstm: BiLstm::load(input_dim, hidden_size, vb)?,
        })
    }

    /// Ширина выхода (4*H).
    pub fn output_dim(&self) -> usize {
        2 * self.bilstm.output_dim()
    }

    /// `(x [B,T,D], mask [B,T])` → `(x' [B,T/2,4H], mask' [B,T/2])`.
    ///
    /// `mask'[k] = mask[2k] AND mask[2k+1]`. Нечётная или нулевая длина — ошибка.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, time, _) = x.dims3()?;
        if time == 0 || time % 2 != 0 {
            bail!("пирамидальная ступень ожидает чётное положительное число шагов, получено {time}");
        }
        let half = time / 2;

        let h = self.bilstm.forward(x, mask)?; // [B, T, 2H]
        let h = h.reshape((batch, half, self.output_dim()))?;
        let mask = mask.reshape((batch, half, 2))?.min(D::Minus1)?;

        Ok((h, mask))
    }
}

/// Выход listener'а.
#[derive(Debug, Clone)]
pub struct ListenerOutput {
    /// `[batch, frames / 2^depth, 2*listener_hidden]`.
    pub features: Tensor,
    /// `[batch, frames / 2^depth]` (u8).
    pub mask: Tensor,
}

/// Пирамидальный энкодер целиком.
#[derive(Debug, Clone)]
pub struct Listener {
    stages: Vec<PyramidStage>,
    final_layer: BiLstm,
    n_mels: usize,
}

impl Listener {
    pub fn load(config: &LasConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.listener_hidden;
        let mut stages = Vec::with_capacity(config.pyramid_depth);
        let mut input_dim = config.n_mels;
        for i in 0..config.pyramid_depth {
            let stage = PyramidStage::load(input_dim, hidden, vb.pp(format!("pyramid.{i}")))?;
            input_dim = stage.output_dim();
            stages.push(stage);
        }
        let final_layer = BiLstm::load(input_dim, hidden, vb.pp("final"))?;
        debug!(
            "Listener: {} ступеней, hidden={}, выход={}",
            stages.len(),
            hidden,
            final_layer.output_dim()
        );

        Ok(Self {
            stages,
            final_layer,
            n_mels: config.n_mels,
        })
    }

    /// Коэффициент сокращения длины.
    pub fn downsample_factor(&self) -> usize {
        1 << self.stages.len()
    }

    /// `features [B,F,M]`, `mask [B,F]` → признаки и маска длины `F / 2^depth`.
    pub fn forward(&self, features: &Tensor, mask: &Tensor) -> Result<ListenerOutput> {
        let (_, frames, mels) = features.dims3()?;
        if mels != self.n_mels {
            bail!("listener ожидает {} mel-каналов, получено {mels}", self.n_mels);
        }
        let factor = self.downsample_factor();
        if frames == 0 || frames % factor != 0 {
            bail!("число фреймов {frames} должно быть положительным и кратным {factor}");
        }

        let mut x = features.clone();
        let mut mask = mask.clone();
        for stage in &self.stages {
            (x, mask) = stage.forward(&x, &mask)?;
        }
        let features = self.final_layer.forward(&x, &mask)?;

        Ok(ListenerOutput { features, mask })
    }
}
