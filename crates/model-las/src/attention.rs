//! Внимание speller'а по выходу listener'а.
//!
//! - [`Mlp`]: Linear → ReLU → Linear (ключи, запросы и распределение символов)
//! - [`KeyProjector`]: ключи внимания, считаются один раз на высказывание
//! - [`attend`]: dot-product внимание с маской валидных позиций
//!
//! Весовые ключи MLP: `{prefix}.hidden.{weight,bias}`, `{prefix}.out.{weight,bias}`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Смещение для замаскированных позиций перед softmax.
///
/// После нормализации их вес в f32 ровно 0, пока есть хотя бы одна валидная
/// позиция; если валидных позиций нет, веса равномерные, а не NaN.
const MASK_BIAS: f32 = -1e9;

/// Двухслойный перцептрон: `out(relu(hidden(x)))`, применяется по последней оси.
#[derive(Debug, Clone)]
pub struct Mlp {
    hidden: Linear,
    out: Linear,
}

impl Mlp {
    pub fn load(in_dim: usize, hidden_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = linear(in_dim, hidden_dim, vb.pp("hidden"))?;
        let out = linear(hidden_dim, out_dim, vb.pp("out"))?;
        Ok(Self { hidden, out })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.hidden.forward(x)?.relu()?;
        self.out.forward(&h)
    }
}

/// Выход listener'а вместе с ключами внимания — константы для всех шагов декодера.
#[derive(Debug, Clone)]
pub struct AttentionMemory {
    /// Признаки listener'а (значения внимания), `[batch, positions, 2*listener_hidden]`.
    pub features: Tensor,
    /// Ключи, `[batch, positions, attention_dim]`.
    pub keys: Tensor,
    /// Маска валидных позиций, `[batch, positions]` (u8).
    pub mask: Tensor,
}

impl AttentionMemory {
    pub fn batch_size(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn num_positions(&self) -> usize {
        self.features.dims()[1]
    }

    pub fn feature_dim(&self) -> usize {
        self.features.dims()[2]
    }
}

/// Проекция признаков listener'а в ключи внимания.
///
/// Структура: Linear(2*attention) → ReLU → Linear(attention).
#[derive(Debug, Clone)]
pub struct KeyProjector {
    mlp: Mlp,
}

impl KeyProjector {
    pub fn load(feature_dim: usize, attention_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mlp = Mlp::load(feature_dim, 2 * attention_dim, attention_dim, vb)?;
        Ok(Self { mlp })
    }

    /// `[batch, positions, feature_dim]` → `[batch, positions, attention_dim]`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        self.mlp.forward(features)
    }
}

/// Dot-product внимание одного запроса на батч.
///
/// `query`: `[batch, attention_dim]`. Возвращает `(context, weights)`:
/// `[batch, feature_dim]` и `[batch, positions]`.
pub fn attend(query: &Tensor, memory: &AttentionMemory) -> Result<(Tensor, Tensor)> {
    let query = query.unsqueeze(1)?; // [batch, 1, att]
    let scores = query.matmul(&memory.keys.transpose(1, 2)?)?; // [batch, 1, positions]

    let mask = memory.mask.unsqueeze(1)?.broadcast_as(scores.shape())?;
    let bias = Tensor::full(MASK_BIAS, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
    let scores = mask.where_cond(&scores, &bias)?;

    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    let context = weights.matmul(&memory.features)?; // [batch, 1, feature_dim]

    Ok((context.squeeze(1)?, weights.squeeze(1)?))
}
