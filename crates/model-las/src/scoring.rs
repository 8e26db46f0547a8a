//! Маскированные loss и accuracy по логитам декодера.
//!
//! Замаскированные позиции отсекаются через `where_cond`, а не умножением на
//! маску: мусор в паддинге (включая inf/NaN) не попадает в результат.

use candle_core::{bail, DType, Result, Tensor, D};

/// Число валидных позиций маски `[batch, steps]`; ноль — ошибка.
fn valid_count(mask: &Tensor) -> Result<f64> {
    let count = mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as f64;
    if count == 0.0 {
        bail!("маска не содержит ни одной валидной позиции");
    }
    Ok(count)
}

fn check_shapes(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<()> {
    let (batch, steps, _) = logits.dims3()?;
    if logits.dims() != targets.dims() {
        bail!(
            "формы логитов {:?} и целей {:?} не совпадают",
            logits.dims(),
            targets.dims()
        );
    }
    if mask.dims() != [batch, steps] {
        bail!("маска {:?} не совпадает с [{batch}, {steps}]", mask.dims());
    }
    Ok(())
}

/// Категориальная кросс-энтропия по логитам, усреднённая по валидным позициям.
///
/// `logits`, `targets`: `[batch, steps, vocab]` (targets — one-hot),
/// `mask`: `[batch, steps]`. Возвращает скаляр.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    check_shapes(logits, targets, mask)?;
    let count = valid_count(mask)?;

    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let per_position = (targets.to_dtype(log_probs.dtype())? * log_probs)?
        .sum(D::Minus1)?
        .neg()?;
    let zeros = per_position.zeros_like()?;
    let per_position = mask.ne(0u8)?.where_cond(&per_position, &zeros)?;

    per_position.sum_all()? / count
}

/// Доля валидных позиций, где argmax логитов совпадает с argmax цели. Скаляр f32.
pub fn masked_accuracy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    check_shapes(logits, targets, mask)?;
    let count = valid_count(mask)?;

    let predicted = logits.argmax(D::Minus1)?;
    let expected = targets.argmax(D::Minus1)?;
    let hits = predicted.eq(&expected)?;
    let hits = mask.ne(0u8)?.where_cond(&hits, &hits.zeros_like()?)?;

    hits.to_dtype(DType::F32)?.sum_all()? / count
}
