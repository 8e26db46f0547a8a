//! Циклы декодирования поверх [`TransitionCell`].
//!
//! - teacher forcing: известные входы на каждом шаге, все позиции батча
//! - greedy: argmax предыдущего шага подаётся на вход следующего (batch = 1)

use candle_core::{bail, IndexOp, Result, Tensor, D};
use tracing::debug;

use asr_core::{debug as asr_debug, StepControl, TransitionCell};

use crate::vocab;

/// Результат декодирования с teacher forcing.
#[derive(Debug, Clone)]
pub struct TeacherForcedOutput {
    /// `[batch, steps, vocab]`.
    pub logits: Tensor,
    /// Веса внимания `[batch, steps, positions]`, если запрошены.
    pub attention: Option<Tensor>,
}

/// Почему остановилось свободное декодирование.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Предсказан символ конца `$`.
    EndToken,
    /// Достигнут лимит шагов.
    MaxSteps,
}

/// Результат greedy-декодирования одного высказывания.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreedyOutput {
    /// Индексы символов по шагам; при [`StopReason::EndToken`] последний — `$`.
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
}

impl GreedyOutput {
    /// Текст без служебных символов.
    pub fn text(&self) -> String {
        vocab::transcript(&self.tokens)
    }
}

/// Прогнать ячейку по известным входам `inputs [batch, steps, vocab]`.
///
/// Состояние начинается с нуля; шаги выполняются для всех позиций независимо
/// от длины отдельных примеров (паддинг отсекается маской при подсчёте loss).
pub fn teacher_forced<C: TransitionCell>(
    cell: &C,
    constants: &C::Constants,
    inputs: &Tensor,
    control: &mut StepControl<'_>,
) -> Result<TeacherForcedOutput> {
    let (_, steps, _) = inputs.dims3()?;
    if steps == 0 {
        bail!("teacher forcing: пустая последовательность входов");
    }

    let mut state = cell.initial_state(constants)?;
    let mut logits = Vec::with_capacity(steps);
    let mut weights = Vec::new();
    for i in 0..steps {
        let input = inputs.i((.., i, ..))?.contiguous()?;
        let out = cell.step(&input, &state, constants, control)?;
        logits.push(out.output);
        if let Some(w) = out.diagnostics {
            weights.push(w);
        }
        state = out.state;
    }

    let attention = if weights.len() == steps {
        Some(Tensor::stack(&weights, 1)?)
    } else {
        None
    };
    Ok(TeacherForcedOutput {
        logits: Tensor::stack(&logits, 1)?,
        attention,
    })
}

/// Greedy-декодирование одного высказывания.
///
/// `start`: one-hot `[1, vocab]` символа `^`. Останавливается после символа
/// `end_id` или через `max_steps` шагов; количество токенов всегда равно
/// числу выполненных шагов.
pub fn greedy<C: TransitionCell>(
    cell: &C,
    constants: &C::Constants,
    start: &Tensor,
    end_id: u32,
    max_steps: usize,
) -> Result<GreedyOutput> {
    let (batch, vocab_size) = start.dims2()?;
    if batch != 1 {
        bail!("greedy-декодирование поддерживает только batch = 1, получено {batch}");
    }
    let device = start.device();
    let debug_steps = asr_debug::step_limit();

    let mut state = cell.initial_state(constants)?;
    let mut input = start.clone();
    let mut tokens = Vec::new();
    let mut control = StepControl::plain();

    for step in 0..max_steps {
        let out = cell.step(&input, &state, constants, &mut control)?;
        let logits = out.output.i(0)?;
        let token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

        if step < debug_steps {
            let values: Vec<f32> = logits.to_dtype(candle_core::DType::F32)?.to_vec1()?;
            let mut ranked: Vec<(usize, f32)> = values.into_iter().enumerate().collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.truncate(5);
            debug!("LAS step {step}: token={token} top5={ranked:?}");
        }

        tokens.push(token);
        if token == end_id {
            return Ok(GreedyOutput {
                tokens,
                stop_reason: StopReason::EndToken,
            });
        }

        input = vocab::one_hot(&[token], vocab_size, device)?.to_dtype(start.dtype())?;
        state = out.state;
    }

    debug!("LAS: достигнут лимит {max_steps} шагов без символа конца");
    Ok(GreedyOutput {
        tokens,
        stop_reason: StopReason::MaxSteps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Ячейка-счётчик: предсказывает `state + 1`, на входе не смотрит.
    struct Counter {
        vocab: usize,
    }

    impl TransitionCell for Counter {
        type State = u32;
        type Constants = ();

        fn initial_state(&self, _: &()) -> Result<u32> {
            Ok(0)
        }

        fn step(
            &self,
            input: &Tensor,
            state: &u32,
            _: &(),
            control: &mut StepControl<'_>,
        ) -> Result<asr_core::StepOutput<u32>> {
            let next = state + 1;
            let batch = input.dims()[0];
            let ids = vec![next; batch];
            let output = vocab::one_hot(&ids, self.vocab, input.device())?;
            let diagnostics = control
                .capture
                .then(|| Tensor::ones((batch, 2), DType::F32, input.device()))
                .transpose()?;
            Ok(asr_core::StepOutput {
                output,
                state: next,
                diagnostics,
            })
        }
    }

    #[test]
    fn test_greedy_stops_on_end_token() {
        let cell = Counter { vocab: 10 };
        let start = vocab::one_hot(&[0], 10, &Device::Cpu).unwrap();
        let out = greedy(&cell, &(), &start, 3, 8).unwrap();
        assert_eq!(out.tokens, vec![1, 2, 3]);
        assert_eq!(out.stop_reason, StopReason::EndToken);
    }

    #[test]
    fn test_greedy_respects_step_cap() {
        let cell = Counter { vocab: 10 };
        let start = vocab::one_hot(&[0], 10, &Device::Cpu).unwrap();
        let out = greedy(&cell, &(), &start, 9, 4).unwrap();
        assert_eq!(out.tokens, vec![1, 2, 3, 4]);
        assert_eq!(out.stop_reason, StopReason::MaxSteps);
    }

    #[test]
    fn test_greedy_rejects_batch() {
        let cell = Counter { vocab: 10 };
        let start = vocab::one_hot(&[0, 0], 10, &Device::Cpu).unwrap();
        assert!(greedy(&cell, &(), &start, 9, 4).is_err());
    }

    #[test]
    fn test_teacher_forced_shapes() {
        let cell = Counter { vocab: 10 };
        let inputs = Tensor::zeros((2, 5, 10), DType::F32, &Device::Cpu).unwrap();

        let mut control = StepControl::plain();
        let out = teacher_forced(&cell, &(), &inputs, &mut control).unwrap();
        assert_eq!(out.logits.dims(), &[2, 5, 10]);
        assert!(out.attention.is_none());

        let mut control = StepControl::plain().with_capture(true);
        let out = teacher_forced(&cell, &(), &inputs, &mut control).unwrap();
        assert_eq!(out.attention.unwrap().dims(), &[2, 5, 2]);
    }
}
