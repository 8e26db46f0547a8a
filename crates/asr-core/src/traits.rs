//! Интерфейс одношаговой функции перехода для авторегрессивных декодеров.
//!
//! Декодер с вниманием нельзя собрать из независимых слоёв: контекст на шаге
//! `i` зависит от скрытого состояния шага `i`, а оно — от контекста шага
//! `i - 1`. Поэтому весь шаг (рекуррентное обновление, внимание, предсказание)
//! выражается одной функцией `(вход, состояние, константы) → (выход, новое
//! состояние)`, а цикл по времени пишется явно вызывающей стороной.

use candle_core::{Result, Tensor};
use rand::RngCore;

/// Управление одним шагом декодера.
///
/// Источник случайности принадлежит вызывающей стороне: шаг никогда не берёт
/// глобальный RNG, поэтому воспроизводимость задаётся seed'ом снаружи.
pub struct StepControl<'a> {
    /// `Some(rng)` — смешивать вход с сэмплом из предыдущего предсказания
    /// (scheduled sampling). `None` — вход используется как есть.
    pub blend: Option<&'a mut dyn RngCore>,
    /// Вернуть диагностику шага (веса внимания).
    pub capture: bool,
}

impl<'a> StepControl<'a> {
    /// Детерминированный шаг без смешивания и без диагностики.
    pub fn plain() -> Self {
        Self {
            blend: None,
            capture: false,
        }
    }

    /// Шаг со смешиванием входа через заданный RNG.
    pub fn blended(rng: &'a mut dyn RngCore) -> Self {
        Self {
            blend: Some(rng),
            capture: false,
        }
    }

    /// Включить возврат диагностики.
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }
}

/// Результат одного шага.
#[derive(Debug, Clone)]
pub struct StepOutput<S> {
    /// Выход шага (логиты), `[batch, vocab]`.
    pub output: Tensor,
    /// Состояние для следующего шага.
    pub state: S,
    /// Диагностика (веса внимания `[batch, positions]`), только если запрошена.
    pub diagnostics: Option<Tensor>,
}

/// Одношаговая функция перехода рекуррентного декодера.
pub trait TransitionCell {
    /// Состояние, переносимое между шагами.
    type State;

    /// Константы уровня высказывания, общие для всех шагов.
    type Constants;

    /// Нулевое начальное состояние для батча, заданного константами.
    fn initial_state(&self, constants: &Self::Constants) -> Result<Self::State>;

    /// Один шаг: `input` — распределение по словарю `[batch, vocab]`.
    fn step(
        &self,
        input: &Tensor,
        state: &Self::State,
        constants: &Self::Constants,
        control: &mut StepControl<'_>,
    ) -> Result<StepOutput<Self::State>>;
}
