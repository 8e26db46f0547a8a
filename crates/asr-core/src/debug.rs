//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Сколько первых шагов декодера печатать по умолчанию при включённой отладке.
const DEFAULT_DEBUG_STEPS: usize = 5;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `RUSTASR_DEBUG` (любое непустое значение).
fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("RUSTASR_DEBUG").is_some_and(|v| !v.is_empty()))
}

/// Количество первых шагов декодирования, для которых печатается top-k логитов.
///
/// `RUSTASR_DEBUG_STEPS=N` переопределяет значение; без `RUSTASR_DEBUG` всегда 0.
pub fn step_limit() -> usize {
    static LIMIT: OnceLock<usize> = OnceLock::new();
    *LIMIT.get_or_init(|| {
        if !enabled() {
            return 0;
        }
        std::env::var("RUSTASR_DEBUG_STEPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DEBUG_STEPS)
    })
}
