//! # asr-core
//!
//! Базовые типы, трейты и определения ошибок для RustASR Engine.
//!
//! - Граничные тензоры ядра (`FeatureBatch`, `TargetBatch`) с масками
//! - Унифицированная обработка ошибок через `AsrError`
//! - Trait [`TransitionCell`] — одношаговая функция перехода декодера
//! - Поиск файлов модели на диске ([`ModelFiles`])

pub mod debug;
pub mod error;
pub mod model_files;
pub mod traits;
pub mod types;

pub use error::{AsrError, AsrResult};
pub use model_files::ModelFiles;
pub use traits::{StepControl, StepOutput, TransitionCell};
pub use types::{mask_from_padding, FeatureBatch, TargetBatch};
