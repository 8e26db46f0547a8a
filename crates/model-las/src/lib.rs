//! Listen, Attend and Spell — посимвольное распознавание речи на Candle.
//!
//! Пирамидальный BiLSTM-энкодер (listener) сжимает лог-mel признаки в `2^depth`
//! раз; декодер (speller) с dot-product вниманием предсказывает символы по
//! одному. Словарь — кодовые точки Unicode до `z` включительно.

pub mod attention;
pub mod config;
pub mod decode;
pub mod listener;
pub mod lstm;
pub mod model;
pub mod scoring;
pub mod speller;
pub mod vocab;

pub use config::LasConfig;
pub use decode::{GreedyOutput, StopReason};
pub use model::{LasModel, Scores};
