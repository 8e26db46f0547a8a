//! Посимвольный словарь LAS.
//!
//! Индекс символа — его Unicode-код, поэтому размер one-hot вектора равен коду
//! `'z'` плюс один (123). Допустимы `a–z`, `0–9`, пробел, запятая, точка и
//! апостроф; всё остальное на границе превращается в `?`. Служебные символы:
//! `^` — начало последовательности, `$` — конец.

use candle_core::{Device, Result, Tensor};

use asr_core::{AsrError, AsrResult};

/// Размер словаря (`'z' as usize + 1`).
pub const VOCAB_SIZE: usize = 'z' as usize + 1;

/// Символ начала последовательности.
pub const SOS: char = '^';
/// Символ конца последовательности.
pub const EOS: char = '$';
/// Заменитель неизвестного символа.
pub const UNK: char = '?';

/// Индекс `^`.
pub const SOS_ID: u32 = SOS as u32;
/// Индекс `$`.
pub const EOS_ID: u32 = EOS as u32;
/// Индекс `?`.
pub const UNK_ID: u32 = UNK as u32;

/// Символ, допустимый в тексте транскрипции.
pub fn is_text_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, ' ' | ',' | '.' | '\'')
}

/// Символ алфавита модели (текстовый, `?`, `^` или `$`).
pub fn is_symbol(c: char) -> bool {
    is_text_char(c) || matches!(c, UNK | SOS | EOS)
}

/// Привести текст к алфавиту: нижний регистр, посторонние символы → `?`.
pub fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if is_text_char(c) { c } else { UNK })
        .collect()
}

/// Закодировать транскрипцию в индексы `^ ... $`.
///
/// Текст длиннее `max_chars` (после нормализации) — ошибка контракта:
/// такие примеры должны отфильтровываться до модели.
pub fn encode(text: &str, max_chars: usize) -> AsrResult<Vec<u32>> {
    let normalized = normalize(text);
    let len = normalized.chars().count();
    if len > max_chars {
        return Err(AsrError::Shape(format!(
            "текст из {len} символов длиннее лимита {max_chars}"
        )));
    }

    let mut ids = Vec::with_capacity(len + 2);
    ids.push(SOS_ID);
    ids.extend(normalized.chars().map(|c| c as u32));
    ids.push(EOS_ID);
    Ok(ids)
}

/// One-hot матрица `[ids.len(), vocab_size]`.
pub fn one_hot(ids: &[u32], vocab_size: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; ids.len() * vocab_size];
    for (row, &id) in ids.iter().enumerate() {
        let id = id as usize;
        if id >= vocab_size {
            candle_core::bail!("индекс символа {id} вне словаря размера {vocab_size}");
        }
        data[row * vocab_size + id] = 1.0;
    }
    Tensor::from_vec(data, (ids.len(), vocab_size), device)
}

/// Декодировать индексы в текст; индексы вне алфавита становятся `?`.
pub fn decode(ids: &[u32]) -> String {
    ids.iter()
        .map(|&id| {
            // все символы алфавита < 123, поэтому влезают в u8
            let id = if char::from_u32(id).is_some_and(is_symbol) { id } else { UNK_ID };
            char::from(id as u8)
        })
        .collect()
}

/// Текст гипотезы без служебных символов `^` и `$`.
pub fn transcript(ids: &[u32]) -> String {
    let kept: Vec<u32> = ids
        .iter()
        .copied()
        .filter(|&id| id != SOS_ID && id != EOS_ID)
        .collect();
    decode(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocab_constants() {
        assert_eq!(VOCAB_SIZE, 123);
        assert_eq!(SOS_ID, 94);
        assert_eq!(EOS_ID, 36);
        assert_eq!(UNK_ID, 63);
    }

    #[test]
    fn test_normalize_maps_unknown() {
        assert_eq!(normalize("Hello, World!"), "hello, world?");
        assert_eq!(normalize("don't stop"), "don't stop");
        assert_eq!(normalize("naïve ^$"), "na?ve ??");
    }

    #[test]
    fn test_encode_wraps_with_markers() {
        let ids = encode("Cat", 300).unwrap();
        assert_eq!(ids, vec![SOS_ID, 'c' as u32, 'a' as u32, 't' as u32, EOS_ID]);
        assert_eq!(decode(&ids), "^cat$");
        assert_eq!(transcript(&ids), "cat");
    }

    #[test]
    fn test_encode_rejects_long_text() {
        assert!(matches!(encode("abcdef", 5), Err(AsrError::Shape(_))));
        assert!(encode("abcde", 5).is_ok());
    }

    #[test]
    fn test_one_hot_rows() {
        let ids = encode("ab", 10).unwrap();
        let t = one_hot(&ids, VOCAB_SIZE, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[4, VOCAB_SIZE]);

        let rows: Vec<Vec<f32>> = t.to_vec2().unwrap();
        for (row, &id) in rows.iter().zip(ids.iter()) {
            assert_eq!(row.iter().sum::<f32>(), 1.0);
            assert_eq!(row[id as usize], 1.0);
        }
    }

    #[test]
    fn test_one_hot_out_of_range() {
        assert!(one_hot(&[200], VOCAB_SIZE, &Device::Cpu).is_err());
    }

    #[test]
    fn test_decode_invalid_ids() {
        assert_eq!(decode(&['a' as u32, 0, 'Z' as u32, 0x11_0000]), "a???");
    }
}
