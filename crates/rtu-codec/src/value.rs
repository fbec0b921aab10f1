use types::{DataType, RegisterValue};

use crate::CodecError;

/// Raw pattern a device reports when a register holds no value.
pub fn nan_sentinel(data_type: DataType) -> u32 {
    match data_type {
        DataType::B16 | DataType::U16 | DataType::E16 => 0xFFFF,
        DataType::B32 | DataType::U32 => 0xFFFF_FFFF,
        DataType::S16 => 0x8000,
        DataType::S32 => 0x8000_0000,
        DataType::String => 0x0000,
    }
}

/// Inclusive range of integers accepted for a numeric data type.
pub fn value_range(data_type: DataType) -> Option<(i64, i64)> {
    match data_type {
        DataType::B16 | DataType::U16 | DataType::E16 => Some((0, i64::from(u16::MAX))),
        DataType::B32 | DataType::U32 => Some((0, i64::from(u32::MAX))),
        DataType::S16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
        DataType::S32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
        DataType::String => None,
    }
}

/// Encodes an integer into register words. 32-bit types come out high word first.
pub fn encode_value(value: i64, data_type: DataType) -> Result<Vec<u16>, CodecError> {
    let (min, max) = value_range(data_type).ok_or(CodecError::UnsupportedType(data_type))?;
    if value < min || value > max {
        return Err(CodecError::ValueOutOfRange {
            data_type,
            value,
            min,
            max,
        });
    }

    let words = match data_type {
        DataType::B16 | DataType::U16 | DataType::E16 => vec![value as u16],
        DataType::S16 => vec![(value as i16) as u16],
        DataType::B32 | DataType::U32 => split_u32(value as u32),
        DataType::S32 => split_u32((value as i32) as u32),
        DataType::String => return Err(CodecError::UnsupportedType(data_type)),
    };
    Ok(words)
}

/// Packs up to two ASCII characters into one register, first character in the high byte.
pub fn encode_text(text: &str) -> Result<u16, CodecError> {
    if text.len() > 2 || !text.is_ascii() {
        return Err(CodecError::InvalidText(text.to_string()));
    }
    let bytes = text.as_bytes();
    let high = bytes.first().copied().unwrap_or(0);
    let low = bytes.get(1).copied().unwrap_or(0);
    Ok(u16::from_be_bytes([high, low]))
}

/// Register words that mark "no value" for the type.
pub fn missing_value(data_type: DataType) -> Vec<u16> {
    let raw = nan_sentinel(data_type);
    if data_type.register_count() == 2 {
        split_u32(raw)
    } else {
        vec![raw as u16]
    }
}

/// Decodes register words into a value. Returns `None` for the type's NaN sentinel.
pub fn decode_value(words: &[u16], data_type: DataType) -> Result<Option<RegisterValue>, CodecError> {
    let needed = usize::from(data_type.register_count());
    if words.len() < needed {
        return Err(CodecError::InsufficientData(data_type));
    }

    let raw = if needed == 2 {
        (u32::from(words[0]) << 16) | u32::from(words[1])
    } else {
        u32::from(words[0])
    };

    Ok(decode_raw(raw, data_type))
}

fn decode_raw(raw: u32, data_type: DataType) -> Option<RegisterValue> {
    if raw == nan_sentinel(data_type) {
        return None;
    }

    let value = match data_type {
        DataType::B16 | DataType::B32 | DataType::U16 | DataType::U32 | DataType::E16 => {
            RegisterValue::Integer(i64::from(raw))
        }
        DataType::S16 => RegisterValue::Integer(i64::from(raw as u16 as i16)),
        DataType::S32 => RegisterValue::Integer(i64::from(raw as i32)),
        DataType::String => {
            let [high, low] = (raw as u16).to_be_bytes();
            let text = [high, low]
                .into_iter()
                .filter(|byte| *byte != 0)
                .map(char::from)
                .collect();
            RegisterValue::Text(text)
        }
    };
    Some(value)
}

fn split_u32(value: u32) -> Vec<u16> {
    vec![(value >> 16) as u16, (value & 0xFFFF) as u16]
}
