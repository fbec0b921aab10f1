//! Modbus RTU framing and register value encoding for Solplanet devices.

mod frame;
mod value;

use thiserror::Error;
use types::{DataType, RegisterKind};

pub use frame::{
    crc16, decode_response, decode_response_hex, encode_write, exception_name,
    read_registers_frame, register_offset, write_multiple_registers_frame,
    write_registers_frame, write_single_register_frame, Frame, FunctionCode, Response,
    WriteCommand, HOLDING_REGISTER_BASE, INPUT_REGISTER_BASE, MAX_READ_REGISTERS,
    MAX_WRITE_REGISTERS,
};
pub use value::{decode_value, encode_text, encode_value, missing_value, nan_sentinel, value_range};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value for type {data_type} must be in range {min}..={max}, got {value}")]
    ValueOutOfRange {
        data_type: DataType,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("data type {0} cannot be encoded from an integer")]
    UnsupportedType(DataType),
    #[error("text {0:?} must be at most two ASCII characters")]
    InvalidText(String),
    #[error("register address {address} is below the {kind:?} register base {base}")]
    AddressBelowBase {
        kind: RegisterKind,
        address: u16,
        base: u16,
    },
    #[error("register range starting at offset {offset} with {count} registers overflows")]
    AddressOverflow { offset: u16, count: u16 },
    #[error("register quantity {quantity} must be between 1 and {max}")]
    InvalidQuantity { quantity: u16, max: u16 },
    #[error("invalid response length {0}")]
    InvalidLength(usize),
    #[error("crc mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },
    #[error("byte count {declared} does not match payload length {actual}")]
    ByteCountMismatch { declared: usize, actual: usize },
    #[error("unsupported function code {0:#04x} in response")]
    UnsupportedFunction(u8),
    #[error("insufficient data for type {0}")]
    InsufficientData(DataType),
    #[error("invalid hex frame: {0}")]
    Hex(#[from] hex::FromHexError),
}
