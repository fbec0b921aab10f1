use std::fmt;

use crc::{Crc, CRC_16_MODBUS};
use serde::Serialize;
use tracing::debug;

use types::{DataType, RegisterKind};

use crate::value::encode_value;
use crate::CodecError;

pub const HOLDING_REGISTER_BASE: u16 = 40_001;
pub const INPUT_REGISTER_BASE: u16 = 30_001;
/// Protocol limit for function 0x03/0x04.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Protocol limit for function 0x10.
pub const MAX_WRITE_REGISTERS: u16 = 123;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleRegister,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn for_read(kind: RegisterKind) -> Self {
        match kind {
            RegisterKind::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterKind::Input => FunctionCode::ReadInputRegisters,
        }
    }
}

/// CRC-16/MODBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Converts an absolute register address (e.g. 40001) into the zero-based protocol offset.
pub fn register_offset(kind: RegisterKind, address: u16) -> Result<u16, CodecError> {
    let base = match kind {
        RegisterKind::Holding => HOLDING_REGISTER_BASE,
        RegisterKind::Input => INPUT_REGISTER_BASE,
    };
    address
        .checked_sub(base)
        .ok_or(CodecError::AddressBelowBase { kind, address, base })
}

/// A complete RTU application data unit, CRC included.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    fn seal(mut body: Vec<u8>) -> Self {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        Frame(body)
    }

    pub fn from_hex(value: &str) -> Result<Self, CodecError> {
        Ok(Frame(hex::decode(value.trim())?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// `None` for frames too short to carry the field, such as one parsed from empty hex.
    pub fn device_address(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn function(&self) -> Option<u8> {
        self.0.get(1).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.to_hex())
    }
}

/// Builds a 0x03/0x04 request. `offset` is the zero-based protocol offset.
pub fn read_registers_frame(
    device_address: u8,
    kind: RegisterKind,
    offset: u16,
    count: u16,
) -> Result<Frame, CodecError> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(CodecError::InvalidQuantity {
            quantity: count,
            max: MAX_READ_REGISTERS,
        });
    }
    check_span(offset, count)?;
    Ok(header_frame(
        device_address,
        FunctionCode::for_read(kind),
        offset,
        count,
    ))
}

/// Builds a 0x06 request.
pub fn write_single_register_frame(device_address: u8, offset: u16, value: u16) -> Frame {
    header_frame(
        device_address,
        FunctionCode::WriteSingleRegister,
        offset,
        value,
    )
}

/// Builds a 0x10 request for consecutive registers starting at `offset`.
pub fn write_multiple_registers_frame(
    device_address: u8,
    offset: u16,
    words: &[u16],
) -> Result<Frame, CodecError> {
    let quantity = u16::try_from(words.len()).unwrap_or(u16::MAX);
    if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
        return Err(CodecError::InvalidQuantity {
            quantity,
            max: MAX_WRITE_REGISTERS,
        });
    }
    check_span(offset, quantity)?;

    let mut body = Vec::with_capacity(7 + words.len() * 2 + 2);
    body.push(device_address);
    body.push(FunctionCode::WriteMultipleRegisters.code());
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&quantity.to_be_bytes());
    body.push((quantity * 2) as u8);
    for word in words {
        body.extend_from_slice(&word.to_be_bytes());
    }
    Ok(Frame::seal(body))
}

/// Picks 0x06 for one word and 0x10 otherwise.
pub fn write_registers_frame(
    device_address: u8,
    offset: u16,
    words: &[u16],
) -> Result<Frame, CodecError> {
    match words {
        [word] => Ok(write_single_register_frame(device_address, offset, *word)),
        _ => write_multiple_registers_frame(device_address, offset, words),
    }
}

/// An encoded holding-register write, ready to log or transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub device_address: u8,
    pub register_address: u16,
    pub offset: u16,
    pub data_type: DataType,
    pub words: Vec<u16>,
    pub frame: Frame,
}

/// Encodes `value` as `data_type` and frames it for the holding register at `register_address`.
pub fn encode_write(
    device_address: u8,
    register_address: u16,
    data_type: DataType,
    value: i64,
) -> Result<WriteCommand, CodecError> {
    let offset = register_offset(RegisterKind::Holding, register_address)?;
    let words = encode_value(value, data_type)?;
    let frame = write_registers_frame(device_address, offset, &words)?;
    debug!(
        device_address,
        register_address,
        %data_type,
        value,
        frame = %frame,
        "encoded register write"
    );

    Ok(WriteCommand {
        device_address,
        register_address,
        offset,
        data_type,
        words,
        frame,
    })
}

fn header_frame(device_address: u8, function: FunctionCode, offset: u16, value: u16) -> Frame {
    let mut body = Vec::with_capacity(8);
    body.push(device_address);
    body.push(function.code());
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&value.to_be_bytes());
    Frame::seal(body)
}

fn check_span(offset: u16, count: u16) -> Result<(), CodecError> {
    let last = u32::from(offset) + u32::from(count) - 1;
    if last > u32::from(u16::MAX) {
        return Err(CodecError::AddressOverflow { offset, count });
    }
    Ok(())
}

/// A decoded device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers {
        device_address: u8,
        function: FunctionCode,
        words: Vec<u16>,
    },
    SingleWritten {
        device_address: u8,
        offset: u16,
        value: u16,
    },
    MultipleWritten {
        device_address: u8,
        offset: u16,
        quantity: u16,
    },
    Exception {
        device_address: u8,
        function: u8,
        code: u8,
    },
}

impl Response {
    pub fn device_address(&self) -> u8 {
        match self {
            Response::Registers { device_address, .. }
            | Response::SingleWritten { device_address, .. }
            | Response::MultipleWritten { device_address, .. }
            | Response::Exception { device_address, .. } => *device_address,
        }
    }
}

pub fn decode_response_hex(value: &str) -> Result<Response, CodecError> {
    let frame = Frame::from_hex(value)?;
    decode_response(frame.as_bytes())
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    if bytes.len() < 5 {
        return Err(CodecError::InvalidLength(bytes.len()));
    }

    let device_address = bytes[0];
    let function = bytes[1];

    if function & EXCEPTION_FLAG != 0
        && FunctionCode::from_code(function & !EXCEPTION_FLAG).is_some()
    {
        if bytes.len() != 5 {
            return Err(CodecError::InvalidLength(bytes.len()));
        }
        verify_crc(bytes)?;
        return Ok(Response::Exception {
            device_address,
            function,
            code: bytes[2],
        });
    }

    match FunctionCode::from_code(function) {
        Some(function @ (FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters)) => {
            verify_crc(bytes)?;
            let declared = usize::from(bytes[2]);
            let data = &bytes[3..bytes.len() - 2];
            if declared != data.len() || declared % 2 != 0 {
                return Err(CodecError::ByteCountMismatch {
                    declared,
                    actual: data.len(),
                });
            }
            let words = data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Response::Registers {
                device_address,
                function,
                words,
            })
        }
        Some(FunctionCode::WriteSingleRegister) => {
            let (offset, value) = echo_fields(bytes)?;
            Ok(Response::SingleWritten {
                device_address,
                offset,
                value,
            })
        }
        Some(FunctionCode::WriteMultipleRegisters) => {
            let (offset, quantity) = echo_fields(bytes)?;
            Ok(Response::MultipleWritten {
                device_address,
                offset,
                quantity,
            })
        }
        None => Err(CodecError::UnsupportedFunction(function)),
    }
}

fn echo_fields(bytes: &[u8]) -> Result<(u16, u16), CodecError> {
    if bytes.len() != 8 {
        return Err(CodecError::InvalidLength(bytes.len()));
    }
    verify_crc(bytes)?;
    Ok((
        u16::from_be_bytes([bytes[2], bytes[3]]),
        u16::from_be_bytes([bytes[4], bytes[5]]),
    ))
}

fn verify_crc(bytes: &[u8]) -> Result<(), CodecError> {
    let split = bytes.len() - 2;
    let received = u16::from_le_bytes([bytes[split], bytes[split + 1]]);
    let expected = crc16(&bytes[..split]);
    if received != expected {
        return Err(CodecError::CrcMismatch { expected, received });
    }
    Ok(())
}

/// Human-readable name of a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
