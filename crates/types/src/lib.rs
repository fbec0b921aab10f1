use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Register data types understood by Solplanet firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 16-bit bit field.
    B16,
    /// 32-bit bit field.
    B32,
    S16,
    U16,
    S32,
    U32,
    /// 16-bit enumerated code.
    E16,
    /// Two ASCII characters packed into one register.
    #[serde(rename = "String")]
    String,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::B16,
        DataType::B32,
        DataType::S16,
        DataType::U16,
        DataType::S32,
        DataType::U32,
        DataType::E16,
        DataType::String,
    ];

    /// Number of 16-bit registers occupied by one value.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::B32 | DataType::S32 | DataType::U32 => 2,
            _ => 1,
        }
    }

    /// The write action accepts every numeric type; `String` is read-only.
    pub fn is_writable(self) -> bool {
        !matches!(self, DataType::String)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::B16 => "B16",
            DataType::B32 => "B32",
            DataType::S16 => "S16",
            DataType::U16 => "U16",
            DataType::S32 => "S32",
            DataType::U32 => "U32",
            DataType::E16 => "E16",
            DataType::String => "String",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data type {0:?}")]
pub struct ParseDataTypeError(pub String);

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|data_type| data_type.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseDataTypeError(value.to_string()))
    }
}

/// Register table a request addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

impl FromStr for RegisterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "holding" => Ok(RegisterKind::Holding),
            "input" => Ok(RegisterKind::Input),
            other => Err(format!("unknown register kind {other:?}")),
        }
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Integer(value) => write!(f, "{value}"),
            RegisterValue::Text(value) => f.write_str(value),
        }
    }
}

/// A battery (or inverter) reachable on the Modbus link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Serial number the device reports; used to target schedule actions.
    pub isn: String,
    pub device_address: u8,
}
