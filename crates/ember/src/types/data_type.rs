use std::fmt;
use std::str::FromStr;

use crate::error::EmberError;

/// Element kind of a native array.
///
/// Fixed for the lifetime of an array; casting produces a new array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    #[default]
    Float32,
    Float64,
    Float16,
    Uint8,
    Int8,
    Int32,
    Int64,
    Boolean,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn num_bytes(self) -> usize {
        match self {
            DataType::Float64 | DataType::Int64 => 8,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 => 2,
            DataType::Uint8 | DataType::Int8 | DataType::Boolean => 1,
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32 | DataType::Float64)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Uint8 | DataType::Int8 | DataType::Int32 | DataType::Int64
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Float16 => "float16",
            DataType::Uint8 => "uint8",
            DataType::Int8 => "int8",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DataType::Float32),
            "float64" | "f64" => Ok(DataType::Float64),
            "float16" | "f16" => Ok(DataType::Float16),
            "uint8" | "u8" => Ok(DataType::Uint8),
            "int8" | "i8" => Ok(DataType::Int8),
            "int32" | "i32" => Ok(DataType::Int32),
            "int64" | "i64" => Ok(DataType::Int64),
            "boolean" | "bool" => Ok(DataType::Boolean),
            _ => Err(EmberError::parse("data type", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_float32() {
        assert_eq!(DataType::default(), DataType::Float32);
    }

    #[test]
    fn test_widths() {
        assert_eq!(DataType::Float64.num_bytes(), 8);
        assert_eq!(DataType::Float16.num_bytes(), 2);
        assert_eq!(DataType::Boolean.num_bytes(), 1);
    }

    #[test]
    fn test_classification() {
        assert!(DataType::Float16.is_floating());
        assert!(!DataType::Int32.is_floating());
        assert!(DataType::Uint8.is_integer());
        assert!(!DataType::Boolean.is_integer());
    }

    #[test]
    fn test_parse_names() {
        for dtype in [
            DataType::Float32,
            DataType::Float64,
            DataType::Float16,
            DataType::Uint8,
            DataType::Int8,
            DataType::Int32,
            DataType::Int64,
            DataType::Boolean,
        ] {
            assert_eq!(dtype.to_string().parse::<DataType>().unwrap(), dtype);
        }
        assert_eq!("F32".parse::<DataType>().unwrap(), DataType::Float32);
        assert!("complex64".parse::<DataType>().is_err());
    }
}
