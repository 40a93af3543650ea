//! Raw column values and their conversion to metric values and labels.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A column value as produced by the row source.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    Text(String),
    /// A column type with no conversion; carries the server's type name.
    Unsupported(String),
}

impl RawValue {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Unsupported(name) => name,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("could not parse {value:?} as a number")]
    NotANumber { value: String },

    #[error("unknown type {type_name}")]
    UnknownType { type_name: String },

    #[error("could not use {type_name} value of column {column:?} as a metric name")]
    MetricName { column: String, type_name: String },
}

fn parse_float(s: &str) -> Result<f64, ConversionError> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| ConversionError::NotANumber {
            value: s.to_string(),
        })
}

/// Convert a raw value to a metric value. `Null` becomes NaN.
///
/// # Errors
///
/// Returns an error for text that is not a number and for unsupported types.
#[allow(clippy::cast_precision_loss)]
pub fn to_f64(value: &RawValue) -> Result<f64, ConversionError> {
    match value {
        RawValue::Null => Ok(f64::NAN),
        RawValue::Int(v) => Ok(*v as f64),
        RawValue::Float(v) => Ok(*v),
        RawValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        RawValue::Timestamp(ts) => Ok(ts.timestamp() as f64),
        RawValue::Bytes(b) => parse_float(&String::from_utf8_lossy(b)),
        RawValue::Text(s) => parse_float(s),
        RawValue::Unsupported(name) => Err(ConversionError::UnknownType {
            type_name: name.clone(),
        }),
    }
}

/// Convert a raw value to a label value. `Null` becomes the empty string;
/// `None` means the value has no string form.
#[must_use]
pub fn to_label(value: &RawValue) -> Option<String> {
    match value {
        RawValue::Null => Some(String::new()),
        RawValue::Int(v) => Some(v.to_string()),
        RawValue::Float(v) => Some(v.to_string()),
        RawValue::Bool(v) => Some(v.to_string()),
        RawValue::Timestamp(ts) => Some(ts.timestamp().to_string()),
        RawValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        RawValue::Text(s) => Some(s.clone()),
        RawValue::Unsupported(_) => None,
    }
}
