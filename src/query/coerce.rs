//! Value coercion.
//!
//! Conversions are looked up by (source value kind, target kind) through a
//! [`ValueConverter`], so callers can swap in a stricter or broader policy
//! without touching the projector or the façade.

use crate::db::{Value, ValueKind};
use crate::error::{Result, RowpipeError};

/// Converts a value to the representation of a target kind.
///
/// Returns the converted value, or a message describing why it cannot be
/// converted. `Null` must be passed through unchanged.
pub trait ValueConverter: Send + Sync {
    fn convert(&self, value: Value, target: ValueKind) -> std::result::Result<Value, String>;
}

/// Default conversion policy: numeric widening, integral narrowing of floats,
/// string parsing of primitives and display formatting into text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardConverter;

impl ValueConverter for StandardConverter {
    fn convert(&self, value: Value, target: ValueKind) -> std::result::Result<Value, String> {
        if value.is_null() || value.kind() == target {
            return Ok(value);
        }

        match (value, target) {
            (Value::Int(i), ValueKind::Float) => Ok(Value::Float(i as f64)),
            (Value::Float(f), ValueKind::Int) => {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Ok(Value::Int(f as i64))
                } else {
                    Err(format!("{f} is not an integral value"))
                }
            }
            (Value::Bool(b), ValueKind::Int) => Ok(Value::Int(i64::from(b))),
            (Value::Int(i), ValueKind::Bool) => match i {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                _ => Err(format!("{i} is not a boolean")),
            },
            (Value::String(s), ValueKind::Int) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("'{s}' is not an integer")),
            (Value::String(s), ValueKind::Float) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("'{s}' is not a number")),
            (Value::String(s), ValueKind::Bool) => parse_bool(&s)
                .map(Value::Bool)
                .ok_or_else(|| format!("'{s}' is not a boolean")),
            (Value::Bytes(b), ValueKind::Text) => String::from_utf8(b)
                .map(Value::String)
                .map_err(|_| "bytes are not valid UTF-8".to_string()),
            (Value::String(s), ValueKind::Bytes) => Ok(Value::Bytes(s.into_bytes())),
            (other, ValueKind::Text) => Ok(Value::String(other.to_display_string())),
            (other, target) => Err(format!("cannot convert {} to {target}", other.kind())),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// A Rust type that can be built from a converted [`Value`].
pub trait FromValue: Sized {
    /// The kind a value is converted to before `from_value` is called.
    const KIND: ValueKind;

    /// Whether `Null` is a meaningful value for this type.
    const NULLABLE: bool = false;

    /// Builds the type from a value already converted to `KIND`.
    fn from_value(value: Value) -> std::result::Result<Self, String>;
}

fn unexpected(value: &Value, target: &str) -> String {
    match value {
        Value::Null => format!("NULL cannot be assigned to {target}"),
        other => format!("{} value cannot be assigned to {target}", other.kind()),
    }
}

impl FromValue for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(unexpected(&other, "i64")),
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                const KIND: ValueKind = ValueKind::Int;

                fn from_value(value: Value) -> std::result::Result<Self, String> {
                    match value {
                        Value::Int(i) => <$ty>::try_from(i)
                            .map_err(|_| format!("{i} is out of range for {}", stringify!($ty))),
                        other => Err(unexpected(&other, stringify!($ty))),
                    }
                }
            }
        )*
    };
}

narrow_int!(i32, i16, u32, u64);

impl FromValue for f64 {
    const KIND: ValueKind = ValueKind::Float;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(unexpected(&other, "f64")),
        }
    }
}

impl FromValue for f32 {
    const KIND: ValueKind = ValueKind::Float;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Float(f) => Ok(f as f32),
            other => Err(unexpected(&other, "f32")),
        }
    }
}

impl FromValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(unexpected(&other, "bool")),
        }
    }
}

impl FromValue for String {
    const KIND: ValueKind = ValueKind::Text;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(unexpected(&other, "String")),
        }
    }
}

impl FromValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(unexpected(&other, "bytes")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: ValueKind = T::KIND;
    const NULLABLE: bool = true;

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Converts `value` with `converter` and builds a `T` from it, returning the
/// failure message on error.
pub(crate) fn convert_to<T: FromValue>(
    value: Value,
    converter: &dyn ValueConverter,
) -> std::result::Result<T, String> {
    let converted = converter.convert(value, T::KIND)?;
    T::from_value(converted)
}

/// Coerces a single value to `T`, failing with `TypeMismatch`.
pub fn coerce<T: FromValue>(value: Value, converter: &dyn ValueConverter) -> Result<T> {
    let kind = value.kind();
    convert_to(value, converter).map_err(|msg| {
        RowpipeError::type_mismatch(format!(
            "cannot coerce {kind} to {}: {msg}",
            std::any::type_name::<T>()
        ))
    })
}
