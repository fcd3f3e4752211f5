//! Lenient field decoding for fault arguments. Values given on the command
//! line as `-a key=value` arrive as strings, so numeric fields accept a
//! JSON number, a numeric string, or an empty string / `null` for unset.

use std::fmt::Display;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

fn parse_opt<T>(v: Value) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n.to_string().parse::<T>().map(Some).map_err(|e| e.to_string()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("{:?}: {}", s, e)),
        other => Err(format!("expected a number, got {}", other)),
    }
}

pub fn opt_num<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    parse_opt(Value::deserialize(d)?).map_err(de::Error::custom)
}

/// Strings that may have been given as bare JSON numbers.
pub fn string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected a string, got {}", other))),
    }
}
