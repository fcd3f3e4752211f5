//! Size and duration strings as accepted on the command line: an integer
//! followed by an optional, case-insensitive unit (`30s`, `512MB`, `100`).

use crate::{Error, Result};

const K: u64 = 1024;

/// Split `"512MB"` into `(512, "mb")`.
fn value_and_unit(s: &str) -> Result<(u64, String)> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if idx == 0 {
        return Err(Error::invalid(s, "value is empty"));
    }
    let value = s[..idx]
        .parse::<u64>()
        .map_err(|_| Error::invalid(s, "value is not a valid num"))?;
    Ok((value, s[idx..].to_ascii_lowercase()))
}

fn scale(s: &str, value: u64, factor: u64) -> Result<u64> {
    value
        .checked_mul(factor)
        .ok_or_else(|| Error::invalid(s, "value overflows"))
}

/// Kilobytes; a bare number is KB. Units: kb, mb, gb, tb, pb.
pub fn parse_kbytes(s: &str) -> Result<u64> {
    let (v, unit) = value_and_unit(s)?;
    let factor = match unit.as_str() {
        "" | "kb" => 1,
        "mb" => K,
        "gb" => K * K,
        "tb" => K * K * K,
        "pb" => K * K * K * K,
        other => return Err(Error::invalid(s, format!("unit {} is not support", other))),
    };
    scale(s, v, factor)
}

/// Bytes; a bare number is bytes. Units: b, kb, mb, gb, tb.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let (v, unit) = value_and_unit(s)?;
    let factor = match unit.as_str() {
        "" | "b" => 1,
        "kb" => K,
        "mb" => K * K,
        "gb" => K * K * K,
        "tb" => K * K * K * K,
        other => return Err(Error::invalid(s, format!("unit {} is not support", other))),
    };
    scale(s, v, factor)
}

/// Whole seconds; a bare number is seconds. Units: s, m, h. Compound
/// durations such as `1h30m` are accepted too.
pub fn parse_time_seconds(s: &str) -> Result<u64> {
    let (v, unit) = value_and_unit(s)?;
    match unit.as_str() {
        "" | "s" => Ok(v),
        "m" => scale(s, v, 60),
        "h" => scale(s, v, 3600),
        _ => humantime::parse_duration(s.trim())
            .map(|d| d.as_secs())
            .map_err(|e| Error::invalid(s, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kbytes() {
        assert_eq!(parse_kbytes("100").unwrap(), 100);
        assert_eq!(parse_kbytes("100KB").unwrap(), 100);
        assert_eq!(parse_kbytes("2mb").unwrap(), 2048);
        assert_eq!(parse_kbytes("1GB").unwrap(), 1024 * 1024);
        assert!(parse_kbytes("1b").is_err());
        assert!(parse_kbytes("MB").is_err());
        assert!(parse_kbytes("").is_err());
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("10").unwrap(), 10);
        assert_eq!(parse_bytes("10b").unwrap(), 10);
        assert_eq!(parse_bytes("1kb").unwrap(), 1024);
        assert_eq!(parse_bytes("3MB").unwrap(), 3 * 1024 * 1024);
        assert!(parse_bytes("1pb").is_err());
        assert!(parse_bytes("99999999999999999999tb").is_err());
    }

    #[test]
    fn test_parse_time_seconds() {
        assert_eq!(parse_time_seconds("30").unwrap(), 30);
        assert_eq!(parse_time_seconds("30s").unwrap(), 30);
        assert_eq!(parse_time_seconds("5m").unwrap(), 300);
        assert_eq!(parse_time_seconds("2H").unwrap(), 7200);
        assert_eq!(parse_time_seconds("1h30m").unwrap(), 5400);
        assert!(parse_time_seconds("10x").is_err());
        assert!(parse_time_seconds("-1").is_err());
    }
}
