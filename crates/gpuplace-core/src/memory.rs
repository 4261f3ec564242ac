//! Operator-facing memory specifications
//!
//! Accepts decimal (`8GB`), binary (`8GiB`, `8Gi`), short (`8G`, binary) and raw
//! byte counts (`8589934592`). Everything is normalized to bytes before it
//! reaches the allocation engine.

use serde::{Deserialize, Deserializer};

use crate::{GpuplaceError, GpuplaceResult};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

const KB: u64 = 1000;
const MB: u64 = 1000 * KB;
const GB: u64 = 1000 * MB;
const TB: u64 = 1000 * GB;

/// Parse a memory specification into bytes
pub fn parse_memory(spec: &str) -> GpuplaceResult<u64> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(GpuplaceError::InvalidMemory("empty specification".to_string()));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let unit = unit.trim();

    if number.is_empty() {
        return Err(GpuplaceError::InvalidMemory(spec.to_string()));
    }

    let multiplier = unit_multiplier(unit)
        .ok_or_else(|| GpuplaceError::InvalidMemory(format!("unknown unit '{}' in '{}'", unit, spec)))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| GpuplaceError::InvalidMemory(format!("'{}' overflows", spec)));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| GpuplaceError::InvalidMemory(spec.to_string()))?;
    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(GpuplaceError::InvalidMemory(format!("'{}' overflows", spec)));
    }
    Ok(bytes as u64)
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "ki" | "kib" => KIB,
        "m" | "mi" | "mib" => MIB,
        "g" | "gi" | "gib" => GIB,
        "t" | "ti" | "tib" => TIB,
        "kb" => KB,
        "mb" => MB,
        "gb" => GB,
        "tb" => TB,
        _ => return None,
    };
    Some(multiplier)
}

/// Render a byte count for humans, always in binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [("TiB", TIB), ("GiB", GIB), ("MiB", MIB), ("KiB", KIB)];
    for (name, size) in UNITS {
        if bytes >= size {
            return format!("{:.1} {}", bytes as f64 / size as f64, name);
        }
    }
    format!("{} B", bytes)
}

/// Deserialize a memory field given either as a byte count or a specification string
pub fn deserialize_memory<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Spec(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Spec(spec) => parse_memory(&spec).map_err(serde::de::Error::custom),
    }
}

/// Same as [`deserialize_memory`] for optional fields
pub fn deserialize_optional_memory<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_memory")] u64);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_units() {
        assert_eq!(parse_memory("8GB").unwrap(), 8_000_000_000);
        assert_eq!(parse_memory("512MB").unwrap(), 512_000_000);
    }

    #[test]
    fn test_parse_binary_units() {
        assert_eq!(parse_memory("8GiB").unwrap(), 8 * GIB);
        assert_eq!(parse_memory("16Gi").unwrap(), 16 * GIB);
        assert_eq!(parse_memory("1TiB").unwrap(), TIB);
    }

    #[test]
    fn test_short_units_are_binary() {
        assert_eq!(parse_memory("8G").unwrap(), 8 * GIB);
        assert_eq!(parse_memory("256m").unwrap(), 256 * MIB);
    }

    #[test]
    fn test_raw_bytes_and_whitespace() {
        assert_eq!(parse_memory("8589934592").unwrap(), 8 * GIB);
        assert_eq!(parse_memory("  4 GiB ").unwrap(), 4 * GIB);
        assert_eq!(parse_memory("100B").unwrap(), 100);
    }

    #[test]
    fn test_fractional_values() {
        assert_eq!(parse_memory("1.5GiB").unwrap(), GIB + GIB / 2);
    }

    #[test]
    fn test_invalid_specs() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("GB").is_err());
        assert!(parse_memory("8XB").is_err());
        assert!(parse_memory("1.2.3G").is_err());
        assert!(parse_memory("99999999999999999999T").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12 * GIB), "12.0 GiB");
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn test_deserialize_number_or_string() {
        #[derive(Deserialize)]
        struct Req {
            #[serde(deserialize_with = "deserialize_memory")]
            memory: u64,
        }

        let a: Req = serde_json::from_str(r#"{"memory": "8GiB"}"#).unwrap();
        let b: Req = serde_json::from_str(r#"{"memory": 8589934592}"#).unwrap();
        assert_eq!(a.memory, b.memory);

        let bad = serde_json::from_str::<Req>(r#"{"memory": "eight"}"#);
        assert!(bad.is_err());
    }
}
