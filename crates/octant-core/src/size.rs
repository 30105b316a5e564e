//! Memory size parsing.
//!
//! Sizes are a decimal magnitude followed by an optional unit: `K`, `M`, `G`
//! or `T` (binary multiples, case-insensitive, an optional `B`/`iB` suffix is
//! accepted). A magnitude followed by anything else is read as raw bytes of
//! the magnitude alone and a warning is logged; existing configurations rely
//! on this leniency.

use thiserror::Error;
use tracing::warn;

/// Size parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    /// The input has no leading digits.
    #[error("invalid size '{0}': expected a number with an optional K/M/G/T unit")]
    NoMagnitude(String),

    /// The value does not fit in 64 bits.
    #[error("size '{0}' overflows")]
    Overflow(String),
}

/// Parses a size such as `64M`, `2g`, `512KiB` or `4096`.
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(SizeError::NoMagnitude(input.to_string()));
    }

    let magnitude: u64 = digits
        .parse()
        .map_err(|_| SizeError::Overflow(input.to_string()))?;

    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => {
            warn!(
                input,
                unit = other,
                bytes = magnitude,
                "unrecognized size unit, using the numeric part as bytes"
            );
            0
        },
    };

    magnitude
        .checked_mul(1u64 << shift)
        .ok_or_else(|| SizeError::Overflow(input.to_string()))
}

/// Formats bytes with the largest exact binary unit, e.g. `128M`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u32, &str); 4] = [(40, "T"), (30, "G"), (20, "M"), (10, "K")];
    for (shift, unit) in UNITS {
        let base = 1u64 << shift;
        if bytes >= base && bytes % base == 0 {
            return format!("{}{unit}", bytes >> shift);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_size("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512KiB").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1T").unwrap(), 1u64 << 40);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size(" 64 M ").unwrap(), 64 * 1024 * 1024);
    }

    #[test]
    fn unknown_unit_falls_back_to_bytes() {
        assert_eq!(parse_size("100X").unwrap(), 100);
        assert_eq!(parse_size("7 parsecs").unwrap(), 7);
    }

    #[test]
    fn rejects_missing_magnitude() {
        assert!(matches!(parse_size("M"), Err(SizeError::NoMagnitude(_))));
        assert!(matches!(parse_size(""), Err(SizeError::NoMagnitude(_))));
        assert!(matches!(parse_size("-5M"), Err(SizeError::NoMagnitude(_))));
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            parse_size("99999999999T"),
            Err(SizeError::Overflow(_))
        ));
        assert!(matches!(
            parse_size("999999999999999999999999"),
            Err(SizeError::Overflow(_))
        ));
    }

    #[test]
    fn formats_exact_units() {
        assert_eq!(format_size(128 * 1024 * 1024), "128M");
        assert_eq!(format_size(4 * 1024 * 1024 * 1024), "4G");
        assert_eq!(format_size(1536), "1536");
        assert_eq!(format_size(0), "0");
    }
}
