//! Small formatting and validation helpers shared across the daemon.
//!
//! Grounded on `alpenhorn/common/util.py` and `alpenhorn/common/config.py`
//! (`get_bytes`) in the original implementation.

use crate::error::{Error, Result};

/// Format a byte count using binary SI prefixes, matching the original
/// `pretty_bytes()`: three significant digits, shifting decimal places as
/// the value grows within each band.
pub fn pretty_bytes(num: Option<i64>) -> String {
    let Some(num) = num else {
        return "-".to_string();
    };

    let sign = if num < 0 { "-" } else { "" };
    let mut num = num.unsigned_abs() as f64;

    if num < 2f64.powi(10) {
        return format!("{sign}{} B", num as u64);
    }

    const PREFIXES: &[char] = &['k', 'M', 'G', 'T', 'P', 'E'];
    for (x, p) in PREFIXES.iter().enumerate() {
        if num < 2f64.powi((2 + x as i32) * 10) {
            num /= 2f64.powi((1 + x as i32) * 10);
            return if num >= 100.0 {
                format!("{sign}{num:.1} {p}iB")
            } else if num >= 10.0 {
                format!("{sign}{num:.2} {p}iB")
            } else {
                format!("{sign}{num:.3} {p}iB")
            };
        }
    }

    // Overflowed every band: just print the raw (shifted) value.
    format!("{sign}{num} B")
}

/// Format a duration in seconds the way the original `pretty_deltat()` does:
/// "x.xs" under a minute, "MmSSs" under an hour, "HhMMmSSs" otherwise.
/// Negative deltas are printed verbatim as "x.xs".
pub fn pretty_deltat(seconds: f64) -> String {
    if seconds < 0.0 {
        return format!("{seconds:.1}s");
    }

    let hours = (seconds / 3600.0).floor();
    let rem = seconds - hours * 3600.0;
    let minutes = (rem / 60.0).floor();
    let secs = rem - minutes * 60.0;

    if hours > 0.0 {
        format!("{}h{:02}m{:02}s", hours as u64, minutes as u64, secs as u64)
    } else if minutes > 0.0 {
        format!("{}m{:02}s", minutes as u64, secs as u64)
    } else {
        format!("{secs:.1}s")
    }
}

/// Parse a byte-size string like "1k", "1.5k", "4M", "512" (base-1024
/// k/M/G suffixes). Rejects empty strings, non-positive values, and any
/// other suffix (e.g. "T").
pub fn parse_bytesize(value: &str) -> Result<i64> {
    let (mantissa, exponent) = if let Some(stripped) = value.strip_suffix('k') {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('M') {
        (stripped, 2)
    } else if let Some(stripped) = value.strip_suffix('G') {
        (stripped, 3)
    } else {
        (value, 0)
    };

    let mantissa: f64 = mantissa
        .parse()
        .map_err(|_| Error::InvalidByteSize(value.to_string()))?;

    let result = mantissa * 1024f64.powi(exponent);
    if result <= 0.0 || !result.is_finite() {
        return Err(Error::InvalidByteSize(value.to_string()));
    }

    Ok(result as i64)
}

/// Is `name` invalid as an import path (and thus as an Acquisition or File
/// name)? Returns `Some(reason)` if rejected, `None` if valid.
///
/// Grounded on `alpenhorn/common/util.py::invalid_import_path`.
pub fn invalid_import_path(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty path");
    }
    if name == "." || name == ".." {
        return Some("invalid path");
    }
    if name.starts_with('/') || name.starts_with("./") || name.starts_with("../") {
        return Some("invalid start");
    }
    if name.ends_with('/') || name.ends_with("/.") || name.ends_with("/..") {
        return Some("invalid end");
    }
    if name.contains("//") {
        return Some("repeated /");
    }
    if name.contains("/./") {
        return Some("invalid path element \".\"");
    }
    if name.contains("/../") {
        return Some("invalid path element \"..\"");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_bytes_bands() {
        assert_eq!(pretty_bytes(None), "-");
        assert_eq!(pretty_bytes(Some(0)), "0 B");
        assert_eq!(pretty_bytes(Some(1023)), "1023 B");
        assert_eq!(pretty_bytes(Some(1024)), "1.000 kiB");
        assert_eq!(pretty_bytes(Some(-1024)), "-1.000 kiB");
    }

    #[test]
    fn pretty_deltat_bands() {
        assert_eq!(pretty_deltat(5.25), "5.3s");
        assert_eq!(pretty_deltat(65.0), "1m05s");
        assert_eq!(pretty_deltat(3665.0), "1h01m05s");
        assert_eq!(pretty_deltat(-1.5), "-1.5s");
    }

    #[test]
    fn bytesize_parsing() {
        assert_eq!(parse_bytesize("1k").unwrap(), 1024);
        assert_eq!(parse_bytesize("1.5k").unwrap(), 1536);
        assert_eq!(parse_bytesize("4M").unwrap(), 4 * 2i64.pow(20));
        assert!(parse_bytesize("").is_err());
        assert!(parse_bytesize("0").is_err());
        assert!(parse_bytesize("3.3T").is_err());
    }

    #[test]
    fn path_grammar() {
        for bad in ["", ".", "..", "/x", "./x", "../x", "x/", "x/.", "x/.."] {
            assert!(invalid_import_path(bad).is_some(), "{bad:?} should be rejected");
        }
        for bad in ["x//y", "x/./y", "x/../y"] {
            assert!(invalid_import_path(bad).is_some(), "{bad:?} should be rejected");
        }
        for good in ["x", "x/y", "x/.../y"] {
            assert!(invalid_import_path(good).is_none(), "{good:?} should be accepted");
        }
    }
}
