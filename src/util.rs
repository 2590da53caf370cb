//! Small shared helpers: strict number parsing and reply formatting

/// Strict base-10 i64 parser for bytestrings.
///
/// Stricter than `str::parse`: rejects empty input, a lone minus, leading
/// zeros ("007"), an explicit plus sign, and anything with trailing bytes.
/// A value only counts as an integer if printing it back yields the exact
/// input, which is what makes integer-encoded storage lossless.
pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    if digits[0] == b'0' && digits.len() > 1 {
        return None;
    }
    if negative && digits == b"0" {
        return None;
    }
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?;
        if negative {
            value = value.checked_sub((b - b'0') as i64)?;
        } else {
            value = value.checked_add((b - b'0') as i64)?;
        }
    }
    Some(value)
}

/// Parse a float the way command arguments require: finite, no NaN, and
/// not empty. Accepts the usual decimal and exponent forms.
pub fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    if s.is_empty() || s.trim() != s {
        return None;
    }
    let v: f64 = s.parse().ok()?;
    if v.is_nan() {
        return None;
    }
    Some(v)
}

/// Format a float for replies: plain decimal with trailing zeros trimmed,
/// so `3.0` prints as `3` and `10.5` stays `10.5`.
pub fn format_f64(v: f64) -> Vec<u8> {
    if v == v.trunc() && v.abs() < 1e17 {
        return format!("{}", v as i64).into_bytes();
    }
    // Shortest representation that round-trips.
    format!("{v}").into_bytes()
}
