//! Number formatting for re-serialized counters.

/// Maximum number of significant digits carried by a re-serialized counter.
const SIGNIFICANT_DIGITS: i32 = 15;

/// Formats a counter accumulator with at most fifteen significant digits.
///
/// This mirrors printf's `%.15g`: trailing zeros are trimmed, and scientific
/// notation (with a signed, two-digit-minimum exponent) takes over when the
/// decimal exponent drops below -4 or reaches the digit count. Shortest
/// round-trip formatting is not equivalent here; it would print `3` as `3.0`,
/// which is not a valid StatsD counter value.
pub(crate) fn format_compact(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }

    // One digit before the point plus fourteen after covers all fifteen.
    let scientific = format!("{:.14e}", value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= SIGNIFICANT_DIGITS {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        format!(
            "{}e{}{:02}",
            mantissa,
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    } else {
        let decimals = (SIGNIFICANT_DIGITS - 1 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", decimals, value);
        if fixed.contains('.') {
            fixed
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            fixed
        }
    }
}
