// Copyright 2025-2026 CEMAXECUTER LLC

//! Frequency-token parsing and the default RTP stream identifier derived
//! from a token's digits.

/// Parse a frequency token with engineering suffix support.
///
/// Accepted forms: `7200000` (Hz), `7200k`, `7.2M`, `7M2` (the suffix acts
/// as the decimal point), `1G296` and the lowercase equivalents. Returns
/// `None` for anything unparseable or negative.
pub fn parse_frequency(token: &str) -> Option<f64> {
    let tok = token.trim();
    if tok.is_empty() {
        return None;
    }
    let mult_for = |c: char| match c.to_ascii_lowercase() {
        'k' => Some(1e3),
        'm' => Some(1e6),
        'g' => Some(1e9),
        _ => None,
    };

    let suffix_pos = tok.char_indices().find(|&(_, c)| mult_for(c).is_some());
    let value = match suffix_pos {
        None => tok.parse::<f64>().ok()?,
        Some((i, c)) => {
            let mult = mult_for(c)?;
            let integral = &tok[..i];
            let fraction = &tok[i + c.len_utf8()..];
            if fraction.is_empty() {
                // Plain scaled value: 7200k, 7.2M
                if integral.is_empty() {
                    return None;
                }
                integral.parse::<f64>().ok()? * mult
            } else {
                // Suffix-as-decimal-point: 7M2 is 7.2 MHz
                let integral = if integral.is_empty() { "0" } else { integral };
                format!("{}.{}", integral, fraction).parse::<f64>().ok()? * mult
            }
        }
    };
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Default SSRC for a frequency token: the decimal-digit subsequence folded
/// into a u32 with wrap on overflow. `7200000` gives 7200000; `7.2M` gives
/// 72. Zero means no usable digits (or an explicit zero) and is reserved.
pub fn ssrc_from_token(token: &str) -> u32 {
    let mut ssrc: u32 = 0;
    for c in token.chars() {
        if let Some(d) = c.to_digit(10) {
            ssrc = ssrc.wrapping_mul(10).wrapping_add(d);
        }
    }
    ssrc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_hz() {
        assert_eq!(parse_frequency("7200000"), Some(7_200_000.0));
        assert_eq!(parse_frequency("0"), Some(0.0));
    }

    #[test]
    fn test_engineering_suffixes() {
        assert_eq!(parse_frequency("7200k"), Some(7_200_000.0));
        assert_eq!(parse_frequency("7.2M"), Some(7_200_000.0));
        assert_eq!(parse_frequency("7.2m"), Some(7_200_000.0));
        assert_eq!(parse_frequency("1.296G"), Some(1_296_000_000.0));
    }

    #[test]
    fn test_suffix_as_decimal_point() {
        assert_eq!(parse_frequency("7M2"), Some(7_200_000.0));
        assert_eq!(parse_frequency("146M52"), Some(146_520_000.0));
        assert_eq!(parse_frequency("k5"), Some(500.0));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_frequency(""), None);
        assert_eq!(parse_frequency("khz"), None);
        assert_eq!(parse_frequency("7.2X"), None);
        assert_eq!(parse_frequency("-7200"), None);
        assert_eq!(parse_frequency("7M2M"), None);
    }

    #[test]
    fn test_ssrc_digit_fold() {
        assert_eq!(ssrc_from_token("7200000"), 7_200_000);
        assert_eq!(ssrc_from_token("7.2M"), 72);
        assert_eq!(ssrc_from_token("146M52"), 14_652);
        assert_eq!(ssrc_from_token("no digits"), 0);
    }

    #[test]
    fn test_ssrc_wraps_on_overflow() {
        // 99999999999 mod 2^32, digit by digit
        let mut expect: u32 = 0;
        for _ in 0..11 {
            expect = expect.wrapping_mul(10).wrapping_add(9);
        }
        assert_eq!(ssrc_from_token("99999999999"), expect);
    }
}
