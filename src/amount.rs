//! Accounting-style number parsing
//!
//! Financial tables print negatives in parentheses and zero as a dash.

const DASHES: &[&str] = &["—", "–", "-", "−"];

const SCALE_PHRASES: &[&str] = &[
    "in thousands",
    "in millions",
    "in billions",
    "thousands of",
    "millions of",
    "billions of",
    "000s",
    "000's",
];

/// Parse a cell like `$(1,234.5)` into `-1234.5`. Returns `None` for
/// anything that is not a single figure.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if DASHES.contains(&text) {
        return Some(0.0);
    }

    let mut negative = false;
    let mut body = text
        .trim_start_matches(|c: char| matches!(c, '$' | '€' | '£') || c.is_whitespace());

    if body.starts_with('(') && body.ends_with(')') && body.len() >= 2 {
        negative = true;
        body = &body[1..body.len() - 1];
    }

    let mut cleaned = String::with_capacity(body.len());
    for ch in body.chars() {
        match ch {
            '0'..='9' | '.' => cleaned.push(ch),
            ',' | '$' | '€' | '£' | ' ' | '\u{a0}' => {}
            '-' | '−' if cleaned.is_empty() && !negative => negative = true,
            // trailing percent or footnote markers are not figures
            _ => return None,
        }
    }

    if cleaned.is_empty() || cleaned == "." {
        return None;
    }

    let value: f64 = cleaned.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Whether source text shows signs of rounded figures: decimal amounts or
/// a statement that values are presented in a larger unit.
pub fn shows_rounding(text: &str) -> bool {
    let lower = text.to_lowercase();
    if SCALE_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }

    let bytes = lower.as_bytes();
    bytes.windows(3).any(|w| {
        w[0].is_ascii_digit() && w[1] == b'.' && w[2].is_ascii_digit()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting_formats() {
        assert_eq!(parse_amount("1,500,000"), Some(1_500_000.0));
        assert_eq!(parse_amount("(1,500,000)"), Some(-1_500_000.0));
        assert_eq!(parse_amount("$ (2.5)"), Some(-2.5));
        assert_eq!(parse_amount("-42"), Some(-42.0));
        assert_eq!(parse_amount("—"), Some(0.0));
        assert_eq!(parse_amount("$120"), Some(120.0));
    }

    #[test]
    fn test_non_figures_rejected() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("Revenue"), None);
        assert_eq!(parse_amount("12%"), None);
        assert_eq!(parse_amount("2023-12-31"), None);
        assert_eq!(parse_amount("."), None);
    }

    #[test]
    fn test_rounding_detection() {
        assert!(shows_rounding("(in millions, except per share data)"));
        assert!(shows_rounding("| Revenue | 1,234.56 |"));
        assert!(!shows_rounding("| Revenue | 1,000 |\n| COGS | (400) |"));
    }
}
