//! Safaricom phone number normalization.

use crate::error::AppError;

/// Normalizes a Kenyan mobile number to the `2547XXXXXXXX` / `2541XXXXXXXX`
/// form the gateway expects.
///
/// Accepts `07…`, `01…`, `7…`, `+2547…` and `2547…`, ignoring spaces and
/// dashes.
pub fn normalize_msisdn(raw: &str) -> Result<String, AppError> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(raw));
    }

    let national = match digits.len() {
        12 if digits.starts_with("254") => &digits[3..],
        10 if digits.starts_with('0') => &digits[1..],
        9 => &digits[..],
        _ => return Err(invalid(raw)),
    };

    if !(national.starts_with('7') || national.starts_with('1')) {
        return Err(invalid(raw));
    }

    Ok(format!("254{}", national))
}

fn invalid(raw: &str) -> AppError {
    AppError::Validation(format!(
        "Invalid phone number: {}. Expected a Kenyan mobile number such as 0712345678",
        raw
    ))
}
