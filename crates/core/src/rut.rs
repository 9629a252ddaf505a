use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RutError {
    #[error("RUT is required")]
    Empty,
    #[error("RUT must include a hyphen before the check digit")]
    MissingHyphen,
    #[error("invalid RUT format '{0}', expected 12345678-9")]
    InvalidFormat(String),
}

/// Normalizes a Chilean RUT: trims, strips dots and uppercases the check digit.
///
/// The result is always `<digits>-<0-9|K>`.
pub fn normalize_rut(raw: &str) -> Result<String, RutError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '.' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    if cleaned.is_empty() {
        return Err(RutError::Empty);
    }

    let Some((body, check)) = cleaned.split_once('-') else {
        return Err(RutError::MissingHyphen);
    };

    let body_ok = !body.is_empty() && body.len() <= 9 && body.chars().all(|c| c.is_ascii_digit());
    let check_ok = check.len() == 1 && check.chars().all(|c| c.is_ascii_digit() || c == 'K');
    if !body_ok || !check_ok {
        return Err(RutError::InvalidFormat(cleaned));
    }

    Ok(cleaned)
}

/// Returns `true` when the input looks like a RUT rather than a QR payload.
pub fn looks_like_rut(raw: &str) -> bool {
    normalize_rut(raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dots_and_case() {
        assert_eq!(normalize_rut(" 12.345.678-k ").unwrap(), "12345678-K");
        assert_eq!(normalize_rut("7654321-0").unwrap(), "7654321-0");
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(normalize_rut("   "), Err(RutError::Empty));
        assert_eq!(normalize_rut("123456789"), Err(RutError::MissingHyphen));
        assert!(matches!(
            normalize_rut("12A45678-9"),
            Err(RutError::InvalidFormat(_))
        ));
        assert!(matches!(
            normalize_rut("12345678-99"),
            Err(RutError::InvalidFormat(_))
        ));
        assert!(matches!(normalize_rut("-9"), Err(RutError::InvalidFormat(_))));
    }

    #[test]
    fn distinguishes_qr_payloads() {
        assert!(looks_like_rut("11.111.111-1"));
        assert!(!looks_like_rut("ID:4|HASH:abc|RUT:11111111-1"));
    }
}
