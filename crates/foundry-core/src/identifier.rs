//! Contact identifier canonicalization.
//!
//! Phone numbers are canonicalized to E.164 and emails to lower case. A
//! handful of formatting heuristics are tried before an identifier is
//! rejected, so `(555) 123-4567` and `+1 555.123.4567` land on the same
//! handle.

use serde::{Deserialize, Serialize};

use crate::FoundryError;

const MIN_E164_DIGITS: usize = 8;
const MAX_E164_DIGITS: usize = 15;
const PHONE_SEPARATORS: [char; 5] = [' ', '-', '.', '(', ')'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Phone,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NormalizedIdentifier {
    pub kind: IdentifierKind,
    /// Canonical form stored in `handle.id`.
    pub canonical: String,
    /// Caller spelling stored in `handle.uncanonicalized_id`.
    pub original: String,
}

/// Normalize a phone number or email/account handle.
///
/// # Errors
/// Returns [`FoundryError::InvalidIdentifier`] when no heuristic produces a
/// well-formed identifier.
pub fn normalize_identifier(raw: &str) -> Result<NormalizedIdentifier, FoundryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw, "identifier is empty"));
    }

    let canonical = if trimmed.contains('@') {
        normalize_email(trimmed).map_err(|reason| invalid(raw, reason))?
    } else {
        normalize_phone(trimmed).map_err(|reason| invalid(raw, reason))?
    };

    let kind = if canonical.contains('@') { IdentifierKind::Email } else { IdentifierKind::Phone };
    Ok(NormalizedIdentifier { kind, canonical, original: trimmed.to_string() })
}

fn normalize_email(value: &str) -> Result<String, &'static str> {
    let lowered = value.to_lowercase();
    let mut parts = lowered.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("email must contain exactly one '@'");
    };
    if local.is_empty() {
        return Err("email local part is empty");
    }
    if local.chars().any(char::is_whitespace) || domain.chars().any(char::is_whitespace) {
        return Err("email contains whitespace");
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return Err("email domain has no '.'");
    };
    if host.is_empty() || tld.is_empty() {
        return Err("email domain is malformed");
    }
    Ok(lowered)
}

fn normalize_phone(value: &str) -> Result<String, &'static str> {
    let compact: String = value.chars().filter(|c| !PHONE_SEPARATORS.contains(c)).collect();
    let (has_plus, digits) = match compact.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, compact.as_str()),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err("phone number must contain only digits and separators");
    }

    let candidate = if has_plus {
        digits.to_string()
    } else if let Some(international) = digits.strip_prefix("00") {
        international.to_string()
    } else if digits.len() == 10 {
        format!("1{digits}")
    } else if digits.len() == 11 && digits.starts_with('1') {
        digits.to_string()
    } else {
        return Err("phone number is not in a recognized national or E.164 format");
    };

    if !(MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&candidate.len()) {
        return Err("phone number has the wrong number of digits for E.164");
    }
    if candidate.starts_with('0') {
        return Err("E.164 country code cannot start with 0");
    }
    Ok(format!("+{candidate}"))
}

fn invalid(value: &str, reason: &str) -> FoundryError {
    FoundryError::InvalidIdentifier { value: value.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(raw: &str) -> String {
        normalize_identifier(raw)
            .unwrap_or_else(|err| panic!("{raw} should normalize: {err}"))
            .canonical
    }

    #[test]
    fn phone_spellings_converge_on_e164() {
        for raw in [
            "+15551234567",
            "(555) 123-4567",
            "555.123.4567",
            "1 555 123 4567",
            "+1 (555) 123-4567",
        ] {
            assert_eq!(canonical(raw), "+15551234567", "{raw}");
        }
    }

    #[test]
    fn international_prefix_is_rewritten() {
        assert_eq!(canonical("0044 20 7946 0958"), "+442079460958");
        assert_eq!(canonical("+44 20 7946 0958"), "+442079460958");
    }

    #[test]
    fn emails_are_lowercased_and_trimmed() -> Result<(), FoundryError> {
        let normalized = normalize_identifier("  Alice.Smith@Example.COM ")?;
        assert_eq!(normalized.kind, IdentifierKind::Email);
        assert_eq!(normalized.canonical, "alice.smith@example.com");
        assert_eq!(normalized.original, "Alice.Smith@Example.COM");
        Ok(())
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        for raw in [
            "",
            "   ",
            "12345",
            "+0123456789",
            "555-CALL-NOW",
            "a@b",
            "@example.com",
            "a@@example.com",
            "+1234567890123456",
        ] {
            assert!(
                matches!(normalize_identifier(raw), Err(FoundryError::InvalidIdentifier { .. })),
                "{raw} should be rejected"
            );
        }
    }
}
