use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

const TRANSPORT_PREFIXES: &[&str] = &["whatsapp:", "sms:", "tel:"];

/// Phone-identified sender. Stored in normalized form: transport prefix removed,
/// formatting characters dropped, leading `+` kept.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let mut value = raw.trim();
        for prefix in TRANSPORT_PREFIXES {
            if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
                value = &value[prefix.len()..];
            }
        }

        let mut normalized = String::with_capacity(value.len());
        for (index, character) in value.trim().chars().enumerate() {
            match character {
                '+' if index == 0 => normalized.push('+'),
                '0'..='9' => normalized.push(character),
                ' ' | '-' | '(' | ')' | '.' => {}
                other => {
                    return Err(DomainError::InvariantViolation(format!(
                        "sender id contains unexpected character `{other}`"
                    )))
                }
            }
        }

        if !normalized.chars().any(|character| character.is_ascii_digit()) {
            return Err(DomainError::InvariantViolation(
                "sender id must contain at least one digit".to_string(),
            ));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::PrincipalId;

    #[test]
    fn strips_transport_prefix_and_formatting() {
        let id = PrincipalId::parse("whatsapp:+234 801-234 5678").expect("valid sender");
        assert_eq!(id.as_str(), "+2348012345678");
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let id = PrincipalId::parse("WhatsApp:+15550001111").expect("valid sender");
        assert_eq!(id.0, "+15550001111");
    }

    #[test]
    fn rejects_sender_without_digits() {
        assert!(PrincipalId::parse("whatsapp:").is_err());
        assert!(PrincipalId::parse("+abc").is_err());
    }
}
