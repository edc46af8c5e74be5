//! Field-level acceptance rules shared by the state deriver and the merger.
//!
//! A value is usable only when it is present, well-formed, and not one of the
//! reserved placeholder tokens that upstream systems write for "not provided".

use thiserror::Error;

use crate::domain::party::{IdentityDocument, IdentityKind};

pub const PLACEHOLDER_TOKENS: &[&str] = &[
    "unknown",
    "unknown address",
    "pending",
    "pending_nin",
    "completed",
    "n/a",
    "na",
    "null",
    "nil",
    "undefined",
    "tbd",
    "not provided",
];

pub const CAC_PREFIXES: &[&str] = &["RC", "BN"];

const NIN_LENGTH: usize = 11;
const MAX_NAME_CHARS: usize = 120;
/// Room for an ordinal ("John Doe 2nd") or a short business token ("3M");
/// anything longer is a number mistaken for a name.
const MAX_NAME_DIGITS: usize = 2;
const MAX_ADDRESS_CHARS: usize = 300;
const MAX_PREFERENCES_CHARS: usize = 1_000;
const MAX_ROLE_CHARS: usize = 60;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("value is empty")]
    Empty,
    #[error("value `{0}` is a reserved placeholder")]
    Placeholder(String),
    #[error("{0}")]
    Malformed(String),
}

pub fn is_placeholder(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    PLACEHOLDER_TOKENS.contains(&normalized.as_str())
}

/// Trimmed value when it is non-empty and not a placeholder.
pub fn meaningful(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty() && !is_placeholder(value))
}

fn usable(raw: &str) -> Result<&str, ValidationFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationFailure::Empty);
    }
    if is_placeholder(trimmed) {
        return Err(ValidationFailure::Placeholder(trimmed.to_string()));
    }
    Ok(trimmed)
}

fn compact(raw: &str) -> String {
    raw.chars().filter(|character| !matches!(character, ' ' | '-' | '/' | '.')).collect()
}

/// Classifies an identity document by format. Kind A (NIN) is exactly 11 digits;
/// kind B (CAC) starts with `RC` or `BN` and continues with digits.
pub fn classify_identity(raw: &str) -> Result<IdentityDocument, ValidationFailure> {
    let value = usable(raw)?;
    let compacted = compact(value).to_ascii_uppercase();

    if compacted.chars().all(|character| character.is_ascii_digit()) {
        if compacted.len() == NIN_LENGTH {
            return Ok(IdentityDocument::Nin(compacted));
        }
        return Err(ValidationFailure::Malformed(format!(
            "a NIN must be exactly {NIN_LENGTH} digits, got {}",
            compacted.len()
        )));
    }

    for prefix in CAC_PREFIXES {
        if let Some(rest) = compacted.strip_prefix(prefix) {
            if !rest.is_empty() && rest.chars().all(|character| character.is_ascii_digit()) {
                return Ok(IdentityDocument::Cac(compacted));
            }
            return Err(ValidationFailure::Malformed(format!(
                "a CAC number must be {prefix} followed by digits"
            )));
        }
    }

    Err(ValidationFailure::Malformed(
        "expected an 11-digit NIN or a CAC number starting with RC or BN".to_string(),
    ))
}

pub fn looks_like_identity_document(raw: &str) -> bool {
    classify_identity(raw).is_ok()
}

/// Whether a stored document still satisfies the format rules for its kind.
pub fn identity_is_valid(document: &IdentityDocument) -> bool {
    match classify_identity(document.value()) {
        Ok(classified) => classified.kind() == document.kind(),
        Err(_) => false,
    }
}

pub fn accept_name(raw: &str) -> Result<String, ValidationFailure> {
    let value = usable(raw)?;
    if !value.chars().any(char::is_alphabetic) {
        return Err(ValidationFailure::Malformed("a name must contain letters".to_string()));
    }
    if looks_like_identity_document(value) {
        return Err(ValidationFailure::Malformed(
            "value looks like an identity document, not a name".to_string(),
        ));
    }
    if value.chars().filter(char::is_ascii_digit).count() > MAX_NAME_DIGITS {
        return Err(ValidationFailure::Malformed("a name must not contain numbers".to_string()));
    }
    if value.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationFailure::Malformed(format!(
            "a name must be at most {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(collapse_whitespace(value))
}

pub fn accept_address(raw: &str) -> Result<String, ValidationFailure> {
    let value = usable(raw)?;
    if looks_like_identity_document(value) {
        return Err(ValidationFailure::Malformed(
            "value looks like an identity document, not an address".to_string(),
        ));
    }
    if !value.chars().any(char::is_alphabetic) {
        return Err(ValidationFailure::Malformed(
            "an address must contain a street or area name".to_string(),
        ));
    }
    if value.chars().count() > MAX_ADDRESS_CHARS {
        return Err(ValidationFailure::Malformed(format!(
            "an address must be at most {MAX_ADDRESS_CHARS} characters"
        )));
    }
    Ok(collapse_whitespace(value))
}

pub fn accept_preferences(raw: &str) -> Result<String, ValidationFailure> {
    let value = usable(raw)?;
    if value.chars().count() > MAX_PREFERENCES_CHARS {
        return Err(ValidationFailure::Malformed(format!(
            "preferences must be at most {MAX_PREFERENCES_CHARS} characters"
        )));
    }
    Ok(value.to_string())
}

/// Role at time of linking. Optional; unusable values are dropped silently.
pub fn accept_role(raw: Option<&str>) -> Option<String> {
    let value = meaningful(raw)?;
    if value.chars().count() > MAX_ROLE_CHARS || !value.chars().any(char::is_alphabetic) {
        return None;
    }
    Some(value.to_ascii_lowercase())
}

pub fn identity_kind_hint(kind: IdentityKind) -> &'static str {
    match kind {
        IdentityKind::Nin => "11 digits",
        IdentityKind::Cac => "RC or BN followed by digits",
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
