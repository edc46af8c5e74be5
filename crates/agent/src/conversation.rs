use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use propline_core::flows::IntakeStep;
use propline_core::reconcile::ExtractionDelta;

use crate::llm::{CompletionRequest, LlmClient};

const NAME_PREFIXES: &[&str] =
    &["my name is", "my full name is", "name is", "name:", "i am", "i'm", "im", "this is", "it's", "its"];
const ADDRESS_PREFIXES: &[&str] = &[
    "the address is",
    "address is",
    "address:",
    "my address is",
    "the property is at",
    "property is at",
    "it is at",
    "it's at",
    "located at",
    "at",
];
const IDENTITY_PREFIXES: &[&str] =
    &["my nin is", "nin is", "nin:", "nin", "my cac is", "cac number is", "cac:", "cac", "rc number is"];
const ROLE_WORDS: &[&str] =
    &["owner", "agent", "landlord", "landlady", "caretaker", "manager", "developer", "tenant"];

/// Deterministic stand-in for the extraction capability. It reads only the
/// field the current step asks for and answers in the same strict JSON shape a
/// hosted model is told to produce.
#[derive(Clone, Debug, Default)]
pub struct RuleBasedExtractor;

impl RuleBasedExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, step: IntakeStep, text: &str) -> ExtractionDelta {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return ExtractionDelta::default();
        }

        match step {
            IntakeStep::Name => ExtractionDelta {
                name: Some(strip_prefixes(&normalized, NAME_PREFIXES).to_string()),
                ..ExtractionDelta::default()
            },
            IntakeStep::Identity => ExtractionDelta {
                identity_document: Some(extract_identity(&normalized)),
                ..ExtractionDelta::default()
            },
            IntakeStep::Address => {
                let (address, role) = split_address_and_role(&normalized);
                ExtractionDelta { address: Some(address), role, ..ExtractionDelta::default() }
            }
            IntakeStep::Preferences => {
                ExtractionDelta { preferences: Some(normalized), ..ExtractionDelta::default() }
            }
            IntakeStep::Done => ExtractionDelta::default(),
        }
    }
}

#[async_trait]
impl LlmClient for RuleBasedExtractor {
    fn provider(&self) -> &'static str {
        "rules"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let delta = self.extract(request.step, &request.user);
        Ok(json!({
            "name": delta.name,
            "identity_document": delta.identity_document,
            "address": delta.address,
            "role": delta.role,
            "preferences": delta.preferences,
            "reply": null,
        })
        .to_string())
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_prefixes<'a>(text: &'a str, prefixes: &[&str]) -> &'a str {
    let lowered = text.to_ascii_lowercase();
    for prefix in prefixes {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with(&[' ', ':'][..]) {
                let offset = text.len() - rest.len();
                let remainder = text[offset..].trim_start_matches(&[' ', ':'][..]).trim();
                if !remainder.is_empty() {
                    return remainder;
                }
            }
        }
    }
    text
}

/// Picks the first token that looks like a NIN or CAC number. Falls back to the
/// whole message so format validation can explain what is wrong with it.
fn extract_identity(text: &str) -> String {
    let digits_only: String =
        text.chars().filter(|character| !matches!(character, ' ' | '-')).collect();
    if digits_only.len() == 11 && digits_only.chars().all(|character| character.is_ascii_digit()) {
        return digits_only;
    }

    for token in text.split(|character: char| character.is_whitespace() || character == ',') {
        let token = token.trim_matches(|character: char| !character.is_ascii_alphanumeric());
        let upper = token.to_ascii_uppercase();
        let digits = token.chars().filter(char::is_ascii_digit).count();
        if digits == token.len() && digits == 11 {
            return token.to_string();
        }
        if (upper.starts_with("RC") || upper.starts_with("BN")) && digits > 0 && digits + 2 == token.len()
        {
            return upper;
        }
    }

    strip_prefixes(text, IDENTITY_PREFIXES).to_string()
}

/// Splits "14 Marina Rd, Lagos, I'm the owner" into the address and a role.
fn split_address_and_role(text: &str) -> (String, Option<String>) {
    let mut role = None;
    let mut kept = Vec::new();

    for segment in text.split(&[',', ';', '\n'][..]) {
        let segment = segment.trim().trim_end_matches('.');
        if segment.is_empty() {
            continue;
        }
        let lowered = segment.to_ascii_lowercase();
        let mentioned = ROLE_WORDS
            .iter()
            .find(|word| lowered.split_whitespace().any(|token| token == **word));
        if let Some(word) = mentioned {
            if !segment.chars().any(|character| character.is_ascii_digit()) {
                role.get_or_insert_with(|| (*word).to_string());
                continue;
            }
        }
        kept.push(segment);
    }

    let joined = kept.join(", ");
    (strip_prefixes(&joined, ADDRESS_PREFIXES).to_string(), role)
}
