//! Reconciliation of an extracted delta into the prior intake state.
//!
//! Only the active step's fields are considered. Everything else in the delta is
//! reported back as ignored so the caller can log it, but never written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::party::PartyRecord;
use crate::domain::property::PropertyRecord;
use crate::flows::steps::{IntakeSnapshot, IntakeStep};
use crate::validation::{
    accept_address, accept_name, accept_preferences, accept_role, classify_identity,
    ValidationFailure,
};

/// Structured fields pulled out of one inbound message. Every field is optional;
/// a missing field means "nothing said about it".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionDelta {
    pub name: Option<String>,
    pub identity_document: Option<String>,
    pub address: Option<String>,
    pub role: Option<String>,
    pub preferences: Option<String>,
}

impl ExtractionDelta {
    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }

    fn present(&self) -> Vec<(DeltaField, &str)> {
        [
            (DeltaField::Name, self.name.as_deref()),
            (DeltaField::IdentityDocument, self.identity_document.as_deref()),
            (DeltaField::Address, self.address.as_deref()),
            (DeltaField::Role, self.role.as_deref()),
            (DeltaField::Preferences, self.preferences.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value.map(str::trim).filter(|value| !value.is_empty()).map(|value| (field, value))
        })
        .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaField {
    Name,
    IdentityDocument,
    Address,
    Role,
    Preferences,
}

impl DeltaField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::IdentityDocument => "identity_document",
            Self::Address => "address",
            Self::Role => "role",
            Self::Preferences => "preferences",
        }
    }

    fn belongs_to(&self, step: IntakeStep) -> bool {
        matches!(
            (self, step),
            (Self::Name, IntakeStep::Name)
                | (Self::IdentityDocument, IntakeStep::Identity)
                | (Self::Address, IntakeStep::Address)
                | (Self::Role, IntakeStep::Address)
                | (Self::Preferences, IntakeStep::Preferences)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    NotActiveStep(IntakeStep),
    Validation(ValidationFailure),
    NoActiveProperty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedField {
    pub field: DeltaField,
    pub reason: RejectionReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyChange {
    /// Create a property for the party, or reopen the one already registered
    /// under the same normalized address.
    Open { address: String, role: Option<String> },
    /// Targeted update of an existing record by id.
    Update(PropertyRecord),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub party: PartyRecord,
    pub property: Option<PropertyChange>,
    pub accepted: Vec<DeltaField>,
    pub rejected: Vec<RejectedField>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.accepted.is_empty()
    }

    /// First validation failure on the active step's own field, if any.
    pub fn validation_failure(&self) -> Option<(DeltaField, &ValidationFailure)> {
        self.rejected.iter().find_map(|rejected| match &rejected.reason {
            RejectionReason::Validation(failure) => Some((rejected.field, failure)),
            _ => None,
        })
    }

    fn reject(&mut self, field: DeltaField, failure: ValidationFailure) {
        self.rejected.push(RejectedField { field, reason: RejectionReason::Validation(failure) });
    }
}

pub fn merge(
    prior: &IntakeSnapshot,
    delta: &ExtractionDelta,
    step: IntakeStep,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        party: prior.party.clone(),
        property: None,
        accepted: Vec::new(),
        rejected: Vec::new(),
    };

    for (field, value) in delta.present() {
        if !field.belongs_to(step) {
            outcome
                .rejected
                .push(RejectedField { field, reason: RejectionReason::NotActiveStep(step) });
            continue;
        }

        match field {
            DeltaField::Name => match accept_name(value) {
                Ok(name) => {
                    outcome.party.name = Some(name);
                    outcome.party.name_confirmed_cycle = outcome.party.registration_cycle;
                    outcome.accepted.push(field);
                }
                Err(failure) => outcome.reject(field, failure),
            },
            DeltaField::IdentityDocument => match classify_identity(value) {
                Ok(document) => {
                    outcome.party.identity = Some(document);
                    outcome.accepted.push(field);
                }
                Err(failure) => outcome.reject(field, failure),
            },
            DeltaField::Address => match accept_address(value) {
                Ok(address) => {
                    outcome.property = Some(PropertyChange::Open {
                        address,
                        role: accept_role(delta.role.as_deref()),
                    });
                    outcome.accepted.push(field);
                }
                Err(failure) => outcome.reject(field, failure),
            },
            // Captured together with the address.
            DeltaField::Role => {}
            DeltaField::Preferences => {
                let Some(active) = prior.active_property.as_ref() else {
                    outcome
                        .rejected
                        .push(RejectedField { field, reason: RejectionReason::NoActiveProperty });
                    continue;
                };
                match accept_preferences(value) {
                    Ok(preferences) => {
                        let mut property = active.clone();
                        property.status = property.status_after_preferences();
                        property.preferences = Some(preferences.clone());
                        property.updated_at = now;
                        outcome.party.preferences = Some(preferences);
                        outcome.property = Some(PropertyChange::Update(property));
                        outcome.accepted.push(field);
                    }
                    Err(failure) => outcome.reject(field, failure),
                }
            }
        }
    }

    if !outcome.accepted.is_empty() {
        outcome.party.updated_at = now;
    }
    outcome
}
