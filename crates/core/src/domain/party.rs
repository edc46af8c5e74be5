use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;
use crate::flows::steps::IntakeStep;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// National Identification Number: exactly 11 digits.
    Nin,
    /// Corporate registration number: `RC` or `BN` followed by digits.
    Cac,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nin => "nin",
            Self::Cac => "cac",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nin" => Some(Self::Nin),
            "cac" => Some(Self::Cac),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Nin => "NIN",
            Self::Cac => "CAC registration number",
        }
    }
}

/// An identity document value already classified by format. The two kinds are
/// mutually exclusive on a party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityDocument {
    Nin(String),
    Cac(String),
}

impl IdentityDocument {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Nin(_) => IdentityKind::Nin,
            Self::Cac(_) => IdentityKind::Cac,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Nin(value) | Self::Cac(value) => value,
        }
    }

    pub fn nin(&self) -> Option<&str> {
        match self {
            Self::Nin(value) => Some(value),
            Self::Cac(_) => None,
        }
    }

    pub fn cac(&self) -> Option<&str> {
        match self {
            Self::Cac(value) => Some(value),
            Self::Nin(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub principal_id: PrincipalId,
    pub name: Option<String>,
    pub identity: Option<IdentityDocument>,
    pub preferences: Option<String>,
    /// Last derived step, persisted for compare-and-swap and reporting. Derivation
    /// never reads it.
    pub step: IntakeStep,
    pub registration_cycle: i64,
    /// Cycle in which the name was last confirmed; 0 when never confirmed.
    pub name_confirmed_cycle: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartyRecord {
    pub fn first_contact(principal_id: PrincipalId, now: DateTime<Utc>) -> Self {
        Self {
            principal_id,
            name: None,
            identity: None,
            preferences: None,
            step: IntakeStep::Name,
            registration_cycle: 1,
            name_confirmed_cycle: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name_confirmed(&self) -> bool {
        self.name_confirmed_cycle == self.registration_cycle
    }

    /// Opens a new registration cycle. Nothing is deleted; the name has to be
    /// confirmed again and no property is active until an address is accepted.
    pub fn begin_new_registration(&mut self) {
        self.registration_cycle += 1;
        self.step = IntakeStep::Name;
    }
}
