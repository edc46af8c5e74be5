use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::principal::PrincipalId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyId(pub String);

impl PropertyId {
    pub fn generate() -> Self {
        Self(format!("PROP-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    AwaitingPreferences,
    Submitted,
    Verified,
}

impl PropertyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingPreferences => "awaiting_preferences",
            Self::Submitted => "submitted",
            Self::Verified => "verified",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "awaiting_preferences" => Some(Self::AwaitingPreferences),
            "submitted" => Some(Self::Submitted),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyVerification {
    pub confirmed_role: String,
    pub payout_account_name: String,
    pub payout_account_number: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: PropertyId,
    pub principal_id: PrincipalId,
    pub address: String,
    pub address_key: String,
    pub status: PropertyStatus,
    pub preferences: Option<String>,
    pub role: Option<String>,
    pub registration_cycle: i64,
    pub verification: Option<PropertyVerification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyRecord {
    pub fn can_transition_to(&self, next: PropertyStatus) -> bool {
        matches!(
            (self.status, next),
            (PropertyStatus::AwaitingPreferences, PropertyStatus::Submitted)
                | (PropertyStatus::AwaitingPreferences, PropertyStatus::Verified)
                | (PropertyStatus::Submitted, PropertyStatus::Verified)
                | (PropertyStatus::Submitted, PropertyStatus::Submitted)
                | (PropertyStatus::Verified, PropertyStatus::Verified)
        )
    }

    pub fn transition_to(&mut self, next: PropertyStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidPropertyTransition { from: self.status, to: next })
    }

    /// Status after preferences are accepted. A verified property stays verified.
    pub fn status_after_preferences(&self) -> PropertyStatus {
        match self.status {
            PropertyStatus::Verified => PropertyStatus::Verified,
            PropertyStatus::AwaitingPreferences | PropertyStatus::Submitted => {
                PropertyStatus::Submitted
            }
        }
    }
}

/// Merge key for the address. Case, punctuation, and whitespace differences do
/// not create a new property.
pub fn address_key(address: &str) -> String {
    let mut cleaned = String::with_capacity(address.len());
    for character in address.chars() {
        if character.is_alphanumeric() {
            cleaned.extend(character.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{address_key, PropertyId, PropertyRecord, PropertyStatus};
    use crate::domain::principal::PrincipalId;

    fn property(status: PropertyStatus) -> PropertyRecord {
        let now = Utc::now();
        PropertyRecord {
            id: PropertyId("PROP-1".to_string()),
            principal_id: PrincipalId("+2348000000001".to_string()),
            address: "14 Marina Rd".to_string(),
            address_key: address_key("14 Marina Rd"),
            status,
            preferences: None,
            role: None,
            registration_cycle: 1,
            verification: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn address_key_ignores_case_and_punctuation() {
        assert_eq!(address_key("14, Marina Rd."), "14 marina rd");
        assert_eq!(address_key("  14 MARINA   rd "), "14 marina rd");
    }

    #[test]
    fn verified_properties_do_not_regress() {
        let mut verified = property(PropertyStatus::Verified);
        let error = verified
            .transition_to(PropertyStatus::AwaitingPreferences)
            .expect_err("verified -> awaiting should fail");
        assert!(matches!(error, crate::errors::DomainError::InvalidPropertyTransition { .. }));
        assert_eq!(verified.status_after_preferences(), PropertyStatus::Verified);
    }

    #[test]
    fn awaiting_property_can_be_submitted_then_verified() {
        let mut record = property(PropertyStatus::AwaitingPreferences);
        record.transition_to(PropertyStatus::Submitted).expect("awaiting -> submitted");
        record.transition_to(PropertyStatus::Verified).expect("submitted -> verified");
        assert_eq!(record.status, PropertyStatus::Verified);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(PropertyId::generate(), PropertyId::generate());
    }
}
