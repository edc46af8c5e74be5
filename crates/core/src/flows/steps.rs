use serde::{Deserialize, Serialize};

use crate::domain::party::PartyRecord;
use crate::domain::principal::PrincipalId;
use crate::domain::property::PropertyRecord;
use crate::validation::{identity_is_valid, meaningful};

/// Fixed intake order. `Done` means every required fact is on file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStep {
    Name,
    Identity,
    Address,
    Preferences,
    Done,
}

impl IntakeStep {
    pub const ORDER: [IntakeStep; 5] =
        [Self::Name, Self::Identity, Self::Address, Self::Preferences, Self::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Identity => "identity",
            Self::Address => "address",
            Self::Preferences => "preferences",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "name" => Some(Self::Name),
            "identity" => Some(Self::Identity),
            "address" | "value" => Some(Self::Address),
            "preferences" => Some(Self::Preferences),
            "done" | "complete" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn next(&self) -> IntakeStep {
        match self {
            Self::Name => Self::Identity,
            Self::Identity => Self::Address,
            Self::Address => Self::Preferences,
            Self::Preferences | Self::Done => Self::Done,
        }
    }

    pub fn collects_input(&self) -> bool {
        !matches!(self, Self::Done)
    }
}

impl std::fmt::Display for IntakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the deriver needs, loaded fresh from the relational store for
/// every inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeSnapshot {
    pub principal_id: PrincipalId,
    pub party: PartyRecord,
    /// Most recent property opened in the party's current registration cycle.
    pub active_property: Option<PropertyRecord>,
    /// Raw step marker that could not be parsed, if any.
    pub unrecognized_marker: Option<String>,
}

impl IntakeSnapshot {
    pub fn new(party: PartyRecord, active_property: Option<PropertyRecord>) -> Self {
        Self {
            principal_id: party.principal_id.clone(),
            party,
            active_property,
            unrecognized_marker: None,
        }
    }

    pub fn is_satisfied(&self, step: IntakeStep) -> bool {
        match step {
            IntakeStep::Name => {
                self.party.name_confirmed() && meaningful(self.party.name.as_deref()).is_some()
            }
            IntakeStep::Identity => self.party.identity.as_ref().is_some_and(identity_is_valid),
            IntakeStep::Address => self
                .active_property
                .as_ref()
                .is_some_and(|property| meaningful(Some(property.address.as_str())).is_some()),
            IntakeStep::Preferences => self
                .active_property
                .as_ref()
                .is_some_and(|property| meaningful(property.preferences.as_deref()).is_some()),
            IntakeStep::Done => IntakeStep::ORDER[..4].iter().all(|step| self.is_satisfied(*step)),
        }
    }
}

/// First unsatisfied step in the fixed order, or `Done`.
pub fn derive_step(snapshot: &IntakeSnapshot) -> IntakeStep {
    IntakeStep::ORDER
        .into_iter()
        .find(|step| step.collects_input() && !snapshot.is_satisfied(*step))
        .unwrap_or(IntakeStep::Done)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{derive_step, IntakeSnapshot, IntakeStep};
    use crate::domain::party::{IdentityDocument, PartyRecord};
    use crate::domain::principal::PrincipalId;
    use crate::domain::property::{address_key, PropertyId, PropertyRecord, PropertyStatus};

    fn party() -> PartyRecord {
        PartyRecord::first_contact(PrincipalId("+2348000000001".to_string()), Utc::now())
    }

    fn property(preferences: Option<&str>) -> PropertyRecord {
        let now = Utc::now();
        PropertyRecord {
            id: PropertyId("PROP-1".to_string()),
            principal_id: PrincipalId("+2348000000001".to_string()),
            address: "14 Marina Rd".to_string(),
            address_key: address_key("14 Marina Rd"),
            status: PropertyStatus::AwaitingPreferences,
            preferences: preferences.map(str::to_string),
            role: None,
            registration_cycle: 1,
            verification: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_party_starts_at_name() {
        assert_eq!(derive_step(&IntakeSnapshot::new(party(), None)), IntakeStep::Name);
    }

    #[test]
    fn derivation_walks_the_fixed_order() {
        let mut record = party();
        record.name = Some("John Doe".to_string());
        record.name_confirmed_cycle = 1;
        assert_eq!(derive_step(&IntakeSnapshot::new(record.clone(), None)), IntakeStep::Identity);

        record.identity = Some(IdentityDocument::Nin("12345678901".to_string()));
        assert_eq!(derive_step(&IntakeSnapshot::new(record.clone(), None)), IntakeStep::Address);

        let snapshot = IntakeSnapshot::new(record.clone(), Some(property(None)));
        assert_eq!(derive_step(&snapshot), IntakeStep::Preferences);

        let snapshot = IntakeSnapshot::new(record, Some(property(Some("No pets"))));
        assert_eq!(derive_step(&snapshot), IntakeStep::Done);
        assert!(snapshot.is_satisfied(IntakeStep::Done));
    }

    #[test]
    fn placeholder_values_do_not_satisfy_a_step() {
        let mut record = party();
        record.name = Some("Unknown".to_string());
        record.name_confirmed_cycle = 1;
        assert_eq!(derive_step(&IntakeSnapshot::new(record, None)), IntakeStep::Name);
    }

    #[test]
    fn unconfirmed_name_after_reset_re_enters_at_name() {
        let mut record = party();
        record.name = Some("John Doe".to_string());
        record.name_confirmed_cycle = 1;
        record.identity = Some(IdentityDocument::Nin("12345678901".to_string()));
        record.begin_new_registration();

        assert_eq!(derive_step(&IntakeSnapshot::new(record, None)), IntakeStep::Name);
    }

    #[test]
    fn malformed_stored_identity_is_unsatisfied() {
        let mut record = party();
        record.name = Some("John Doe".to_string());
        record.name_confirmed_cycle = 1;
        record.identity = Some(IdentityDocument::Nin("123".to_string()));
        assert_eq!(derive_step(&IntakeSnapshot::new(record, None)), IntakeStep::Identity);
    }

    #[test]
    fn marker_is_ignored_by_derivation() {
        let mut record = party();
        record.step = IntakeStep::Done;
        assert_eq!(derive_step(&IntakeSnapshot::new(record, None)), IntakeStep::Name);
    }

    #[test]
    fn step_parsing_round_trips_known_labels() {
        for step in IntakeStep::ORDER {
            assert_eq!(IntakeStep::parse(step.as_str()), Some(step));
        }
        assert_eq!(IntakeStep::parse("COMPLETE"), Some(IntakeStep::Done));
        assert_eq!(IntakeStep::parse("pending_nin"), None);
    }
}
