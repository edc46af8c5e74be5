use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use propline_core::domain::link::{GraphNode, LinkEdge};
use propline_core::domain::message::{
    InboundMessage, LedgerCompletion, LedgerEntry, LedgerState, MessageId,
};
use propline_core::domain::party::PartyRecord;
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{
    address_key, PropertyId, PropertyRecord, PropertyStatus, PropertyVerification,
};
use propline_core::flows::{derive_step, IntakeSnapshot, IntakeStep};
use propline_core::reconcile::PropertyChange;

use super::{
    AppliedIntake, GraphStore, IntakeRepository, IntakeWrite, RepositoryError, Reservation,
};

#[derive(Default)]
struct IntakeTables {
    parties: HashMap<String, (PartyRecord, String)>,
    properties: HashMap<String, PropertyRecord>,
    messages: HashMap<String, LedgerEntry>,
}

impl IntakeTables {
    fn active_property(&self, principal_id: &PrincipalId, cycle: i64) -> Option<PropertyRecord> {
        self.properties
            .values()
            .filter(|record| record.principal_id == *principal_id && record.registration_cycle == cycle)
            .max_by_key(|record| (record.updated_at, record.created_at))
            .cloned()
    }

    fn snapshot(&self, principal_id: &PrincipalId) -> Option<IntakeSnapshot> {
        let (stored, marker) = self.parties.get(&principal_id.0)?;
        let mut party = stored.clone();
        let unrecognized = match IntakeStep::parse(marker) {
            Some(step) => {
                party.step = step;
                None
            }
            None => {
                party.step = IntakeStep::Name;
                Some(marker.clone())
            }
        };
        let active = self.active_property(principal_id, party.registration_cycle);
        let mut snapshot = IntakeSnapshot::new(party, active);
        snapshot.unrecognized_marker = unrecognized;
        Some(snapshot)
    }
}

/// Same contract as the SQL repository, held in process memory. Every write
/// happens under one lock, which stands in for the transaction.
#[derive(Default)]
pub struct InMemoryIntakeRepository {
    tables: RwLock<IntakeTables>,
    completion_failures: AtomicU32,
}

impl InMemoryIntakeRepository {
    /// Overwrites the stored step marker with an arbitrary value.
    pub async fn force_marker(&self, principal_id: &PrincipalId, marker: &str) {
        let mut tables = self.tables.write().await;
        if let Some((_, stored)) = tables.parties.get_mut(&principal_id.0) {
            *stored = marker.to_string();
        }
    }

    /// Makes the next `count` ledger completions fail with a database error.
    pub fn fail_next_completion(&self, count: u32) {
        self.completion_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl IntakeRepository for InMemoryIntakeRepository {
    async fn load_or_create_snapshot(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<IntakeSnapshot, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.parties.entry(principal_id.0.clone()).or_insert_with(|| {
            let party = PartyRecord::first_contact(principal_id.clone(), now);
            let marker = party.step.as_str().to_string();
            (party, marker)
        });
        tables.snapshot(principal_id).ok_or_else(|| {
            RepositoryError::NotFound(format!("party for principal `{}`", principal_id.0))
        })
    }

    async fn find_snapshot(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<IntakeSnapshot>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.snapshot(principal_id))
    }

    async fn apply_intake(&self, write: IntakeWrite) -> Result<AppliedIntake, RepositoryError> {
        let IntakeWrite { mut party, expected_marker, property, now } = write;
        let mut tables = self.tables.write().await;

        let mut reopened = false;
        let touched = match property {
            Some(PropertyChange::Open { address, role }) => {
                let key = address_key(&address);
                let existing = tables
                    .properties
                    .values()
                    .find(|record| record.principal_id == party.principal_id && record.address_key == key)
                    .cloned();
                let record = match existing {
                    Some(mut record) => {
                        reopened = true;
                        record.address = address;
                        record.role = role.or(record.role);
                        record.registration_cycle = party.registration_cycle;
                        record.updated_at = now;
                        record
                    }
                    None => PropertyRecord {
                        id: PropertyId::generate(),
                        principal_id: party.principal_id.clone(),
                        address,
                        address_key: key,
                        status: PropertyStatus::AwaitingPreferences,
                        preferences: None,
                        role,
                        registration_cycle: party.registration_cycle,
                        verification: None,
                        created_at: now,
                        updated_at: now,
                    },
                };
                Some(record)
            }
            Some(PropertyChange::Update(record)) => {
                let mut stored = match tables.properties.get(&record.id.0) {
                    Some(stored) if stored.principal_id == party.principal_id => stored.clone(),
                    _ => {
                        return Err(RepositoryError::NotFound(format!(
                            "property `{}`",
                            record.id.0
                        )))
                    }
                };
                stored.status = record.status;
                stored.preferences = record.preferences;
                stored.role = record.role;
                stored.updated_at = now;
                Some(stored)
            }
            None => None,
        };

        let active = match &touched {
            Some(record) if record.registration_cycle == party.registration_cycle => {
                Some(record.clone())
            }
            _ => tables.active_property(&party.principal_id, party.registration_cycle),
        };
        let mut snapshot = IntakeSnapshot::new(party.clone(), active);
        let target = derive_step(&snapshot);

        let stored_marker = tables
            .parties
            .get(&party.principal_id.0)
            .map(|(_, marker)| marker.clone())
            .unwrap_or_else(|| expected_marker.clone());
        if stored_marker != expected_marker && stored_marker != target.as_str() {
            return Err(RepositoryError::Conflict(format!(
                "step marker for `{}` moved away from `{expected_marker}`",
                party.principal_id.0
            )));
        }

        party.step = target;
        party.updated_at = now;
        if let Some(record) = &touched {
            tables.properties.insert(record.id.0.clone(), record.clone());
        }
        tables
            .parties
            .insert(party.principal_id.0.clone(), (party.clone(), target.as_str().to_string()));

        snapshot.party = party;
        Ok(AppliedIntake { snapshot, property: touched, reopened })
    }

    async fn find_property(
        &self,
        id: &PropertyId,
    ) -> Result<Option<PropertyRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.properties.get(&id.0).cloned())
    }

    async fn list_properties(&self) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut records: Vec<PropertyRecord> = tables.properties.values().cloned().collect();
        records.sort_by(|left, right| {
            left.address.cmp(&right.address).then(left.created_at.cmp(&right.created_at))
        });
        Ok(records)
    }

    async fn list_properties_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut records: Vec<PropertyRecord> = tables
            .properties
            .values()
            .filter(|record| record.principal_id == *principal_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn find_properties_by_address_key(
        &self,
        address_key: &str,
    ) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut records: Vec<PropertyRecord> = tables
            .properties
            .values()
            .filter(|record| record.address_key == address_key)
            .cloned()
            .collect();
        records.sort_by(|left, right| left.principal_id.cmp(&right.principal_id));
        Ok(records)
    }

    async fn verify_property(
        &self,
        id: &PropertyId,
        verification: PropertyVerification,
    ) -> Result<PropertyRecord, RepositoryError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .properties
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("property `{}`", id.0)))?;

        record
            .transition_to(PropertyStatus::Verified)
            .map_err(|error| RepositoryError::Conflict(error.to_string()))?;
        record.updated_at = verification.verified_at;
        record.verification = Some(verification);
        Ok(record.clone())
    }

    async fn reserve_message(
        &self,
        principal_id: &PrincipalId,
        message: &InboundMessage,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Reservation, RepositoryError> {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.messages.get(&message.message_id.0) {
            let abandoned =
                entry.state == LedgerState::Reserved && entry.reserved_at < now - lease;
            if !abandoned {
                return Ok(Reservation::Duplicate(entry.clone()));
            }
        }

        tables.messages.insert(
            message.message_id.0.clone(),
            LedgerEntry {
                message_id: message.message_id.clone(),
                principal_id: principal_id.clone(),
                state: LedgerState::Reserved,
                reserved_at: now,
                step_before: None,
                step_after: None,
                reply: None,
                outcome: None,
                received_at: message.received_at,
                completed_at: None,
            },
        );
        Ok(Reservation::Fresh)
    }

    async fn complete_message(
        &self,
        message_id: &MessageId,
        completion: LedgerCompletion,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let remaining = self.completion_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.completion_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.messages.get_mut(&message_id.0) {
            entry.state = LedgerState::Completed;
            entry.step_before = Some(completion.step_before);
            entry.step_after = Some(completion.step_after);
            entry.reply = Some(completion.reply);
            entry.outcome = Some(completion.outcome);
            entry.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release_message(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables
            .messages
            .get(&message_id.0)
            .is_some_and(|entry| entry.state == LedgerState::Reserved)
        {
            tables.messages.remove(&message_id.0);
        }
        Ok(())
    }

    async fn find_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.messages.get(&message_id.0).cloned())
    }
}

#[derive(Default)]
struct GraphTables {
    nodes: HashMap<(String, String), BTreeMap<String, String>>,
    edges: Vec<LinkEdge>,
}

/// In-process graph with optional failure injection for saga tests.
#[derive(Default)]
pub struct InMemoryGraphStore {
    tables: RwLock<GraphTables>,
    failures_remaining: AtomicU32,
}

impl InMemoryGraphStore {
    /// Makes the next `count` graph operations fail with a database error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), RepositoryError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }
}

#[async_trait::async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn merge_node(
        &self,
        node: &GraphNode,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.injected_failure()?;
        let mut tables = self.tables.write().await;
        tables
            .nodes
            .entry((node.label.clone(), node.key.clone()))
            .or_default()
            .extend(node.properties.clone());
        Ok(())
    }

    async fn create_listing(&self, edge: &LinkEdge) -> Result<bool, RepositoryError> {
        self.injected_failure()?;
        let mut tables = self.tables.write().await;
        let exists = tables.edges.iter().any(|stored| {
            stored.edge_key == edge.edge_key
                || (stored.principal_id == edge.principal_id
                    && stored.address_key == edge.address_key)
        });
        if exists {
            return Ok(false);
        }
        tables.edges.push(edge.clone());
        Ok(true)
    }

    async fn set_listing_status(
        &self,
        principal_id: &PrincipalId,
        address_key: &str,
        status: PropertyStatus,
        _verification: Option<&PropertyVerification>,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.injected_failure()?;
        let mut tables = self.tables.write().await;
        let edge = tables
            .edges
            .iter_mut()
            .find(|edge| edge.principal_id == *principal_id && edge.address_key == address_key)
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "LISTED edge `{}` -> `{address_key}`",
                    principal_id.0
                ))
            })?;
        edge.status = status;
        Ok(())
    }

    async fn listings_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<LinkEdge>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.edges.iter().filter(|edge| edge.principal_id == *principal_id).cloned().collect())
    }

    async fn listings_for_property(
        &self,
        address_key: &str,
    ) -> Result<Vec<LinkEdge>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.edges.iter().filter(|edge| edge.address_key == address_key).cloned().collect())
    }

    async fn node_count(&self, label: &str) -> Result<i64, RepositoryError> {
        let tables = self.tables.read().await;
        let count = tables.nodes.keys().filter(|(node_label, _)| node_label == label).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use propline_core::domain::link::{GraphNode, PERSON_LABEL};
    use propline_core::domain::principal::PrincipalId;
    use propline_core::flows::IntakeStep;

    use crate::repositories::{
        GraphStore, InMemoryGraphStore, InMemoryIntakeRepository, IntakeRepository, IntakeWrite,
        RepositoryError,
    };

    #[tokio::test]
    async fn in_memory_repo_applies_compare_and_swap() {
        let repo = InMemoryIntakeRepository::default();
        let principal = PrincipalId("+2348000000001".to_string());
        let snapshot = repo.load_or_create_snapshot(&principal, Utc::now()).await.expect("load");

        let mut party = snapshot.party.clone();
        party.name = Some("John Doe".to_string());
        party.name_confirmed_cycle = 1;
        let applied = repo
            .apply_intake(IntakeWrite {
                party: party.clone(),
                expected_marker: "name".to_string(),
                property: None,
                now: Utc::now(),
            })
            .await
            .expect("apply");
        assert_eq!(applied.snapshot.party.step, IntakeStep::Identity);

        repo.force_marker(&principal, "done").await;
        let error = repo
            .apply_intake(IntakeWrite {
                party,
                expected_marker: "name".to_string(),
                property: None,
                now: Utc::now(),
            })
            .await
            .expect_err("marker moved");
        assert!(matches!(error, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn injected_graph_failures_are_consumed() {
        let store = InMemoryGraphStore::default();
        let principal = PrincipalId("+2348000000001".to_string());
        store.fail_next(1);

        assert!(store.merge_node(&GraphNode::person(&principal, None), Utc::now()).await.is_err());
        store.merge_node(&GraphNode::person(&principal, None), Utc::now()).await.expect("second");
        assert_eq!(store.node_count(PERSON_LABEL).await.expect("count"), 1);
    }
}
