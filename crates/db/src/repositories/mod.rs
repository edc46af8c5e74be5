use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;

use propline_core::domain::link::{GraphNode, LinkEdge};
use propline_core::domain::message::{InboundMessage, LedgerCompletion, LedgerEntry, MessageId};
use propline_core::domain::party::PartyRecord;
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{
    PropertyId, PropertyRecord, PropertyStatus, PropertyVerification,
};
use propline_core::flows::IntakeSnapshot;
use propline_core::reconcile::PropertyChange;

pub mod graph;
pub mod intake;
pub mod memory;

pub use graph::SqlGraphStore;
pub use intake::SqlIntakeRepository;
pub use memory::{InMemoryGraphStore, InMemoryIntakeRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Relational write for one inbound message. `expected_marker` is the step
/// marker the snapshot was read with; the write only lands while the stored
/// marker is still that value or already the derived target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeWrite {
    pub party: PartyRecord,
    pub expected_marker: String,
    pub property: Option<PropertyChange>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedIntake {
    /// State as committed, with the step marker set to the derived step.
    pub snapshot: IntakeSnapshot,
    /// Property touched by this write, if any.
    pub property: Option<PropertyRecord>,
    /// True when `Open` matched an existing record instead of inserting.
    pub reopened: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// First sighting of the message id; the caller owns processing.
    Fresh,
    /// Already seen. Holds the stored entry, completed or still in flight.
    Duplicate(LedgerEntry),
}

#[async_trait]
pub trait IntakeRepository: Send + Sync {
    /// Loads the principal's snapshot, creating the principal and an empty party
    /// on first contact.
    async fn load_or_create_snapshot(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<IntakeSnapshot, RepositoryError>;

    async fn find_snapshot(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<IntakeSnapshot>, RepositoryError>;

    async fn apply_intake(&self, write: IntakeWrite) -> Result<AppliedIntake, RepositoryError>;

    async fn find_property(&self, id: &PropertyId)
        -> Result<Option<PropertyRecord>, RepositoryError>;

    /// Every property, ordered by address ascending.
    async fn list_properties(&self) -> Result<Vec<PropertyRecord>, RepositoryError>;

    async fn list_properties_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<PropertyRecord>, RepositoryError>;

    async fn find_properties_by_address_key(
        &self,
        address_key: &str,
    ) -> Result<Vec<PropertyRecord>, RepositoryError>;

    async fn verify_property(
        &self,
        id: &PropertyId,
        verification: PropertyVerification,
    ) -> Result<PropertyRecord, RepositoryError>;

    /// Claims `message` for processing. A reservation that never completed
    /// and is older than `lease` is taken over as fresh.
    async fn reserve_message(
        &self,
        principal_id: &PrincipalId,
        message: &InboundMessage,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Reservation, RepositoryError>;

    async fn complete_message(
        &self,
        message_id: &MessageId,
        completion: LedgerCompletion,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Drops an in-flight reservation so a provider retry is processed again.
    async fn release_message(&self, message_id: &MessageId) -> Result<(), RepositoryError>;

    async fn find_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LedgerEntry>, RepositoryError>;
}

/// Secondary index of who listed what. Every operation is idempotent.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn merge_node(&self, node: &GraphNode, now: DateTime<Utc>)
        -> Result<(), RepositoryError>;

    /// Creates the LISTED edge unless one already exists for the same edge key
    /// or the same (principal, property) pairing. Returns whether it was created.
    async fn create_listing(&self, edge: &LinkEdge) -> Result<bool, RepositoryError>;

    async fn set_listing_status(
        &self,
        principal_id: &PrincipalId,
        address_key: &str,
        status: PropertyStatus,
        verification: Option<&PropertyVerification>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn listings_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<LinkEdge>, RepositoryError>;

    async fn listings_for_property(&self, address_key: &str)
        -> Result<Vec<LinkEdge>, RepositoryError>;

    async fn node_count(&self, label: &str) -> Result<i64, RepositoryError>;
}

/// Fixed-width UTC form so stored lease timestamps compare as text.
pub(crate) fn sortable_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
