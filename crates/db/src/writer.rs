use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use propline_core::domain::link::{GraphNode, LinkEdge};
use propline_core::domain::message::MessageId;
use propline_core::domain::party::PartyRecord;
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{PropertyId, PropertyRecord, PropertyVerification};
use propline_core::errors::{ApplicationError, IntakeError, StoreKind};

use crate::repositories::{
    AppliedIntake, GraphStore, IntakeRepository, IntakeWrite, RepositoryError,
};

const GRAPH_RETRY_BASE_MS: u64 = 25;

/// What happened to the secondary index after the relational commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphSync {
    Synced { listings_created: usize },
    Failed { attempts: u32, message: String },
}

impl GraphSync {
    pub fn error(&self) -> Option<IntakeError> {
        match self {
            Self::Synced { .. } => None,
            Self::Failed { message, .. } => {
                Some(IntakeError::StoreWrite { store: StoreKind::Graph, message: message.clone() })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReceipt {
    pub applied: AppliedIntake,
    pub graph: GraphSync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReceipt {
    pub property: PropertyRecord,
    pub graph: GraphSync,
}

/// Origin of a graph write, carried onto any LISTED edge it creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provenance {
    pub message_id: MessageId,
    pub evidence_ref: Option<String>,
}

impl Provenance {
    pub fn message(message_id: MessageId, evidence_ref: Option<String>) -> Self {
        Self { message_id, evidence_ref }
    }

    fn synthetic(kind: &str, property: &PropertyRecord) -> Self {
        Self { message_id: MessageId(format!("{kind}:{}", property.id.0)), evidence_ref: None }
    }
}

/// Applies merged intake state as a two-step saga. The relational step is one
/// transaction and is authoritative; the graph step is retried and only ever
/// reported, never rolled back.
pub struct DualStoreWriter {
    intake: Arc<dyn IntakeRepository>,
    graph: Arc<dyn GraphStore>,
    graph_max_retries: u32,
}

impl DualStoreWriter {
    pub fn new(
        intake: Arc<dyn IntakeRepository>,
        graph: Arc<dyn GraphStore>,
        graph_max_retries: u32,
    ) -> Self {
        Self { intake, graph, graph_max_retries }
    }

    pub fn intake(&self) -> &Arc<dyn IntakeRepository> {
        &self.intake
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub async fn write(
        &self,
        write: IntakeWrite,
        provenance: &Provenance,
    ) -> Result<WriteReceipt, IntakeError> {
        let now = write.now;
        let principal = write.party.principal_id.clone();
        let applied = self.intake.apply_intake(write).await.map_err(|error| {
            warn!(
                event_name = "intake.write.relational_failed",
                principal = %principal,
                correlation_id = %provenance.message_id.0,
                error = %error,
                "relational write failed"
            );
            IntakeError::StoreWrite { store: StoreKind::Relational, message: error.to_string() }
        })?;

        let properties: Vec<PropertyRecord> = applied.property.iter().cloned().collect();
        let graph = self
            .sync_graph(&applied.snapshot.party, &properties, provenance, None, now)
            .await;

        Ok(WriteReceipt { applied, graph })
    }

    /// Marks a property verified in the relational store, then mirrors the
    /// status and payout details onto its LISTED edge.
    pub async fn verify(
        &self,
        id: &PropertyId,
        verification: PropertyVerification,
    ) -> Result<VerifyReceipt, ApplicationError> {
        let now = verification.verified_at;
        let property = self
            .intake
            .verify_property(id, verification.clone())
            .await
            .map_err(application_error)?;
        let party = self
            .intake
            .find_snapshot(&property.principal_id)
            .await
            .map_err(application_error)?
            .map(|snapshot| snapshot.party)
            .unwrap_or_else(|| PartyRecord::first_contact(property.principal_id.clone(), now));

        let provenance = Provenance::synthetic("verify", &property);
        let single = std::slice::from_ref(&property);
        let graph =
            self.sync_graph(&party, single, &provenance, Some(&verification), now).await;

        info!(
            event_name = "property.verified",
            principal = %property.principal_id,
            property_id = %property.id.0,
            graph_synced = graph.error().is_none(),
            "property verified"
        );
        Ok(VerifyReceipt { property, graph })
    }

    /// Rebuilds a principal's graph nodes and edges from relational state.
    /// Safe to repeat; this is the retry path for a failed graph step.
    pub async fn reindex_principal(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<GraphSync, ApplicationError> {
        let party = self
            .intake
            .find_snapshot(principal_id)
            .await
            .map_err(application_error)?
            .map(|snapshot| snapshot.party)
            .ok_or_else(|| ApplicationError::NotFound(format!("principal `{principal_id}`")))?;
        let properties = self
            .intake
            .list_properties_for_principal(principal_id)
            .await
            .map_err(application_error)?;

        if properties.is_empty() {
            let provenance =
                Provenance::message(MessageId(format!("reindex:{principal_id}")), None);
            return Ok(self.sync_graph(&party, &[], &provenance, None, now).await);
        }

        let mut listings_created = 0;
        for property in &properties {
            let provenance = Provenance::synthetic("reindex", property);
            let single = std::slice::from_ref(property);
            match self
                .sync_graph(&party, single, &provenance, property.verification.as_ref(), now)
                .await
            {
                GraphSync::Synced { listings_created: created } => listings_created += created,
                failed @ GraphSync::Failed { .. } => return Ok(failed),
            }
        }

        info!(
            event_name = "graph.reindexed",
            principal = %principal_id,
            properties = properties.len(),
            listings_created,
            "principal reindexed"
        );
        Ok(GraphSync::Synced { listings_created })
    }

    async fn sync_graph(
        &self,
        party: &PartyRecord,
        properties: &[PropertyRecord],
        provenance: &Provenance,
        verification: Option<&PropertyVerification>,
        now: DateTime<Utc>,
    ) -> GraphSync {
        let attempts_allowed = self.graph_max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.graph_step(party, properties, provenance, verification, now).await {
                Ok(listings_created) => return GraphSync::Synced { listings_created },
                Err(error) if attempt < attempts_allowed => {
                    warn!(
                        event_name = "intake.write.graph_retry",
                        principal = %party.principal_id,
                        correlation_id = %provenance.message_id.0,
                        attempt,
                        error = %error,
                        "graph write failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(GRAPH_RETRY_BASE_MS * u64::from(attempt)))
                        .await;
                }
                Err(error) => {
                    warn!(
                        event_name = "intake.write.graph_failed",
                        principal = %party.principal_id,
                        correlation_id = %provenance.message_id.0,
                        attempts = attempt,
                        error = %error,
                        "graph write abandoned; relational state stands"
                    );
                    return GraphSync::Failed { attempts: attempt, message: error.to_string() };
                }
            }
        }
    }

    async fn graph_step(
        &self,
        party: &PartyRecord,
        properties: &[PropertyRecord],
        provenance: &Provenance,
        verification: Option<&PropertyVerification>,
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let name = party.name.as_deref().filter(|_| party.name_confirmed());
        self.graph.merge_node(&GraphNode::person(&party.principal_id, name), now).await?;

        let mut created = 0;
        for property in properties {
            self.graph
                .merge_node(&GraphNode::property(&property.address_key, &property.address), now)
                .await?;

            let edge = LinkEdge {
                edge_key: LinkEdge::edge_key(
                    &party.principal_id,
                    &property.address_key,
                    &provenance.message_id,
                ),
                principal_id: party.principal_id.clone(),
                address_key: property.address_key.clone(),
                message_id: provenance.message_id.clone(),
                evidence_ref: provenance.evidence_ref.clone(),
                role: property.role.clone(),
                status: property.status,
                created_at: now,
            };
            if self.graph.create_listing(&edge).await? {
                created += 1;
            }
            self.graph
                .set_listing_status(
                    &party.principal_id,
                    &property.address_key,
                    property.status,
                    verification,
                    now,
                )
                .await?;
        }
        Ok(created)
    }
}

fn application_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::NotFound(message) => ApplicationError::NotFound(message),
        RepositoryError::Conflict(message) => ApplicationError::Conflict(message),
        other => ApplicationError::Persistence(other.to_string()),
    }
}
