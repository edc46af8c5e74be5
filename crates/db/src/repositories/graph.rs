use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use propline_core::domain::link::{
    GraphNode, LinkEdge, LISTED_RELATION, PERSON_LABEL, PROPERTY_LABEL,
};
use propline_core::domain::message::MessageId;
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{PropertyStatus, PropertyVerification};

use super::{parse_timestamp, GraphStore, RepositoryError};
use crate::DbPool;

const EDGE_COLUMNS: &str =
    "edge_key, from_key, to_key, message_id, evidence_ref, role, status, created_at";

/// Node/edge tables standing in for a labelled property graph. Nodes are keyed
/// by (label, key); LISTED edges are unique per (principal, property) pairing.
pub struct SqlGraphStore {
    pool: DbPool,
}

impl SqlGraphStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GraphStore for SqlGraphStore {
    async fn merge_node(
        &self,
        node: &GraphNode,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let properties = encode_properties(&node.properties)?;
        let timestamp = now.to_rfc3339();

        sqlx::query(
            "INSERT INTO graph_node (label, node_key, properties_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(label, node_key) DO UPDATE SET
                properties_json = json_patch(graph_node.properties_json, excluded.properties_json),
                updated_at = excluded.updated_at",
        )
        .bind(&node.label)
        .bind(&node.key)
        .bind(properties)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_listing(&self, edge: &LinkEdge) -> Result<bool, RepositoryError> {
        let timestamp = edge.created_at.to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO graph_edge (
                edge_key, relation, from_label, from_key, to_label, to_key, message_id,
                evidence_ref, role, status, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&edge.edge_key)
        .bind(LISTED_RELATION)
        .bind(PERSON_LABEL)
        .bind(&edge.principal_id.0)
        .bind(PROPERTY_LABEL)
        .bind(&edge.address_key)
        .bind(&edge.message_id.0)
        .bind(edge.evidence_ref.as_deref())
        .bind(edge.role.as_deref())
        .bind(edge.status.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_listing_status(
        &self,
        principal_id: &PrincipalId,
        address_key: &str,
        status: PropertyStatus,
        verification: Option<&PropertyVerification>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut properties = BTreeMap::new();
        if let Some(verification) = verification {
            properties.insert("confirmedRole".to_string(), verification.confirmed_role.clone());
            properties.insert("accountName".to_string(), verification.payout_account_name.clone());
            properties
                .insert("accountNumber".to_string(), verification.payout_account_number.clone());
            properties.insert("verifiedAt".to_string(), verification.verified_at.to_rfc3339());
        }

        let result = sqlx::query(
            "UPDATE graph_edge
             SET status = ?,
                 properties_json = json_patch(properties_json, ?),
                 updated_at = ?
             WHERE relation = ? AND from_label = ? AND from_key = ? AND to_label = ? AND to_key = ?",
        )
        .bind(status.as_str())
        .bind(encode_properties(&properties)?)
        .bind(now.to_rfc3339())
        .bind(LISTED_RELATION)
        .bind(PERSON_LABEL)
        .bind(&principal_id.0)
        .bind(PROPERTY_LABEL)
        .bind(address_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!(
                "LISTED edge `{}` -> `{address_key}`",
                principal_id.0
            )));
        }
        Ok(())
    }

    async fn listings_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<LinkEdge>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edge
             WHERE relation = ? AND from_label = ? AND from_key = ?
             ORDER BY created_at ASC"
        ))
        .bind(LISTED_RELATION)
        .bind(PERSON_LABEL)
        .bind(&principal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(edge_from_row).collect()
    }

    async fn listings_for_property(
        &self,
        address_key: &str,
    ) -> Result<Vec<LinkEdge>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edge
             WHERE relation = ? AND to_label = ? AND to_key = ?
             ORDER BY created_at ASC"
        ))
        .bind(LISTED_RELATION)
        .bind(PROPERTY_LABEL)
        .bind(address_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(edge_from_row).collect()
    }

    async fn node_count(&self, label: &str) -> Result<i64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM graph_node WHERE label = ?")
            .bind(label)
            .fetch_one(&self.pool)
            .await?
            .try_get::<i64, _>("count")?;
        Ok(count)
    }
}

fn encode_properties(properties: &BTreeMap<String, String>) -> Result<String, RepositoryError> {
    serde_json::to_string(properties)
        .map_err(|error| RepositoryError::Decode(format!("graph properties: {error}")))
}

fn edge_from_row(row: SqliteRow) -> Result<LinkEdge, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PropertyStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown edge status `{status_raw}`")))?;

    Ok(LinkEdge {
        edge_key: row.try_get("edge_key")?,
        principal_id: PrincipalId(row.try_get("from_key")?),
        address_key: row.try_get("to_key")?,
        message_id: MessageId(row.try_get("message_id")?),
        evidence_ref: row.try_get("evidence_ref")?,
        role: row.try_get("role")?,
        status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
