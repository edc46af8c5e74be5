use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use propline_core::domain::message::{
    InboundMessage, LedgerCompletion, LedgerEntry, LedgerState, MessageId,
};
use propline_core::domain::party::{IdentityDocument, PartyRecord};
use propline_core::domain::principal::PrincipalId;
use propline_core::domain::property::{
    address_key, PropertyId, PropertyRecord, PropertyStatus, PropertyVerification,
};
use propline_core::flows::{derive_step, IntakeSnapshot, IntakeStep};
use propline_core::reconcile::PropertyChange;

use super::{
    parse_optional_timestamp, parse_timestamp, sortable_timestamp, AppliedIntake,
    IntakeRepository, IntakeWrite, RepositoryError, Reservation,
};
use crate::DbPool;

const PARTY_COLUMNS: &str = "principal_id, name, nin, cac, preferences, step, registration_cycle,
     name_confirmed_cycle, created_at, updated_at";

const PROPERTY_COLUMNS: &str = "id, principal_id, address, address_key, status, preferences, role,
     registration_cycle, confirmed_role, payout_account_name, payout_account_number, verified_at,
     created_at, updated_at";

const MESSAGE_COLUMNS: &str = "message_id, principal_id, state, reserved_at, step_before,
     step_after, reply, outcome, received_at, completed_at";

pub struct SqlIntakeRepository {
    pool: DbPool,
}

impl SqlIntakeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IntakeRepository for SqlIntakeRepository {
    async fn load_or_create_snapshot(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<IntakeSnapshot, RepositoryError> {
        let timestamp = now.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        ensure_principal(&mut tx, principal_id, &timestamp).await?;
        sqlx::query(
            "INSERT INTO party_record (
                principal_id, step, registration_cycle, name_confirmed_cycle, created_at, updated_at
             ) VALUES (?, ?, 1, 0, ?, ?)
             ON CONFLICT(principal_id) DO NOTHING",
        )
        .bind(&principal_id.0)
        .bind(IntakeStep::Name.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

        let snapshot = fetch_snapshot(&mut tx, principal_id).await?;
        tx.commit().await?;

        snapshot.ok_or_else(|| {
            RepositoryError::NotFound(format!("party for principal `{}`", principal_id.0))
        })
    }

    async fn find_snapshot(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<IntakeSnapshot>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_snapshot(&mut conn, principal_id).await
    }

    async fn apply_intake(&self, write: IntakeWrite) -> Result<AppliedIntake, RepositoryError> {
        let IntakeWrite { mut party, expected_marker, property, now } = write;
        let timestamp = now.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        ensure_principal(&mut tx, &party.principal_id, &timestamp).await?;

        let mut reopened = false;
        let touched = match property {
            Some(PropertyChange::Open { address, role }) => {
                let key = address_key(&address);
                let fresh_id = PropertyId::generate();
                sqlx::query(
                    "INSERT INTO property_record (
                        id, principal_id, address, address_key, status, preferences, role,
                        registration_cycle, created_at, updated_at
                     ) VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?)
                     ON CONFLICT(principal_id, address_key) DO UPDATE SET
                        address = excluded.address,
                        role = COALESCE(excluded.role, property_record.role),
                        registration_cycle = excluded.registration_cycle,
                        updated_at = excluded.updated_at",
                )
                .bind(&fresh_id.0)
                .bind(&party.principal_id.0)
                .bind(&address)
                .bind(&key)
                .bind(PropertyStatus::AwaitingPreferences.as_str())
                .bind(role.as_deref())
                .bind(party.registration_cycle)
                .bind(&timestamp)
                .bind(&timestamp)
                .execute(&mut *tx)
                .await?;

                let record = fetch_property_by_key(&mut tx, &party.principal_id, &key)
                    .await?
                    .ok_or_else(|| {
                        RepositoryError::NotFound(format!("property `{key}` after upsert"))
                    })?;
                reopened = record.id != fresh_id;
                Some(record)
            }
            Some(PropertyChange::Update(record)) => {
                let result = sqlx::query(
                    "UPDATE property_record
                     SET status = ?, preferences = ?, role = ?, updated_at = ?
                     WHERE id = ? AND principal_id = ?",
                )
                .bind(record.status.as_str())
                .bind(record.preferences.as_deref())
                .bind(record.role.as_deref())
                .bind(&timestamp)
                .bind(&record.id.0)
                .bind(&party.principal_id.0)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(RepositoryError::NotFound(format!("property `{}`", record.id.0)));
                }
                fetch_property_by_id(&mut tx, &record.id).await?
            }
            None => None,
        };

        let active = match &touched {
            Some(record) if record.registration_cycle == party.registration_cycle => {
                Some(record.clone())
            }
            _ => {
                fetch_active_property(&mut tx, &party.principal_id, party.registration_cycle)
                    .await?
            }
        };

        let mut snapshot = IntakeSnapshot::new(party.clone(), active);
        let target = derive_step(&snapshot);
        party.step = target;
        party.updated_at = now;

        let result = sqlx::query(
            "UPDATE party_record
             SET name = ?, nin = ?, cac = ?, preferences = ?, step = ?, registration_cycle = ?,
                 name_confirmed_cycle = ?, updated_at = ?
             WHERE principal_id = ? AND step IN (?, ?)",
        )
        .bind(party.name.as_deref())
        .bind(party.identity.as_ref().and_then(IdentityDocument::nin))
        .bind(party.identity.as_ref().and_then(IdentityDocument::cac))
        .bind(party.preferences.as_deref())
        .bind(target.as_str())
        .bind(party.registration_cycle)
        .bind(party.name_confirmed_cycle)
        .bind(&timestamp)
        .bind(&party.principal_id.0)
        .bind(&expected_marker)
        .bind(target.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "step marker for `{}` moved away from `{expected_marker}`",
                party.principal_id.0
            )));
        }

        tx.commit().await?;

        snapshot.party = party;
        Ok(AppliedIntake { snapshot, property: touched, reopened })
    }

    async fn find_property(
        &self,
        id: &PropertyId,
    ) -> Result<Option<PropertyRecord>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        fetch_property_by_id(&mut conn, id).await
    }

    async fn list_properties(&self) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM property_record ORDER BY address ASC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(property_from_row).collect()
    }

    async fn list_properties_for_principal(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM property_record
             WHERE principal_id = ?
             ORDER BY created_at ASC"
        ))
        .bind(&principal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(property_from_row).collect()
    }

    async fn find_properties_by_address_key(
        &self,
        address_key: &str,
    ) -> Result<Vec<PropertyRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM property_record
             WHERE address_key = ?
             ORDER BY principal_id ASC"
        ))
        .bind(address_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(property_from_row).collect()
    }

    async fn verify_property(
        &self,
        id: &PropertyId,
        verification: PropertyVerification,
    ) -> Result<PropertyRecord, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut record = fetch_property_by_id(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("property `{}`", id.0)))?;

        record
            .transition_to(PropertyStatus::Verified)
            .map_err(|error| RepositoryError::Conflict(error.to_string()))?;
        record.updated_at = verification.verified_at;

        sqlx::query(
            "UPDATE property_record
             SET status = ?, confirmed_role = ?, payout_account_name = ?,
                 payout_account_number = ?, verified_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(record.status.as_str())
        .bind(&verification.confirmed_role)
        .bind(&verification.payout_account_name)
        .bind(&verification.payout_account_number)
        .bind(verification.verified_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        record.verification = Some(verification);
        Ok(record)
    }

    async fn reserve_message(
        &self,
        principal_id: &PrincipalId,
        message: &InboundMessage,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Reservation, RepositoryError> {
        // Completed entries are never re-taken.
        let result = sqlx::query(
            "INSERT INTO inbound_message (message_id, principal_id, state, reserved_at, received_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE
             SET reserved_at = excluded.reserved_at, received_at = excluded.received_at
             WHERE inbound_message.state = ? AND inbound_message.reserved_at < ?",
        )
        .bind(&message.message_id.0)
        .bind(&principal_id.0)
        .bind(LedgerState::Reserved.as_str())
        .bind(sortable_timestamp(now))
        .bind(message.received_at.to_rfc3339())
        .bind(LedgerState::Reserved.as_str())
        .bind(sortable_timestamp(now - lease))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Reservation::Fresh);
        }

        let entry = self.find_message(&message.message_id).await?.ok_or_else(|| {
            RepositoryError::NotFound(format!("ledger entry `{}`", message.message_id.0))
        })?;
        Ok(Reservation::Duplicate(entry))
    }

    async fn complete_message(
        &self,
        message_id: &MessageId,
        completion: LedgerCompletion,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE inbound_message
             SET state = ?, step_before = ?, step_after = ?, reply = ?, outcome = ?, completed_at = ?
             WHERE message_id = ?",
        )
        .bind(LedgerState::Completed.as_str())
        .bind(completion.step_before.as_str())
        .bind(completion.step_after.as_str())
        .bind(&completion.reply)
        .bind(&completion.outcome)
        .bind(now.to_rfc3339())
        .bind(&message_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_message(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM inbound_message WHERE message_id = ? AND state = ?")
            .bind(&message_id.0)
            .bind(LedgerState::Reserved.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LedgerEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM inbound_message WHERE message_id = ?"
        ))
        .bind(&message_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }
}

async fn ensure_principal(
    conn: &mut SqliteConnection,
    principal_id: &PrincipalId,
    timestamp: &str,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO principal (phone, created_at) VALUES (?, ?) ON CONFLICT(phone) DO NOTHING",
    )
    .bind(&principal_id.0)
    .bind(timestamp)
    .execute(conn)
    .await?;
    Ok(())
}

async fn fetch_snapshot(
    conn: &mut SqliteConnection,
    principal_id: &PrincipalId,
) -> Result<Option<IntakeSnapshot>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {PARTY_COLUMNS} FROM party_record WHERE principal_id = ?"
    ))
    .bind(&principal_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let (party, unrecognized_marker) = party_from_row(row)?;
    let active = fetch_active_property(conn, principal_id, party.registration_cycle).await?;

    let mut snapshot = IntakeSnapshot::new(party, active);
    snapshot.unrecognized_marker = unrecognized_marker;
    Ok(Some(snapshot))
}

async fn fetch_active_property(
    conn: &mut SqliteConnection,
    principal_id: &PrincipalId,
    registration_cycle: i64,
) -> Result<Option<PropertyRecord>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {PROPERTY_COLUMNS} FROM property_record
         WHERE principal_id = ? AND registration_cycle = ?
         ORDER BY updated_at DESC, created_at DESC
         LIMIT 1"
    ))
    .bind(&principal_id.0)
    .bind(registration_cycle)
    .fetch_optional(conn)
    .await?;

    row.map(property_from_row).transpose()
}

async fn fetch_property_by_id(
    conn: &mut SqliteConnection,
    id: &PropertyId,
) -> Result<Option<PropertyRecord>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {PROPERTY_COLUMNS} FROM property_record WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(conn)
        .await?;

    row.map(property_from_row).transpose()
}

async fn fetch_property_by_key(
    conn: &mut SqliteConnection,
    principal_id: &PrincipalId,
    address_key: &str,
) -> Result<Option<PropertyRecord>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {PROPERTY_COLUMNS} FROM property_record WHERE principal_id = ? AND address_key = ?"
    ))
    .bind(&principal_id.0)
    .bind(address_key)
    .fetch_optional(conn)
    .await?;

    row.map(property_from_row).transpose()
}

/// Decodes a party row. An unparsable step marker is returned alongside the
/// record (whose marker falls back to `Name`) so the caller can treat it as a
/// reset.
fn party_from_row(row: SqliteRow) -> Result<(PartyRecord, Option<String>), RepositoryError> {
    let nin = row.try_get::<Option<String>, _>("nin")?;
    let cac = row.try_get::<Option<String>, _>("cac")?;
    let identity = match (nin, cac) {
        (Some(_), Some(_)) => {
            return Err(RepositoryError::Decode(
                "party holds both a NIN and a CAC number".to_string(),
            ))
        }
        (Some(nin), None) => Some(IdentityDocument::Nin(nin)),
        (None, Some(cac)) => Some(IdentityDocument::Cac(cac)),
        (None, None) => None,
    };

    let marker = row.try_get::<String, _>("step")?;
    let (step, unrecognized) = match IntakeStep::parse(&marker) {
        Some(step) => (step, None),
        None => (IntakeStep::Name, Some(marker)),
    };

    let party = PartyRecord {
        principal_id: PrincipalId(row.try_get("principal_id")?),
        name: row.try_get("name")?,
        identity,
        preferences: row.try_get("preferences")?,
        step,
        registration_cycle: row.try_get("registration_cycle")?,
        name_confirmed_cycle: row.try_get("name_confirmed_cycle")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    };
    Ok((party, unrecognized))
}

pub(crate) fn property_from_row(row: SqliteRow) -> Result<PropertyRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PropertyStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown property status `{status_raw}`")))?;

    let verified_at = parse_optional_timestamp("verified_at", row.try_get("verified_at")?)?;
    let verification = match (
        row.try_get::<Option<String>, _>("confirmed_role")?,
        row.try_get::<Option<String>, _>("payout_account_name")?,
        row.try_get::<Option<String>, _>("payout_account_number")?,
        verified_at,
    ) {
        (Some(confirmed_role), Some(payout_account_name), Some(payout_account_number), Some(at)) => {
            Some(PropertyVerification {
                confirmed_role,
                payout_account_name,
                payout_account_number,
                verified_at: at,
            })
        }
        _ => None,
    };

    Ok(PropertyRecord {
        id: PropertyId(row.try_get("id")?),
        principal_id: PrincipalId(row.try_get("principal_id")?),
        address: row.try_get("address")?,
        address_key: row.try_get("address_key")?,
        status,
        preferences: row.try_get("preferences")?,
        role: row.try_get("role")?,
        registration_cycle: row.try_get("registration_cycle")?,
        verification,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<LedgerEntry, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = LedgerState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown ledger state `{state_raw}`")))?;

    let parse_step = |column: &str, value: Option<String>| {
        value
            .map(|raw| {
                IntakeStep::parse(&raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown step in `{column}`: `{raw}`"))
                })
            })
            .transpose()
    };

    Ok(LedgerEntry {
        message_id: MessageId(row.try_get("message_id")?),
        principal_id: PrincipalId(row.try_get("principal_id")?),
        state,
        reserved_at: parse_timestamp("reserved_at", row.try_get("reserved_at")?)?,
        step_before: parse_step("step_before", row.try_get("step_before")?)?,
        step_after: parse_step("step_after", row.try_get("step_after")?)?,
        reply: row.try_get("reply")?,
        outcome: row.try_get("outcome")?,
        received_at: parse_timestamp("received_at", row.try_get("received_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}
