use std::sync::Arc;

use chrono::{Duration, Utc};
use propline_core::domain::message::{InboundMessage, LedgerCompletion, LedgerState, MessageId};
use propline_core::domain::principal::PrincipalId;
use propline_core::flows::IntakeStep;
use propline_core::reconcile::PropertyChange;
use propline_db::repositories::{IntakeWrite, Reservation};
use propline_db::{
    connect_with_settings, migrations, DbPool, DualStoreWriter, GraphStore, GraphSync,
    IntakeRepository, Provenance, RepositoryError, SqlGraphStore, SqlIntakeRepository,
};

async fn open(dir: &tempfile::TempDir, file: &str) -> DbPool {
    let url = format!("sqlite://{}", dir.path().join(file).display());
    let pool = connect_with_settings(&url, 4, 5).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    pool
}

fn principal() -> PrincipalId {
    PrincipalId("+2348055550001".to_string())
}

fn inbound(id: &str) -> InboundMessage {
    InboundMessage {
        message_id: MessageId(id.to_string()),
        sender: "whatsapp:+2348055550001".to_string(),
        body: "14 Marina Rd".to_string(),
        media_ref: None,
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn committed_state_survives_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_pool = open(&dir, "propline.db").await;
    let graph_pool = open(&dir, "graph.db").await;

    let intake = Arc::new(SqlIntakeRepository::new(db_pool.clone()));
    let graph = Arc::new(SqlGraphStore::new(graph_pool.clone()));
    let writer = DualStoreWriter::new(intake.clone(), graph.clone(), 1);

    let snapshot = intake.load_or_create_snapshot(&principal(), Utc::now()).await.expect("load");
    let receipt = writer
        .write(
            IntakeWrite {
                party: snapshot.party,
                expected_marker: "name".to_string(),
                property: Some(PropertyChange::Open {
                    address: "14 Marina Rd".to_string(),
                    role: Some("owner".to_string()),
                }),
                now: Utc::now(),
            },
            &Provenance::message(MessageId("SM-file-1".to_string()), None),
        )
        .await
        .expect("write");
    assert_eq!(receipt.graph, GraphSync::Synced { listings_created: 1 });

    db_pool.close().await;
    graph_pool.close().await;

    let reopened_db = open(&dir, "propline.db").await;
    let reopened_graph = open(&dir, "graph.db").await;
    let intake = SqlIntakeRepository::new(reopened_db.clone());
    let graph = SqlGraphStore::new(reopened_graph.clone());

    let properties = intake.list_properties_for_principal(&principal()).await.expect("list");
    assert_eq!(properties.len(), 1);
    assert_eq!(properties[0].address, "14 Marina Rd");

    let edges = graph.listings_for_property(&properties[0].address_key).await.expect("edges");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].message_id, MessageId("SM-file-1".to_string()));

    reopened_db.close().await;
    reopened_graph.close().await;
}

#[tokio::test]
async fn ledger_reservation_is_shared_across_connections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = open(&dir, "propline.db").await;
    let first = SqlIntakeRepository::new(pool.clone());
    let second = SqlIntakeRepository::new(pool.clone());
    first.load_or_create_snapshot(&principal(), Utc::now()).await.expect("load");

    let lease = Duration::seconds(60);
    let reserved = first
        .reserve_message(&principal(), &inbound("SM-ledger-1"), Utc::now(), lease)
        .await
        .expect("reserve");
    assert_eq!(reserved, Reservation::Fresh);

    match second
        .reserve_message(&principal(), &inbound("SM-ledger-1"), Utc::now(), lease)
        .await
        .expect("reserve")
    {
        Reservation::Duplicate(entry) => assert_eq!(entry.state, LedgerState::Reserved),
        Reservation::Fresh => panic!("second reservation of the same id must be a duplicate"),
    }

    first
        .complete_message(
            &MessageId("SM-ledger-1".to_string()),
            LedgerCompletion {
                step_before: IntakeStep::Address,
                step_after: IntakeStep::Preferences,
                reply: "Thanks! Any tenant preferences?".to_string(),
                outcome: "advanced".to_string(),
            },
            Utc::now(),
        )
        .await
        .expect("complete");

    let stored = second
        .find_message(&MessageId("SM-ledger-1".to_string()))
        .await
        .expect("find")
        .expect("entry");
    assert_eq!(stored.state, LedgerState::Completed);
    assert_eq!(stored.reply.as_deref(), Some("Thanks! Any tenant preferences?"));

    pool.close().await;
}

#[tokio::test]
async fn stale_marker_loses_to_the_committed_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = open(&dir, "propline.db").await;
    let repo = SqlIntakeRepository::new(pool.clone());
    let snapshot = repo.load_or_create_snapshot(&principal(), Utc::now()).await.expect("load");

    let mut named = snapshot.party.clone();
    named.name = Some("Ada Obi".to_string());
    named.name_confirmed_cycle = named.registration_cycle;
    repo.apply_intake(IntakeWrite {
        party: named,
        expected_marker: "name".to_string(),
        property: None,
        now: Utc::now(),
    })
    .await
    .expect("first writer wins");

    let mut stale = snapshot.party;
    stale.name = Some("Someone Else".to_string());
    stale.name_confirmed_cycle = stale.registration_cycle;
    stale.identity =
        Some(propline_core::IdentityDocument::Nin("12345678901".to_string()));
    let error = repo
        .apply_intake(IntakeWrite {
            party: stale,
            expected_marker: "name".to_string(),
            property: None,
            now: Utc::now(),
        })
        .await
        .expect_err("stale writer must conflict");
    assert!(matches!(error, RepositoryError::Conflict(_)));

    let stored = repo.find_snapshot(&principal()).await.expect("find").expect("party");
    assert_eq!(stored.party.name.as_deref(), Some("Ada Obi"));
    assert_eq!(stored.party.step, IntakeStep::Identity);

    pool.close().await;
}
