pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod writer;

pub use connection::{connect, connect_with_settings, ping, DbPool};
pub use repositories::{
    GraphStore, InMemoryGraphStore, InMemoryIntakeRepository, IntakeRepository, RepositoryError,
    SqlGraphStore, SqlIntakeRepository,
};
pub use writer::{DualStoreWriter, GraphSync, Provenance, WriteReceipt};
