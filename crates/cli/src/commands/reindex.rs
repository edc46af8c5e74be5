use chrono::Utc;
use propline_core::domain::principal::PrincipalId;
use propline_core::errors::ApplicationError;
use propline_db::GraphSync;
use serde::Serialize;

use crate::commands::{block_on, load_config, CommandResult, Stores};

#[derive(Debug, Serialize)]
struct ReindexDetails {
    principal: String,
    listings_created: usize,
}

/// Rebuilds a principal's graph nodes and edges from relational state.
pub fn run(principal: &str) -> CommandResult {
    let principal = match PrincipalId::parse(principal) {
        Ok(principal) => principal,
        Err(error) => {
            return CommandResult::failure("reindex", "invalid_principal", error.to_string(), 2)
        }
    };

    let result = load_config().and_then(|config| {
        block_on(async {
            let stores = Stores::open(&config).await?;
            let outcome = stores.writer(&config).reindex_principal(&principal, Utc::now()).await;
            stores.close().await;
            outcome.map_err(|error| match error {
                ApplicationError::NotFound(message) => ("not_found", message, 6),
                other => ("persistence", other.to_string(), 4),
            })
        })
    });

    match result {
        Ok(GraphSync::Synced { listings_created }) => CommandResult::report(
            "reindex",
            format!("graph index rebuilt for {principal}"),
            Some(ReindexDetails { principal: principal.0.clone(), listings_created }),
        ),
        Ok(GraphSync::Failed { attempts, message }) => CommandResult::failure(
            "reindex",
            "graph_write",
            format!("graph store rejected the rebuild after {attempts} attempts: {message}"),
            7,
        ),
        Err(failure) => CommandResult::from_failure("reindex", failure),
    }
}
