use crate::commands::{block_on, load_config, CommandResult, Stores};

/// Applies pending migrations to both the relational and the graph store.
pub fn run() -> CommandResult {
    let result = load_config().and_then(|config| {
        block_on(async {
            let stores = Stores::open(&config).await?;
            stores.close().await;
            Ok(())
        })
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
