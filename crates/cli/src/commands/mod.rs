pub mod doctor;
pub mod migrate;
pub mod reindex;
pub mod simulate;

use std::future::Future;
use std::sync::Arc;

use propline_agent::{build_client, ExtractionInvoker, IntakeRuntime};
use propline_core::audit::TracingAuditSink;
use propline_core::config::{AppConfig, LoadOptions};
use propline_db::{
    connect_with_settings, migrations, DbPool, DualStoreWriter, SqlGraphStore,
    SqlIntakeRepository,
};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome<T: Serialize> {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<T>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::report(command, message, None::<()>)
    }

    /// Success with a structured `details` object next to the message.
    pub fn report<T: Serialize>(
        command: &str,
        message: impl Into<String>,
        details: Option<T>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            details,
        };
        Self { exit_code: 0, output: serialize_payload(&payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome::<()> {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            details: None,
        };
        Self { exit_code, output: serialize_payload(&payload) }
    }

    pub(crate) fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }
}

/// Error class, message and exit code threaded through command bodies.
pub(crate) type Failure = (&'static str, String, u8);

fn serialize_payload<T: Serialize>(payload: &CommandOutcome<T>) -> String {
    serde_json::to_string(payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config() -> Result<AppConfig, Failure> {
    AppConfig::load(LoadOptions::default())
        .map_err(|error| ("config_validation", format!("configuration issue: {error}"), 2))
}

/// Commands are synchronous entry points; each one drives its own
/// current-thread runtime.
pub(crate) fn block_on<F, T>(future: F) -> Result<T, Failure>
where
    F: Future<Output = Result<T, Failure>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(
        |error| ("runtime_init", format!("failed to initialize async runtime: {error}"), 3),
    )?;
    runtime.block_on(future)
}

pub(crate) struct Stores {
    pub db_pool: DbPool,
    pub graph_pool: DbPool,
}

impl Stores {
    pub(crate) async fn open(config: &AppConfig) -> Result<Self, Failure> {
        let db_pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4))?;
        let graph_pool = connect_with_settings(
            &config.graph.url,
            config.graph.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("graph_connectivity", error.to_string(), 4))?;

        migrations::run_pending(&db_pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5))?;
        migrations::run_pending(&graph_pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5))?;

        Ok(Self { db_pool, graph_pool })
    }

    pub(crate) fn writer(&self, config: &AppConfig) -> DualStoreWriter {
        DualStoreWriter::new(
            Arc::new(SqlIntakeRepository::new(self.db_pool.clone())),
            Arc::new(SqlGraphStore::new(self.graph_pool.clone())),
            config.graph.max_retries,
        )
    }

    pub(crate) fn runtime(&self, config: &AppConfig) -> Result<IntakeRuntime, Failure> {
        let client = build_client(&config.llm)
            .map_err(|error| ("llm_client", error.to_string(), 2))?;
        Ok(IntakeRuntime::new(
            self.writer(config),
            ExtractionInvoker::from_config(client, &config.llm),
            Arc::new(TracingAuditSink),
            config.intake.reset_keyword.clone(),
        ))
    }

    pub(crate) async fn close(self) {
        self.db_pool.close().await;
        self.graph_pool.close().await;
    }
}
