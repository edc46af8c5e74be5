use chrono::Utc;
use propline_core::domain::message::{InboundMessage, MessageId};
use serde::Serialize;
use uuid::Uuid;

use crate::commands::{block_on, load_config, CommandResult, Stores};

#[derive(Debug, Serialize)]
struct SimulateDetails {
    message_id: String,
    reply: String,
    outcome: &'static str,
    step: Option<String>,
    graph_degraded: bool,
}

/// Pushes one message through the intake runtime against the configured
/// stores, exactly as the webhook would.
pub fn run(from: &str, message_id: Option<&str>, text: &str) -> CommandResult {
    let message_id = message_id
        .map(str::to_string)
        .unwrap_or_else(|| format!("SIM-{}", Uuid::new_v4().simple()));

    let result = load_config().and_then(|config| {
        block_on(async {
            let stores = Stores::open(&config).await?;
            let runtime = stores.runtime(&config)?;
            let turn = runtime
                .handle_inbound(InboundMessage {
                    message_id: MessageId(message_id.clone()),
                    sender: from.to_string(),
                    body: text.to_string(),
                    media_ref: None,
                    received_at: Utc::now(),
                })
                .await;
            stores.close().await;
            tracing::info!(
                event_name = "cli.simulate.completed",
                correlation_id = %message_id,
                outcome = turn.outcome.as_str(),
                "simulated inbound message"
            );
            Ok(turn)
        })
    });

    match result {
        Ok(turn) => CommandResult::report(
            "simulate",
            turn.reply.clone(),
            Some(SimulateDetails {
                message_id,
                reply: turn.reply,
                outcome: turn.outcome.as_str(),
                step: turn.step.map(|step| step.to_string()),
                graph_degraded: turn.graph_degraded,
            }),
        ),
        Err(failure) => CommandResult::from_failure("simulate", failure),
    }
}
