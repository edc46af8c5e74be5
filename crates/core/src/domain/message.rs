use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;
use crate::flows::steps::IntakeStep;

/// Provider message id (e.g. a Twilio `MessageSid`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub sender: String,
    pub body: String,
    pub media_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Reserved,
    Completed,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reserved" => Some(Self::Reserved),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One processed (or in-flight) inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: MessageId,
    pub principal_id: PrincipalId,
    pub state: LedgerState,
    /// When the current reservation was taken; a stale one may be re-taken.
    pub reserved_at: DateTime<Utc>,
    pub step_before: Option<IntakeStep>,
    pub step_after: Option<IntakeStep>,
    pub reply: Option<String>,
    pub outcome: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerCompletion {
    pub step_before: IntakeStep,
    pub step_after: IntakeStep,
    pub reply: String,
    pub outcome: String,
}
