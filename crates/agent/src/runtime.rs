use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use propline_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use propline_core::domain::message::{InboundMessage, LedgerCompletion, LedgerEntry, LedgerState};
use propline_core::domain::principal::PrincipalId;
use propline_core::errors::{IntakeError, Severity, StoreKind};
use propline_core::flows::{
    derive_step, FlowAction, FlowEngine, FlowEvent, IntakeSnapshot, IntakeStep,
    PropertyIntakeFlow, TransitionOutcome,
};
use propline_core::reconcile::merge;
use propline_core::replies;
use propline_db::repositories::{IntakeRepository, IntakeWrite, Reservation};
use propline_db::writer::{DualStoreWriter, Provenance};

use crate::extraction::ExtractionInvoker;

const ACTOR: &str = "intake-runtime";
const GREETINGS: &[&str] = &["start", "hi", "hello", "hey"];
/// Added to the extraction timeout to bound how long a reservation may stay
/// in flight before a redelivery takes it over.
const RESERVATION_MARGIN_SECS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Greeted,
    Reset,
    Advanced,
    Reprompted,
    ValidationRejected,
    OracleFailed,
    AlreadyComplete,
    MediaOnly,
    StoreFailed,
    InvalidSender,
    Replayed,
    InFlight,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeted => "greeted",
            Self::Reset => "reset",
            Self::Advanced => "advanced",
            Self::Reprompted => "reprompted",
            Self::ValidationRejected => "validation_rejected",
            Self::OracleFailed => "oracle_failed",
            Self::AlreadyComplete => "already_complete",
            Self::MediaOnly => "media_only",
            Self::StoreFailed => "store_failed",
            Self::InvalidSender => "invalid_sender",
            Self::Replayed => "replayed",
            Self::InFlight => "in_flight",
        }
    }
}

/// What the transport sends back for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnReply {
    pub reply: String,
    pub outcome: TurnOutcome,
    /// Step after this message, when known.
    pub step: Option<IntakeStep>,
    pub graph_degraded: bool,
}

struct Turn {
    reply: String,
    outcome: TurnOutcome,
    step_before: IntakeStep,
    step_after: IntakeStep,
    graph_degraded: bool,
}

impl Turn {
    fn unchanged(step: IntakeStep, outcome: TurnOutcome, reply: String) -> Self {
        Self { reply, outcome, step_before: step, step_after: step, graph_degraded: false }
    }
}

/// Runs one inbound message end to end: ledger reservation, derivation,
/// extraction, merge, the two-store write and the reply. Never fails; every
/// error becomes a plain reply.
pub struct IntakeRuntime {
    writer: DualStoreWriter,
    invoker: ExtractionInvoker,
    engine: FlowEngine<PropertyIntakeFlow>,
    audit: Arc<dyn AuditSink>,
    reset_keyword: String,
    reservation_lease: Duration,
    locks: Mutex<HashMap<PrincipalId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IntakeRuntime {
    pub fn new(
        writer: DualStoreWriter,
        invoker: ExtractionInvoker,
        audit: Arc<dyn AuditSink>,
        reset_keyword: impl Into<String>,
    ) -> Self {
        let reservation_lease = Duration::from_std(invoker.timeout())
            .unwrap_or_else(|_| Duration::seconds(0))
            + Duration::seconds(RESERVATION_MARGIN_SECS);
        Self {
            writer,
            invoker,
            engine: FlowEngine::default(),
            audit,
            reset_keyword: reset_keyword.into(),
            reservation_lease,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn writer(&self) -> &DualStoreWriter {
        &self.writer
    }

    fn intake(&self) -> &dyn IntakeRepository {
        self.writer.intake().as_ref()
    }

    pub async fn handle_inbound(&self, message: InboundMessage) -> TurnReply {
        let principal = match PrincipalId::parse(&message.sender) {
            Ok(principal) => principal,
            Err(error) => {
                warn!(
                    event_name = "intake.invalid_sender",
                    correlation_id = %message.message_id.0,
                    error = %error,
                    "inbound message has an unusable sender id"
                );
                return TurnReply {
                    reply: replies::CONTINUATION.to_string(),
                    outcome: TurnOutcome::InvalidSender,
                    step: None,
                    graph_degraded: false,
                };
            }
        };

        let lock = self.principal_lock(&principal);
        let _guard = lock.lock().await;

        let reservation = self
            .intake()
            .reserve_message(&principal, &message, Utc::now(), self.reservation_lease)
            .await;
        match reservation {
            Ok(Reservation::Fresh) => {}
            Ok(Reservation::Duplicate(entry)) => return self.replay(&principal, entry),
            Err(error) => {
                error!(
                    event_name = "intake.ledger_unavailable",
                    principal = %principal,
                    correlation_id = %message.message_id.0,
                    error = %error,
                    "could not reserve inbound message"
                );
                return TurnReply {
                    reply: replies::resend(),
                    outcome: TurnOutcome::StoreFailed,
                    step: None,
                    graph_degraded: false,
                };
            }
        }

        let turn = self.process(&principal, &message).await;

        if turn.outcome == TurnOutcome::StoreFailed {
            self.release(&message).await;
        } else {
            let completion = LedgerCompletion {
                step_before: turn.step_before,
                step_after: turn.step_after,
                reply: turn.reply.clone(),
                outcome: turn.outcome.as_str().to_string(),
            };
            if let Err(error) =
                self.intake().complete_message(&message.message_id, completion, Utc::now()).await
            {
                warn!(
                    event_name = "intake.ledger_complete_failed",
                    correlation_id = %message.message_id.0,
                    error = %error,
                    "could not record reply in the message ledger; releasing reservation"
                );
                self.release(&message).await;
            }
        }

        info!(
            event_name = "intake.turn_completed",
            principal = %principal,
            correlation_id = %message.message_id.0,
            step_before = %turn.step_before,
            step = %turn.step_after,
            outcome = turn.outcome.as_str(),
            graph_degraded = turn.graph_degraded,
            "inbound message handled"
        );

        TurnReply {
            reply: turn.reply,
            outcome: turn.outcome,
            step: Some(turn.step_after),
            graph_degraded: turn.graph_degraded,
        }
    }

    async fn process(&self, principal: &PrincipalId, message: &InboundMessage) -> Turn {
        let now = Utc::now();
        let audit = AuditContext::new(
            Some(principal.clone()),
            Some(message.message_id.0.clone()),
            message.message_id.0.clone(),
            ACTOR,
        );
        self.audit.emit(
            AuditEvent::new(
                audit.principal_id.clone(),
                audit.message_id.clone(),
                audit.correlation_id.clone(),
                "intake.message_received",
                AuditCategory::Ingress,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("has_media", message.media_ref.is_some().to_string()),
        );

        let snapshot = match self.intake().load_or_create_snapshot(principal, now).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                return self.store_failure(
                    IntakeStep::Name,
                    IntakeError::StoreWrite {
                        store: StoreKind::Relational,
                        message: error.to_string(),
                    },
                    &audit,
                )
            }
        };
        let marker = snapshot
            .unrecognized_marker
            .clone()
            .unwrap_or_else(|| snapshot.party.step.as_str().to_string());
        let step = derive_step(&snapshot);
        let text = message.body.trim();

        if let Some(raw) = &snapshot.unrecognized_marker {
            let error = IntakeError::UnknownStep(raw.clone());
            warn!(
                event_name = "intake.unknown_step",
                principal = %principal,
                correlation_id = %audit.correlation_id,
                error = %error,
                "stored step marker is unreadable; restarting registration"
            );
            return self.reset(snapshot, marker, IntakeStep::Name, message, &audit, now).await;
        }
        if text.eq_ignore_ascii_case(self.reset_keyword.trim()) {
            return self.reset(snapshot, marker, step, message, &audit, now).await;
        }
        if is_greeting(text) {
            return Turn::unchanged(step, TurnOutcome::Greeted, replies::welcome(step));
        }
        if text.is_empty() {
            return match message.media_ref {
                Some(_) => Turn::unchanged(step, TurnOutcome::MediaOnly, replies::media_only(step)),
                None => Turn::unchanged(step, TurnOutcome::Reprompted, replies::continuation(step)),
            };
        }
        if step == IntakeStep::Done {
            return Turn::unchanged(
                step,
                TurnOutcome::AlreadyComplete,
                replies::completion(&self.reset_keyword),
            );
        }

        let extraction = match self.invoker.extract(step, text).await {
            Ok(extraction) => extraction,
            Err(error) => {
                self.audit.emit(
                    AuditEvent::new(
                        audit.principal_id.clone(),
                        audit.message_id.clone(),
                        audit.correlation_id.clone(),
                        "intake.extraction_failed",
                        AuditCategory::Extraction,
                        ACTOR,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("error_kind", error.kind())
                    .with_metadata("step", step.as_str()),
                );
                self.check_transition(step, step, FlowEvent::NothingAccepted, &audit);
                return Turn::unchanged(
                    step,
                    TurnOutcome::OracleFailed,
                    replies::continuation(step),
                );
            }
        };

        let outcome = merge(&snapshot, &extraction.delta, step, now);
        if outcome.is_noop() {
            self.check_transition(step, step, FlowEvent::NothingAccepted, &audit);
            if let Some((field, failure)) = outcome.validation_failure() {
                let error = IntakeError::Validation {
                    field: field.as_str(),
                    message: failure.to_string(),
                };
                info!(
                    event_name = "intake.validation_rejected",
                    principal = %principal,
                    correlation_id = %audit.correlation_id,
                    step = %step,
                    error = %error,
                    "extracted value rejected"
                );
                return Turn::unchanged(
                    step,
                    TurnOutcome::ValidationRejected,
                    replies::validation_retry(field, failure, step),
                );
            }
            return Turn::unchanged(step, TurnOutcome::Reprompted, replies::continuation(step));
        }

        let write = IntakeWrite {
            party: outcome.party,
            expected_marker: marker,
            property: outcome.property,
            now,
        };
        let provenance =
            Provenance::message(message.message_id.clone(), message.media_ref.clone());
        let receipt = match self.writer.write(write, &provenance).await {
            Ok(receipt) => receipt,
            Err(error) => return self.store_failure(step, error, &audit),
        };

        let derived = receipt.applied.snapshot.party.step;
        let transition = self.check_transition(step, derived, FlowEvent::FieldsAccepted, &audit);
        let graph_degraded = self.note_graph_failure(&receipt.graph.error(), &audit);

        let reply = match transition {
            Some(transition) => self.follow_up_reply(&transition, extraction.reply),
            None => self.prompt_for(derived),
        };

        Turn {
            reply,
            outcome: TurnOutcome::Advanced,
            step_before: step,
            step_after: derived,
            graph_degraded,
        }
    }

    /// Starts a new registration cycle. Nothing is deleted; the name becomes
    /// unconfirmed and no property is active, so derivation re-enters at name.
    async fn reset(
        &self,
        snapshot: IntakeSnapshot,
        marker: String,
        step: IntakeStep,
        message: &InboundMessage,
        audit: &AuditContext,
        now: chrono::DateTime<Utc>,
    ) -> Turn {
        let mut party = snapshot.party;
        party.begin_new_registration();
        let write = IntakeWrite { party, expected_marker: marker, property: None, now };
        let provenance =
            Provenance::message(message.message_id.clone(), message.media_ref.clone());

        let receipt = match self.writer.write(write, &provenance).await {
            Ok(receipt) => receipt,
            Err(error) => return self.store_failure(step, error, audit),
        };
        let derived = receipt.applied.snapshot.party.step;
        let transition = self.check_transition(step, derived, FlowEvent::ResetRequested, audit);
        let graph_degraded = self.note_graph_failure(&receipt.graph.error(), audit);

        Turn {
            reply: transition
                .map(|transition| self.follow_up_reply(&transition, None))
                .unwrap_or_else(replies::after_reset),
            outcome: TurnOutcome::Reset,
            step_before: step,
            step_after: derived,
            graph_degraded,
        }
    }

    fn replay(&self, principal: &PrincipalId, entry: LedgerEntry) -> TurnReply {
        info!(
            event_name = "intake.duplicate_message",
            principal = %principal,
            correlation_id = %entry.message_id.0,
            state = entry.state.as_str(),
            "inbound message already seen"
        );
        match (entry.state, entry.reply) {
            (LedgerState::Completed, Some(reply)) => TurnReply {
                reply,
                outcome: TurnOutcome::Replayed,
                step: entry.step_after,
                graph_degraded: false,
            },
            _ => TurnReply {
                reply: replies::IN_PROGRESS.to_string(),
                outcome: TurnOutcome::InFlight,
                step: entry.step_after,
                graph_degraded: false,
            },
        }
    }

    async fn release(&self, message: &InboundMessage) {
        if let Err(error) = self.intake().release_message(&message.message_id).await {
            warn!(
                event_name = "intake.ledger_release_failed",
                correlation_id = %message.message_id.0,
                error = %error,
                "could not release reservation; it frees up once its lease runs out"
            );
        }
    }

    fn check_transition(
        &self,
        from: IntakeStep,
        to: IntakeStep,
        event: FlowEvent,
        audit: &AuditContext,
    ) -> Option<TransitionOutcome> {
        match self.engine.apply_with_audit(from, to, &event, self.audit.as_ref(), audit) {
            Ok(transition) => Some(transition),
            Err(error) => {
                warn!(
                    event_name = "intake.unexpected_transition",
                    correlation_id = %audit.correlation_id,
                    from = %from,
                    to = %to,
                    error = %error,
                    "derived step change is outside the intake order"
                );
                None
            }
        }
    }

    /// `drafted` is the extraction's own reply, written to ask for the step
    /// after the one it extracted for. It is only sent when that is where the
    /// sender actually landed.
    fn follow_up_reply(&self, transition: &TransitionOutcome, drafted: Option<String>) -> String {
        match transition.follow_up {
            FlowAction::ConfirmCompletion => replies::completion(&self.reset_keyword),
            FlowAction::RestartRegistration => replies::after_reset(),
            FlowAction::PromptForStep(next) if transition.is_single_step() => {
                drafted.unwrap_or_else(|| replies::step_prompt(next))
            }
            FlowAction::PromptForStep(next) => replies::step_prompt(next),
        }
    }

    fn prompt_for(&self, step: IntakeStep) -> String {
        match step {
            IntakeStep::Done => replies::completion(&self.reset_keyword),
            other => replies::step_prompt(other),
        }
    }

    fn note_graph_failure(&self, error: &Option<IntakeError>, audit: &AuditContext) -> bool {
        let Some(error) = error else {
            return false;
        };
        self.audit.emit(
            AuditEvent::new(
                audit.principal_id.clone(),
                audit.message_id.clone(),
                audit.correlation_id.clone(),
                "intake.graph_degraded",
                AuditCategory::Persistence,
                ACTOR,
                AuditOutcome::Failed,
            )
            .with_metadata("error", error.to_string()),
        );
        true
    }

    fn store_failure(&self, step: IntakeStep, error: IntakeError, audit: &AuditContext) -> Turn {
        if error.severity() == Severity::Severe {
            error!(
                event_name = "intake.store_failed",
                correlation_id = %audit.correlation_id,
                error_kind = error.kind(),
                error = %error,
                "intake write failed; asking sender to resend"
            );
        } else {
            warn!(
                event_name = "intake.store_failed",
                correlation_id = %audit.correlation_id,
                error_kind = error.kind(),
                error = %error,
                "intake write failed; asking sender to resend"
            );
        }
        Turn::unchanged(step, TurnOutcome::StoreFailed, replies::resend())
    }

    fn principal_lock(&self, principal: &PrincipalId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(principal.clone()).or_default().clone()
    }
}

fn is_greeting(text: &str) -> bool {
    let word = text.trim_end_matches(&['!', '.'][..]).trim();
    GREETINGS.iter().any(|greeting| word.eq_ignore_ascii_case(greeting))
}
