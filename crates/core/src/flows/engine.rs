use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{FlowAction, FlowEvent, TransitionOutcome};
use crate::flows::steps::IntakeStep;

pub trait FlowDefinition {
    fn initial_step(&self) -> IntakeStep;
    fn transition(
        &self,
        current: IntakeStep,
        derived: IntakeStep,
        event: &FlowEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct PropertyIntakeFlow;

impl FlowDefinition for PropertyIntakeFlow {
    fn initial_step(&self) -> IntakeStep {
        IntakeStep::Name
    }

    fn transition(
        &self,
        current: IntakeStep,
        derived: IntakeStep,
        event: &FlowEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_property_intake(current, derived, event)
    }
}

/// Checks every observed step change against the intake order. The step itself
/// always comes from derivation; the engine decides whether the change is
/// legal and what the sender is asked next.
pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_step(&self) -> IntakeStep {
        self.flow.initial_step()
    }

    pub fn apply(
        &self,
        current: IntakeStep,
        derived: IntakeStep,
        event: &FlowEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, derived, event)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: IntakeStep,
        derived: IntakeStep,
        event: &FlowEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, derived, event);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.principal_id.clone(),
                        audit.message_id.clone(),
                        audit.correlation_id.clone(),
                        "intake.transition_applied",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.principal_id.clone(),
                        audit.message_id.clone(),
                        audit.correlation_id.clone(),
                        "intake.transition_rejected",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<PropertyIntakeFlow> {
    fn default() -> Self {
        Self::new(PropertyIntakeFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("step regressed from {from} to {to} without a reset")]
    Regression { from: IntakeStep, to: IntakeStep },
    #[error("accepted fields did not advance past {step}")]
    NotAdvanced { step: IntakeStep },
    #[error("step changed from {from} to {to} although nothing was accepted")]
    UnexpectedAdvance { from: IntakeStep, to: IntakeStep },
    #[error("reset must re-enter at name, derived {derived}")]
    ResetNotAtStart { derived: IntakeStep },
}

fn transition_property_intake(
    current: IntakeStep,
    derived: IntakeStep,
    event: &FlowEvent,
) -> Result<TransitionOutcome, FlowTransitionError> {
    let prompt = |step: IntakeStep| match step {
        IntakeStep::Done => FlowAction::ConfirmCompletion,
        other => FlowAction::PromptForStep(other),
    };

    let follow_up = match event {
        FlowEvent::ResetRequested => {
            if derived != IntakeStep::Name {
                return Err(FlowTransitionError::ResetNotAtStart { derived });
            }
            FlowAction::RestartRegistration
        }
        FlowEvent::NothingAccepted => {
            if derived != current {
                return Err(FlowTransitionError::UnexpectedAdvance { from: current, to: derived });
            }
            prompt(current)
        }
        FlowEvent::FieldsAccepted => {
            if derived < current {
                return Err(FlowTransitionError::Regression { from: current, to: derived });
            }
            if derived == current {
                return Err(FlowTransitionError::NotAdvanced { step: current });
            }
            prompt(derived)
        }
    };

    Ok(TransitionOutcome { from: current, to: derived, event: event.clone(), follow_up })
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::principal::PrincipalId;
    use crate::flows::engine::{FlowEngine, FlowTransitionError, PropertyIntakeFlow};
    use crate::flows::states::{FlowAction, FlowEvent};
    use crate::flows::steps::IntakeStep;

    #[test]
    fn happy_path_advances_through_every_step() {
        let engine = FlowEngine::new(PropertyIntakeFlow);
        let mut step = engine.initial_step();

        for expected in
            [IntakeStep::Identity, IntakeStep::Address, IntakeStep::Preferences, IntakeStep::Done]
        {
            let outcome = engine
                .apply(step, step.next(), &FlowEvent::FieldsAccepted)
                .expect("forward transition");
            assert_eq!(outcome.to, expected);
            step = outcome.to;
        }

        assert_eq!(step, IntakeStep::Done);
    }

    #[test]
    fn address_acceptance_prompts_for_preferences() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(IntakeStep::Address, IntakeStep::Preferences, &FlowEvent::FieldsAccepted)
            .expect("address -> preferences");
        assert_eq!(outcome.follow_up, FlowAction::PromptForStep(IntakeStep::Preferences));
        assert!(outcome.is_single_step());
    }

    #[test]
    fn preferences_acceptance_confirms_completion() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(IntakeStep::Preferences, IntakeStep::Done, &FlowEvent::FieldsAccepted)
            .expect("preferences -> done");
        assert_eq!(outcome.follow_up, FlowAction::ConfirmCompletion);
    }

    #[test]
    fn skipping_a_satisfied_step_prompts_for_the_derived_one() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(IntakeStep::Name, IntakeStep::Address, &FlowEvent::FieldsAccepted)
            .expect("identity already on file");
        assert_eq!(outcome.follow_up, FlowAction::PromptForStep(IntakeStep::Address));
        assert!(!outcome.is_single_step());
    }

    #[test]
    fn regression_without_reset_is_rejected() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(IntakeStep::Address, IntakeStep::Name, &FlowEvent::FieldsAccepted)
            .expect_err("regression must fail");
        assert!(matches!(error, FlowTransitionError::Regression { .. }));
    }

    #[test]
    fn nothing_accepted_keeps_the_step() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(IntakeStep::Identity, IntakeStep::Identity, &FlowEvent::NothingAccepted)
            .expect("re-prompt");
        assert_eq!(outcome.follow_up, FlowAction::PromptForStep(IntakeStep::Identity));

        let error = engine
            .apply(IntakeStep::Identity, IntakeStep::Address, &FlowEvent::NothingAccepted)
            .expect_err("cannot advance without accepted fields");
        assert!(matches!(error, FlowTransitionError::UnexpectedAdvance { .. }));
    }

    #[test]
    fn reset_re_enters_at_name_from_any_step() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(IntakeStep::Done, IntakeStep::Name, &FlowEvent::ResetRequested)
            .expect("reset");
        assert_eq!(outcome.to, IntakeStep::Name);
        assert_eq!(outcome.follow_up, FlowAction::RestartRegistration);
    }

    #[test]
    fn transition_emits_audit_event() {
        let engine = FlowEngine::default();
        let sink = InMemoryAuditSink::default();

        engine
            .apply_with_audit(
                IntakeStep::Name,
                IntakeStep::Identity,
                &FlowEvent::FieldsAccepted,
                &sink,
                &AuditContext::new(
                    Some(PrincipalId("+2348000000001".to_string())),
                    Some("SM42".to_string()),
                    "SM42",
                    "intake-runtime",
                ),
            )
            .expect("transition should succeed");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "intake.transition_applied");
        assert_eq!(events[0].metadata.get("to").map(String::as_str), Some("identity"));
    }
}
