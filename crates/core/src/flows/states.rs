use serde::{Deserialize, Serialize};

use crate::flows::steps::IntakeStep;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// The merger accepted at least one field for the active step.
    FieldsAccepted,
    /// Nothing usable was extracted, or the extraction failed.
    NothingAccepted,
    /// Explicit reset directive from the sender.
    ResetRequested,
}

/// What the sender is told next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    PromptForStep(IntakeStep),
    ConfirmCompletion,
    RestartRegistration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: IntakeStep,
    pub to: IntakeStep,
    pub event: FlowEvent,
    pub follow_up: FlowAction,
}

impl TransitionOutcome {
    /// True when the change moved exactly one step forward. Facts already on
    /// file (an identity kept across a reset, a reopened address) can carry
    /// derivation further.
    pub fn is_single_step(&self) -> bool {
        self.to == self.from.next()
    }
}
