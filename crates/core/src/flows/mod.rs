pub mod engine;
pub mod states;
pub mod steps;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, PropertyIntakeFlow};
pub use states::{FlowAction, FlowEvent, TransitionOutcome};
pub use steps::{derive_step, IntakeSnapshot, IntakeStep};
