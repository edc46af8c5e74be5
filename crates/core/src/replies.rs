//! Deterministic reply texts. The extraction capability may phrase its own reply
//! when a step advances; everything else the sender sees comes from here.

use crate::domain::party::IdentityKind;
use crate::flows::steps::IntakeStep;
use crate::reconcile::DeltaField;
use crate::validation::{identity_kind_hint, ValidationFailure};

pub const WELCOME: &str = "Welcome to Propline! We'll register your property in a few quick steps.";
pub const RESET_NOTICE: &str = "No problem, let's start a new registration.";
pub const CONTINUATION: &str =
    "Sorry, I didn't quite catch that. Let's try again.";
pub const RESEND: &str =
    "Sorry, we couldn't save that just now. Please send your last message again.";
pub const MEDIA_ONLY: &str = "Thanks for the attachment. Please reply with text.";
pub const IN_PROGRESS: &str = "We're still working on your last message. One moment please.";

pub fn step_prompt(step: IntakeStep) -> String {
    match step {
        IntakeStep::Name => "What is your full name?".to_string(),
        IntakeStep::Identity => format!(
            "Please send your NIN ({}) or your CAC registration number ({}).",
            identity_kind_hint(IdentityKind::Nin),
            identity_kind_hint(IdentityKind::Cac)
        ),
        IntakeStep::Address => {
            "What is the address of the property you want to list? You can also tell us if you are the owner, agent or landlord.".to_string()
        }
        IntakeStep::Preferences => {
            "Any tenant preferences for this property? For example: no pets, families only.".to_string()
        }
        IntakeStep::Done => "Your registration is complete.".to_string(),
    }
}

pub fn completion(reset_keyword: &str) -> String {
    format!(
        "Thank you! Your property has been submitted for verification. Send {} to register another property.",
        reset_keyword.to_uppercase()
    )
}

pub fn welcome(step: IntakeStep) -> String {
    format!("{WELCOME} {}", step_prompt(step))
}

pub fn after_reset() -> String {
    format!("{RESET_NOTICE} {}", step_prompt(IntakeStep::Name))
}

pub fn continuation(step: IntakeStep) -> String {
    format!("{CONTINUATION} {}", step_prompt(step))
}

pub fn media_only(step: IntakeStep) -> String {
    format!("{MEDIA_ONLY} {}", step_prompt(step))
}

pub fn resend() -> String {
    RESEND.to_string()
}

pub fn validation_retry(field: DeltaField, failure: &ValidationFailure, step: IntakeStep) -> String {
    let subject = match field {
        DeltaField::Name => "name",
        DeltaField::IdentityDocument => "ID number",
        DeltaField::Address => "address",
        DeltaField::Role => "role",
        DeltaField::Preferences => "preferences",
    };
    let detail = match failure {
        ValidationFailure::Empty | ValidationFailure::Placeholder(_) => {
            "it looks like it was left blank".to_string()
        }
        ValidationFailure::Malformed(reason) => reason.clone(),
    };
    format!("That {subject} doesn't look right ({detail}). {}", step_prompt(step))
}

#[cfg(test)]
mod tests {
    use super::{after_reset, completion, continuation, step_prompt, validation_retry, welcome};
    use crate::flows::steps::IntakeStep;
    use crate::reconcile::DeltaField;
    use crate::validation::ValidationFailure;

    #[test]
    fn each_step_has_a_distinct_prompt() {
        let prompts: Vec<String> = IntakeStep::ORDER.iter().map(|step| step_prompt(*step)).collect();
        for (index, prompt) in prompts.iter().enumerate() {
            assert!(!prompt.is_empty());
            assert!(!prompts[index + 1..].contains(prompt));
        }
        assert!(step_prompt(IntakeStep::Identity).contains("NIN"));
    }

    #[test]
    fn completion_mentions_the_configured_reset_keyword() {
        assert!(completion("again").contains("Send AGAIN"));
    }

    #[test]
    fn composed_replies_end_with_the_step_prompt() {
        assert!(welcome(IntakeStep::Name).ends_with(&step_prompt(IntakeStep::Name)));
        assert!(after_reset().ends_with(&step_prompt(IntakeStep::Name)));
        assert!(continuation(IntakeStep::Address).ends_with(&step_prompt(IntakeStep::Address)));
    }

    #[test]
    fn validation_retry_names_the_field_and_reason() {
        let reply = validation_retry(
            DeltaField::IdentityDocument,
            &ValidationFailure::Malformed("a NIN must be exactly 11 digits, got 7".to_string()),
            IntakeStep::Identity,
        );
        assert!(reply.contains("ID number"));
        assert!(reply.contains("11 digits, got 7"));
    }
}
