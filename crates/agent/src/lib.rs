//! Conversation side of property intake.
//!
//! - `extraction` builds the step-scoped prompt, calls the extraction
//!   capability and checks its output against the strict key set.
//! - `llm` holds the capability clients (OpenAI-compatible, Anthropic) behind
//!   the `LlmClient` trait; `conversation` holds the offline rule-based one.
//! - `runtime` drives one inbound message through derivation, extraction,
//!   merge and the two-store write, and always produces a reply.
//!
//! The extraction capability only proposes values. Whether a value is accepted,
//! and which step comes next, is decided by the deterministic core.

pub mod conversation;
pub mod extraction;
pub mod llm;
pub mod runtime;

pub use conversation::RuleBasedExtractor;
pub use extraction::{Extraction, ExtractionInvoker};
pub use llm::{build_client, CompletionRequest, LlmClient};
pub use runtime::{IntakeRuntime, TurnOutcome, TurnReply};
