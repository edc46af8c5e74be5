//! Domain model and pure decision logic for conversational property intake.
//!
//! Nothing in this crate performs I/O. The state deriver, the reconciliation
//! merger and the reply composer are plain functions over owned values, so the
//! runtime can load a fresh snapshot, decide, and hand the result to the stores.

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod reconcile;
pub mod replies;
pub mod validation;

pub use domain::link::{GraphNode, LinkEdge};
pub use domain::message::{InboundMessage, LedgerEntry, LedgerState, MessageId};
pub use domain::party::{IdentityDocument, IdentityKind, PartyRecord};
pub use domain::principal::PrincipalId;
pub use domain::property::{address_key, PropertyId, PropertyRecord, PropertyStatus};
pub use errors::{ApplicationError, DomainError, IntakeError, InterfaceError, StoreKind};
pub use flows::{derive_step, IntakeSnapshot, IntakeStep};
pub use reconcile::{merge, ExtractionDelta, MergeOutcome, PropertyChange};
