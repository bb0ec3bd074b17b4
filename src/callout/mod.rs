//! # Callout Pipeline
//!
//! Once a request has been parsed, a fixed sequence of checks decides
//! whether it may be forwarded:
//!
//! ```text
//! HostVerify → FollowXff* → AccessCheck → RedirectorCheck → StoreIdCheck
//!            → AdaptedAccessCheck → NoCacheCheck → SslBumpCheck → Done
//! ```
//!
//! Steps run one at a time. A step may suspend on the checklist or a
//! rewrite helper; while it waits the transaction can be aborted, and the
//! pipeline then stops without touching the request again. Any step may
//! deny, which ends the run with an error cause. The SslBump step may also
//! end it by demanding that the client connection be closed.
//!
//! Steps that do not apply to a request (no Host header, no helper, no
//! checklist configured) are skipped and do not appear in the trace.

pub mod checklist;
pub mod context;
pub mod helper;
pub mod host_verify;
pub mod pipeline;
pub mod rules;
pub mod state;
pub mod xff;

pub use checklist::{Answer, CheckRequest, Checklist, ChecklistName, PendingChecks, Verdict};
pub use context::{LivenessToken, Services, Transaction, TransactionContext};
pub use pipeline::{CalloutPipeline, PipelineOutcome, run_callouts};
pub use state::{BumpMode, CalloutStep, ErrorCause, ForwardDecision, Redirect};
