//! Pipeline states and the transition function.
//!
//! ```text
//!  HostVerify -> FollowXff -> AccessCheck -> RedirectorCheck -> StoreIdCheck
//!                 ^      |
//!                 +------+ (one visit per trusted hop)
//!
//!  -> AdaptedAccessCheck -> NoCacheCheck -> SslBumpCheck -> Done
//!
//!  any step --deny--> DeniedWith(cause)     any step --close--> MustClose
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::http::response::StatusCode;
use crate::http::url::RequestUrl;

/// One callout, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalloutStep {
    HostVerify,
    FollowXff,
    AccessCheck,
    RedirectorCheck,
    StoreIdCheck,
    AdaptedAccessCheck,
    NoCacheCheck,
    SslBumpCheck,
}

impl CalloutStep {
    pub const FIRST: CalloutStep = CalloutStep::HostVerify;

    /// The step after this one in the fixed order.
    pub fn next(self) -> Option<CalloutStep> {
        use CalloutStep::*;
        match self {
            HostVerify => Some(FollowXff),
            FollowXff => Some(AccessCheck),
            AccessCheck => Some(RedirectorCheck),
            RedirectorCheck => Some(StoreIdCheck),
            StoreIdCheck => Some(AdaptedAccessCheck),
            AdaptedAccessCheck => Some(NoCacheCheck),
            NoCacheCheck => Some(SslBumpCheck),
            SslBumpCheck => None,
        }
    }

    /// Only FollowXff may run more than once per transaction.
    pub fn may_repeat(self) -> bool {
        self == CalloutStep::FollowXff
    }
}

/// Why a transaction was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorCause {
    #[error("access denied")]
    AccessDenied,
    /// Credentials are needed; carries the challenge status (401 or 407),
    /// or 403 where a challenge cannot be delivered.
    #[error("authentication required")]
    AuthRequired(StatusCode),
    #[error("Host header conflicts with destination")]
    HostConflict,
    #[error("gateway failure: {0}")]
    GatewayFailure(String),
}

impl ErrorCause {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCause::AccessDenied => StatusCode::Forbidden,
            ErrorCause::AuthRequired(status) => *status,
            ErrorCause::HostConflict => StatusCode::Conflict,
            ErrorCause::GatewayFailure(_) => StatusCode::InternalServerError,
        }
    }

    /// Security-sensitive denials end the client connection after the
    /// error response.
    pub fn closes_connection(&self) -> bool {
        matches!(self, ErrorCause::HostConflict)
    }
}

/// What to do with a CONNECT tunnel on a bump-capable port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpMode {
    Bump,
    Splice,
    Peek,
    Stare,
    Terminate,
}

impl BumpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BumpMode::Bump => "bump",
            BumpMode::Splice => "splice",
            BumpMode::Peek => "peek",
            BumpMode::Stare => "stare",
            BumpMode::Terminate => "terminate",
        }
    }
}

impl fmt::Display for BumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bump" => Ok(BumpMode::Bump),
            "splice" => Ok(BumpMode::Splice),
            "peek" => Ok(BumpMode::Peek),
            "stare" => Ok(BumpMode::Stare),
            "terminate" => Ok(BumpMode::Terminate),
            other => Err(format!("unknown bump mode {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: StatusCode,
    pub location: String,
}

/// Decisions made by the pipeline for the stages after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardDecision {
    /// Answer the client with a redirect instead of forwarding.
    pub redirect: Option<Redirect>,
    /// Set for CONNECT requests that went through the bump decision.
    pub bump: Option<BumpMode>,
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Advance,
    /// Visit the same step again.
    Repeat,
    /// Replace the request with one aimed at this URL, then advance.
    Rewrite(RequestUrl),
    Deny(ErrorCause),
    Close(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Running(CalloutStep),
    Done,
    DeniedWith(ErrorCause),
    MustClose(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Running(_))
    }
}

/// The transition function.
///
/// `Rewrite` has already been applied to the request by the engine and
/// advances like `Advance`.
pub fn transition(step: CalloutStep, result: &StepResult) -> PipelineState {
    match result {
        StepResult::Advance | StepResult::Rewrite(_) => match step.next() {
            Some(next) => PipelineState::Running(next),
            None => PipelineState::Done,
        },
        StepResult::Repeat if step.may_repeat() => PipelineState::Running(step),
        StepResult::Repeat => {
            tracing::error!(step = ?step, "step asked to repeat; advancing instead");
            transition(step, &StepResult::Advance)
        }
        StepResult::Deny(cause) => PipelineState::DeniedWith(cause.clone()),
        StepResult::Close(reason) => PipelineState::MustClose(reason.clone()),
    }
}
