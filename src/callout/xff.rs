//! X-Forwarded-For walking.
//!
//! Starting from the direct client, each visit asks whether the current
//! client may assert the address to its left. If so, the right-most
//! remaining token becomes the new indirect client and the step repeats.
//! The walk ends at the first denial, at an unparsable token, or when the
//! header runs out.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::callout::checklist::ChecklistName;
use crate::callout::context::TransactionContext;
use crate::callout::state::StepResult;
use crate::http::request::Request;

pub const HEADER: &str = "X-Forwarded-For";

/// Tokens still to be examined, left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XffWalk {
    remaining: Vec<String>,
    checks: usize,
}

impl XffWalk {
    pub fn from_header(value: &str) -> Self {
        Self {
            remaining: value
                .split(|c: char| c == ',' || c.is_ascii_whitespace())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            checks: 0,
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        self.remaining.pop()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Checklist consultations made so far.
    pub fn checks(&self) -> usize {
        self.checks
    }
}

pub fn applies(request: &Request, ctx: &TransactionContext) -> bool {
    ctx.config.follow_x_forwarded_for.enabled
        && ctx.config.access.is_configured(ChecklistName::FollowXForwardedFor)
        && !request.flags.done_follow_xff
        && request.headers.contains(HEADER)
}

/// One visit of the step.
pub async fn visit(
    request: &mut Request,
    walk: &mut Option<XffWalk>,
    ctx: &TransactionContext,
) -> Option<StepResult> {
    let walk = walk.get_or_insert_with(|| {
        // the direct client is always trusted for actual use
        request.indirect_client_addr = request.client_addr.ip();
        XffWalk::from_header(&request.headers.get_list(HEADER).unwrap_or_default())
    });

    if walk.is_exhausted() {
        return Some(finish(request, walk));
    }

    let current = request.indirect_client_addr;
    let answer = ctx
        .ask_from(ChecklistName::FollowXForwardedFor, current, request)
        .await?;
    walk.checks += 1;

    if !answer.is_allowed() {
        debug!(client = %current, "untrusted X-Forwarded-For hop");
        return Some(finish(request, walk));
    }

    let Some(token) = walk.pop() else {
        return Some(finish(request, walk));
    };
    match parse_token(&token) {
        Some(addr) => {
            debug!(from = %current, to = %addr, "following X-Forwarded-For");
            request.indirect_client_addr = addr;
            Some(StepResult::Repeat)
        }
        None => {
            warn!(token = %token, client = %current, "unparsable X-Forwarded-For entry; stopping");
            Some(finish(request, walk))
        }
    }
}

fn finish(request: &mut Request, walk: &XffWalk) -> StepResult {
    request.flags.done_follow_xff = true;
    debug!(
        indirect_client = %request.indirect_client_addr,
        checks = walk.checks,
        "X-Forwarded-For walk finished"
    );
    StepResult::Advance
}

fn parse_token(token: &str) -> Option<IpAddr> {
    let bare = token
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(token);
    bare.parse().ok()
}
