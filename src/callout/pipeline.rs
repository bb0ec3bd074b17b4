use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::callout::checklist::{Answer, ChecklistName};
use crate::callout::context::TransactionContext;
use crate::callout::helper::{HelperQuery, HelperReply, HelperResult, RewriteHelper};
use crate::callout::state::{
    BumpMode, CalloutStep, ErrorCause, ForwardDecision, PipelineState, Redirect, StepResult,
    transition,
};
use crate::callout::xff::XffWalk;
use crate::callout::{host_verify, xff};
use crate::config::{HelperConfig, TimeoutPolicy};
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;

/// How a pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Hand the request to the forwarding stage.
    Forwardable(Request, ForwardDecision),
    /// Answer with a synthesized error.
    Denied(ErrorCause, StatusCode),
    /// Drop the client connection without a response.
    ConnectionMustClose(String),
}

/// Runs every callout for one request.
///
/// Returns `None` when the transaction died while a step was suspended;
/// whatever that step was waiting for is discarded.
pub async fn run_callouts(request: Request, ctx: TransactionContext) -> Option<PipelineOutcome> {
    CalloutPipeline::new(ctx).run(request).await
}

/// Per-transaction pipeline engine.
///
/// Keeps the state that outlives a single step: the X-Forwarded-For walk,
/// decisions for later stages and the trace of steps that ran.
pub struct CalloutPipeline {
    ctx: TransactionContext,
    xff: Option<XffWalk>,
    decision: ForwardDecision,
    trace: Vec<CalloutStep>,
}

impl CalloutPipeline {
    pub fn new(ctx: TransactionContext) -> Self {
        Self {
            ctx,
            xff: None,
            decision: ForwardDecision::default(),
            trace: Vec::new(),
        }
    }

    /// Steps that applied, in the order they ran. FollowXff appears once
    /// per visit.
    pub fn trace(&self) -> &[CalloutStep] {
        &self.trace
    }

    /// Checklist consultations made while following X-Forwarded-For.
    pub fn xff_checks(&self) -> usize {
        self.xff.as_ref().map_or(0, XffWalk::checks)
    }

    pub async fn run(&mut self, request: Request) -> Option<PipelineOutcome> {
        let mut request = request;
        let mut state = PipelineState::Running(CalloutStep::FIRST);

        let outcome = loop {
            let step = match state {
                PipelineState::Running(step) => step,
                PipelineState::Done => {
                    info!(
                        method = %request.method(),
                        uri = %request.effective_uri(),
                        client = %request.indirect_client_addr,
                        "request cleared callouts"
                    );
                    let decision = std::mem::take(&mut self.decision);
                    break PipelineOutcome::Forwardable(request, decision);
                }
                PipelineState::DeniedWith(cause) => {
                    info!(
                        method = %request.method(),
                        uri = %request.effective_uri(),
                        client = %request.indirect_client_addr,
                        cause = %cause,
                        "request denied"
                    );
                    let status = cause.status();
                    break PipelineOutcome::Denied(cause, status);
                }
                PipelineState::MustClose(reason) => {
                    info!(uri = %request.effective_uri(), reason = %reason, "closing connection");
                    break PipelineOutcome::ConnectionMustClose(reason);
                }
            };

            if !self.ctx.liveness.is_live() {
                debug!(epoch = self.ctx.liveness.epoch(), "transaction gone; callouts abandoned");
                return None;
            }

            let Some(result) = self.run_step(step, &mut request).await else {
                debug!(
                    epoch = self.ctx.liveness.epoch(),
                    step = ?step,
                    "transaction gone while suspended"
                );
                return None;
            };

            state = transition(step, &result);
            if let StepResult::Rewrite(url) = result {
                request = request.rewrite(url);
            }
        };

        self.ctx.liveness.is_live().then_some(outcome)
    }

    fn applies(&self, step: CalloutStep, request: &Request) -> bool {
        let cfg = &self.ctx.config;
        match step {
            CalloutStep::HostVerify => host_verify::applies(request),
            CalloutStep::FollowXff => xff::applies(request, &self.ctx),
            CalloutStep::AccessCheck => true,
            CalloutStep::RedirectorCheck => self.ctx.services.redirector.is_some(),
            CalloutStep::StoreIdCheck => self.ctx.services.store_id.is_some(),
            CalloutStep::AdaptedAccessCheck => {
                cfg.access.is_configured(ChecklistName::AdaptedHttpAccess)
            }
            CalloutStep::NoCacheCheck => cfg.access.is_configured(ChecklistName::NoCache),
            CalloutStep::SslBumpCheck => {
                cfg.listener.ssl_bump
                    && *request.method() == Method::CONNECT
                    && cfg.access.is_configured(ChecklistName::SslBump)
                    && self.decision.redirect.is_none()
            }
        }
    }

    async fn run_step(&mut self, step: CalloutStep, request: &mut Request) -> Option<StepResult> {
        if !self.applies(step, request) {
            return Some(StepResult::Advance);
        }
        debug!(step = ?step, uri = %request.effective_uri(), "callout");
        self.trace.push(step);

        match step {
            CalloutStep::HostVerify => host_verify::run(request, &self.ctx).await,
            CalloutStep::FollowXff => xff::visit(request, &mut self.xff, &self.ctx).await,
            CalloutStep::AccessCheck => self.access_check(ChecklistName::HttpAccess, request).await,
            CalloutStep::RedirectorCheck => self.redirector_check(request).await,
            CalloutStep::StoreIdCheck => self.store_id_check(request).await,
            CalloutStep::AdaptedAccessCheck => {
                self.access_check(ChecklistName::AdaptedHttpAccess, request)
                    .await
            }
            CalloutStep::NoCacheCheck => self.no_cache_check(request).await,
            CalloutStep::SslBumpCheck => self.ssl_bump_check(request).await,
        }
    }

    async fn access_check(&self, list: ChecklistName, request: &Request) -> Option<StepResult> {
        if !self.ctx.config.access.is_configured(list) {
            error!(list = %list, "no access configuration found; this blocks ALL traffic");
            return Some(StepResult::Deny(ErrorCause::AccessDenied));
        }

        let answer = self.ctx.ask(list, request).await?;
        debug!(list = %list, answer = ?answer, uri = %request.effective_uri(), "access decision");
        let result = match answer {
            Answer::Allowed | Answer::Bump(_) => StepResult::Advance,
            Answer::Denied => StepResult::Deny(ErrorCause::AccessDenied),
            Answer::AuthRequired => {
                StepResult::Deny(ErrorCause::AuthRequired(challenge_status(request)))
            }
        };
        Some(result)
    }

    /// Asks the gating checklist, when there is one, whether a helper
    /// step should run at all.
    async fn helper_allowed(&self, list: ChecklistName, request: &Request) -> Option<bool> {
        if !self.ctx.config.access.is_configured(list) {
            return Some(true);
        }
        Some(self.ctx.ask(list, request).await?.is_allowed())
    }

    async fn consult(
        &self,
        helper: &Arc<dyn RewriteHelper>,
        cfg: &HelperConfig,
        request: &Request,
    ) -> Option<HelperReply> {
        let query = HelperQuery::for_request(request);
        let reply = self
            .ctx
            .liveness
            .guard(tokio::time::timeout(cfg.timeout(), helper.query(&query)))
            .await?;
        Some(reply.unwrap_or_else(|_| HelperReply::new(HelperResult::TimedOut)))
    }

    /// Outcome for replies other than `OK`.
    fn helper_fallback(&self, name: &str, cfg: &HelperConfig, reply: &HelperReply) -> StepResult {
        match &reply.result {
            HelperResult::TimedOut => match cfg.on_timeout {
                TimeoutPolicy::Bypass => {
                    warn!(helper = name, "helper timed out; bypassing");
                    StepResult::Advance
                }
                TimeoutPolicy::Fail => {
                    warn!(helper = name, "helper timed out; failing request");
                    StepResult::Deny(ErrorCause::GatewayFailure(format!("{} timed out", name)))
                }
            },
            HelperResult::Err => {
                debug!(helper = name, "helper declined");
                StepResult::Advance
            }
            HelperResult::BrokenHelper => {
                warn!(helper = name, "broken helper; continuing unchanged");
                StepResult::Advance
            }
            HelperResult::Unknown(code) => {
                warn!(helper = name, code = %code, "unknown helper result; continuing unchanged");
                StepResult::Advance
            }
            HelperResult::Ok => StepResult::Advance,
        }
    }

    async fn redirector_check(&mut self, request: &mut Request) -> Option<StepResult> {
        if !self.helper_allowed(ChecklistName::RedirectorAccess, request).await? {
            return Some(StepResult::Advance);
        }
        let Some(helper) = self.ctx.services.redirector.clone() else {
            return Some(StepResult::Advance);
        };
        let cfg = self.ctx.config.redirector.clone().unwrap_or_default();

        let reply = self.consult(&helper, &cfg, request).await?;
        if reply.result != HelperResult::Ok {
            return Some(self.helper_fallback("redirector", &cfg, &reply));
        }
        request.update_notes(&reply.notes);

        if let Some(location) = reply.notes.find_first("url") {
            let status = redirect_status(reply.notes.find_first("status"));
            info!(status = status.as_u16(), location = %location, "redirector answered with redirect");
            self.decision.redirect = Some(Redirect {
                status,
                location: location.to_string(),
            });
            return Some(StepResult::Advance);
        }

        if let Some(target) = reply.notes.find_first("rewrite-url") {
            let current = request.effective_uri();
            if target == current {
                debug!(uri = %current, "rewrite to the same URL ignored");
                return Some(StepResult::Advance);
            }
            return match request.url.resolve(target) {
                Ok(url) => {
                    info!(from = %current, to = %url, "URL rewritten");
                    Some(StepResult::Rewrite(url))
                }
                Err(e) => {
                    error!(
                        method = %request.method(),
                        target = %target,
                        error = %e,
                        "URL rewrite produces invalid request"
                    );
                    Some(StepResult::Advance)
                }
            };
        }

        Some(StepResult::Advance)
    }

    async fn store_id_check(&mut self, request: &mut Request) -> Option<StepResult> {
        if !self.helper_allowed(ChecklistName::StoreIdAccess, request).await? {
            return Some(StepResult::Advance);
        }
        let Some(helper) = self.ctx.services.store_id.clone() else {
            return Some(StepResult::Advance);
        };
        let cfg = self.ctx.config.store_id.clone().unwrap_or_default();

        let reply = self.consult(&helper, &cfg, request).await?;
        if reply.result != HelperResult::Ok {
            return Some(self.helper_fallback("store_id", &cfg, &reply));
        }
        request.update_notes(&reply.notes);

        if let Some(store_id) = reply.notes.find_first("store-id") {
            if store_id != request.effective_uri() {
                debug!(store_id = %store_id, "store ID assigned");
                request.store_id = Some(store_id.to_string());
            }
        }
        Some(StepResult::Advance)
    }

    async fn no_cache_check(&self, request: &mut Request) -> Option<StepResult> {
        let answer = self.ctx.ask(ChecklistName::NoCache, request).await?;
        if !answer.is_allowed() {
            debug!(uri = %request.effective_uri(), "caching denied");
            request.flags.no_cache = true;
            request.flags.cachable = false;
        }
        Some(StepResult::Advance)
    }

    async fn ssl_bump_check(&mut self, request: &Request) -> Option<StepResult> {
        let answer = self.ctx.ask(ChecklistName::SslBump, request).await?;
        let mode = match answer {
            Answer::Bump(mode) => mode,
            Answer::Allowed => BumpMode::Bump,
            Answer::Denied | Answer::AuthRequired => BumpMode::Splice,
        };
        debug!(mode = %mode, authority = %request.url.authority(), "ssl_bump decision");
        self.decision.bump = Some(mode);

        if mode == BumpMode::Terminate {
            return Some(StepResult::Close(format!(
                "ssl_bump terminate for {}",
                request.url.authority()
            )));
        }
        Some(StepResult::Advance)
    }
}

/// Status for an authentication challenge on this request.
fn challenge_status(request: &Request) -> StatusCode {
    if request.flags.ssl_bumped {
        // a challenge inside a bumped tunnel cannot reach the user agent
        StatusCode::Forbidden
    } else if request.flags.accelerated {
        StatusCode::Unauthorized
    } else {
        StatusCode::ProxyAuthenticationRequired
    }
}

/// Redirect status from a helper `status=` note; 302 unless a valid
/// redirect code was given.
fn redirect_status(note: Option<&str>) -> StatusCode {
    let Some(text) = note else {
        return StatusCode::Found;
    };
    match text.trim().parse::<u16>().map(StatusCode::from_u16) {
        Ok(status) if status.is_redirect() => status,
        _ => {
            warn!(status = %text, "redirector status is not a redirect; using 302");
            StatusCode::Found
        }
    }
}
