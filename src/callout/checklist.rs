//! The policy decision port.
//!
//! A [`Checklist`] answers right away or defers. A deferred check hands
//! back a token registered in [`PendingChecks`]; whoever finishes the
//! evaluation later calls [`PendingChecks::resolve`] with that token.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::callout::state::BumpMode;
use crate::http::request::Request;

/// The access lists the pipeline consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecklistName {
    HttpAccess,
    AdaptedHttpAccess,
    FollowXForwardedFor,
    RedirectorAccess,
    StoreIdAccess,
    NoCache,
    SslBump,
}

impl ChecklistName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistName::HttpAccess => "http_access",
            ChecklistName::AdaptedHttpAccess => "adapted_http_access",
            ChecklistName::FollowXForwardedFor => "follow_x_forwarded_for",
            ChecklistName::RedirectorAccess => "redirector_access",
            ChecklistName::StoreIdAccess => "store_id_access",
            ChecklistName::NoCache => "no_cache",
            ChecklistName::SslBump => "ssl_bump",
        }
    }
}

impl fmt::Display for ChecklistName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A final checklist answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Allowed,
    Denied,
    /// Denied until the client presents credentials.
    AuthRequired,
    /// Allowed, with a specific bump mode (ssl_bump lists only).
    Bump(BumpMode),
}

impl Answer {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Answer::Allowed | Answer::Bump(_))
    }
}

#[derive(Debug)]
pub enum Verdict {
    Answer(Answer),
    Deferred(DeferredCheck),
}

impl From<Answer> for Verdict {
    fn from(answer: Answer) -> Self {
        Verdict::Answer(answer)
    }
}

/// What a checklist gets to look at. The request is read-only.
#[derive(Debug, Clone, Copy)]
pub struct CheckRequest<'a> {
    pub list: ChecklistName,
    /// Source address rules match against; may be the indirect client.
    pub src_addr: IpAddr,
    pub request: &'a Request,
}

pub trait Checklist: Send + Sync {
    /// Evaluates `list` for a request.
    ///
    /// Implementations that need to wait must return
    /// `pending.defer()` and resolve the token later.
    fn check(&self, query: CheckRequest<'_>, pending: &PendingChecks) -> Verdict;
}

impl<T: Checklist + ?Sized> Checklist for Arc<T> {
    fn check(&self, query: CheckRequest<'_>, pending: &PendingChecks) -> Verdict {
        (**self).check(query, pending)
    }
}

/// Identifies one outstanding deferred check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckToken(u64);

impl fmt::Display for CheckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check#{}", self.0)
    }
}

/// Registry of deferred checks awaiting an answer.
#[derive(Debug, Clone, Default)]
pub struct PendingChecks {
    waiting: Arc<DashMap<CheckToken, oneshot::Sender<Answer>>>,
    next: Arc<AtomicU64>,
}

impl PendingChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new deferred check.
    pub fn defer(&self) -> Verdict {
        let token = CheckToken(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(token, tx);
        Verdict::Deferred(DeferredCheck {
            token,
            rx,
            registry: self.clone(),
        })
    }

    /// Delivers the answer for `token`.
    ///
    /// Returns `false` when nobody waits for it any more: the transaction
    /// is gone, or the token was already resolved. Nothing else happens
    /// in that case.
    pub fn resolve(&self, token: CheckToken, answer: Answer) -> bool {
        let Some((_, tx)) = self.waiting.remove(&token) else {
            tracing::debug!(%token, "late checklist answer dropped");
            return false;
        };
        tx.send(answer).is_ok()
    }

    /// Tokens of all checks still waiting, oldest first.
    pub fn outstanding(&self) -> Vec<CheckToken> {
        let mut tokens: Vec<CheckToken> = self.waiting.iter().map(|e| *e.key()).collect();
        tokens.sort_by_key(|t| t.0);
        tokens
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// The waiting side of a deferred check.
///
/// Dropping it withdraws the registration, so a later `resolve` for the
/// same token is a no-op.
#[derive(Debug)]
pub struct DeferredCheck {
    token: CheckToken,
    rx: oneshot::Receiver<Answer>,
    registry: PendingChecks,
}

impl DeferredCheck {
    pub fn token(&self) -> CheckToken {
        self.token
    }

    /// Waits for the answer. A resolver that vanished without answering
    /// counts as a denial.
    pub async fn wait(mut self) -> Answer {
        match (&mut self.rx).await {
            Ok(answer) => answer,
            Err(_) => {
                tracing::warn!(token = %self.token, "deferred check abandoned; denying");
                Answer::Denied
            }
        }
    }
}

impl Drop for DeferredCheck {
    fn drop(&mut self) {
        self.registry.waiting.remove(&self.token);
    }
}
