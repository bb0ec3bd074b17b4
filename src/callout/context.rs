//! Transaction liveness and the collaborators a pipeline runs against.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;

use crate::callout::checklist::{
    Answer, CheckRequest, Checklist, ChecklistName, PendingChecks, Verdict,
};
use crate::callout::helper::{BoxFuture, RewriteHelper};
use crate::config::Config;
use crate::http::request::Request;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TransactionState {
    epoch: u64,
    aborted: watch::Sender<bool>,
}

/// Owner side of a transaction's lifetime.
///
/// The connection holds this for as long as the transaction exists.
/// Aborting it, or dropping it, invalidates every [`LivenessToken`]
/// derived from it.
#[derive(Debug)]
pub struct Transaction {
    state: Arc<TransactionState>,
}

impl Transaction {
    pub fn new() -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            state: Arc::new(TransactionState {
                epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
                aborted,
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    pub fn abort(&self) {
        self.state.aborted.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.state.aborted.borrow()
    }

    pub fn liveness(&self) -> LivenessToken {
        LivenessToken {
            state: Arc::downgrade(&self.state),
            epoch: self.state.epoch,
            aborted: self.state.aborted.subscribe(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak handle the pipeline checks before acting on anything that
/// completed while it was suspended.
#[derive(Debug, Clone)]
pub struct LivenessToken {
    state: Weak<TransactionState>,
    epoch: u64,
    aborted: watch::Receiver<bool>,
}

impl LivenessToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_live(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => state.epoch == self.epoch && !*state.aborted.borrow(),
            None => false,
        }
    }

    /// Completes once the transaction is aborted or dropped.
    pub async fn dead(&self) {
        let mut aborted = self.aborted.clone();
        // an Err means the sender is gone, which is just as dead
        let _ = aborted.wait_for(|aborted| *aborted).await;
    }

    /// Runs `fut` unless the transaction dies first.
    ///
    /// Returns `None` when the transaction died before or during the wait,
    /// including when `fut` finished but the transaction was gone by then.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        if !self.is_live() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.dead() => None,
            out = fut => self.is_live().then_some(out),
        }
    }
}

/// Looks up the addresses of a host name.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>>;
}

/// Resolver backed by the system's `getaddrinfo` via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}

/// Long-lived collaborators shared by every transaction.
#[derive(Clone)]
pub struct Services {
    pub checklist: Arc<dyn Checklist>,
    pub pending: PendingChecks,
    pub redirector: Option<Arc<dyn RewriteHelper>>,
    pub store_id: Option<Arc<dyn RewriteHelper>>,
    pub resolver: Arc<dyn HostResolver>,
}

impl Services {
    pub fn new(checklist: Arc<dyn Checklist>) -> Self {
        Self {
            checklist,
            pending: PendingChecks::new(),
            redirector: None,
            store_id: None,
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_pending(mut self, pending: PendingChecks) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_redirector(mut self, helper: Arc<dyn RewriteHelper>) -> Self {
        self.redirector = Some(helper);
        self
    }

    pub fn with_store_id(mut self, helper: Arc<dyn RewriteHelper>) -> Self {
        self.store_id = Some(helper);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Everything one pipeline run needs besides the request itself.
///
/// The configuration is a snapshot taken when the transaction started;
/// the pipeline never looks at the process-wide value.
#[derive(Clone)]
pub struct TransactionContext {
    pub config: Arc<Config>,
    pub services: Services,
    pub liveness: LivenessToken,
}

impl TransactionContext {
    pub fn new(config: Arc<Config>, services: Services, liveness: LivenessToken) -> Self {
        Self {
            config,
            services,
            liveness,
        }
    }

    /// Source address checklists match against for this request.
    pub fn src_addr(&self, request: &Request) -> IpAddr {
        if self.config.follow_x_forwarded_for.acl_uses_indirect_client {
            request.indirect_client_addr
        } else {
            request.client_addr.ip()
        }
    }

    pub async fn ask(&self, list: ChecklistName, request: &Request) -> Option<Answer> {
        self.ask_from(list, self.src_addr(request), request).await
    }

    /// Consults the checklist, waiting out a deferred answer.
    ///
    /// `None` means the transaction died while the check was outstanding.
    pub async fn ask_from(
        &self,
        list: ChecklistName,
        src_addr: IpAddr,
        request: &Request,
    ) -> Option<Answer> {
        let query = CheckRequest {
            list,
            src_addr,
            request,
        };
        match self.services.checklist.check(query, &self.services.pending) {
            Verdict::Answer(answer) => Some(answer),
            Verdict::Deferred(check) => {
                tracing::debug!(list = %list, token = %check.token(), "checklist deferred");
                self.liveness.guard(check.wait()).await
            }
        }
    }
}
