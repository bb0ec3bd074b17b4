#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frontgate::callout::checklist::{
    Answer, CheckRequest, CheckToken, Checklist, ChecklistName, PendingChecks, Verdict,
};
use frontgate::callout::context::{HostResolver, Services, Transaction, TransactionContext};
use frontgate::callout::helper::{BoxFuture, HelperQuery, HelperReply, RewriteHelper};
use frontgate::config::{ChecklistConfig, Config, ListenerConfig, UpstreamConfig};
use frontgate::http::parser::{ParseOutcome, RequestParser};
use frontgate::http::request::Request;
use frontgate::http::response::{Response, ResponseBuilder, StatusCode};
use frontgate::proxy::ForwardStage;
use tokio::net::TcpStream;

pub const CLIENT: &str = "192.0.2.10:50000";
pub const LOCAL: &str = "198.51.100.1:3128";

pub fn parse_request(raw: &[u8], listener: &ListenerConfig) -> Request {
    let config = Config::default();
    let step = RequestParser::new(config.parser.clone()).parse(raw);
    let ParseOutcome::Parsed(line, block) = step.outcome else {
        panic!("request did not parse: {:?}", step.outcome);
    };
    Request::from_parsed(
        line,
        &block,
        &config.parser,
        listener,
        CLIENT.parse().unwrap(),
        LOCAL.parse().unwrap(),
    )
    .unwrap()
}

pub fn get(raw: &str) -> Request {
    parse_request(raw.as_bytes(), &ListenerConfig::default())
}

/// Marks `list` as configured with an allow-all default.
pub fn configure(cfg: &mut Config, list: ChecklistName) {
    let entry = ChecklistConfig {
        default: "allow".to_string(),
        rules: Vec::new(),
    };
    let access = &mut cfg.access;
    let slot = match list {
        ChecklistName::HttpAccess => &mut access.http_access,
        ChecklistName::AdaptedHttpAccess => &mut access.adapted_http_access,
        ChecklistName::FollowXForwardedFor => &mut access.follow_x_forwarded_for,
        ChecklistName::RedirectorAccess => &mut access.redirector_access,
        ChecklistName::StoreIdAccess => &mut access.store_id_access,
        ChecklistName::NoCache => &mut access.no_cache,
        ChecklistName::SslBump => &mut access.ssl_bump,
    };
    *slot = Some(entry);
}

/// One recorded checklist consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consultation {
    pub list: ChecklistName,
    pub src_addr: IpAddr,
}

/// Scripted checklist: fixed answers per list, optionally keyed by
/// source address, with every call recorded.
#[derive(Default)]
pub struct ScriptedChecklist {
    answers: HashMap<ChecklistName, Answer>,
    by_source: HashMap<(ChecklistName, IpAddr), Answer>,
    deferred: Vec<ChecklistName>,
    calls: Mutex<Vec<Consultation>>,
    tokens: Mutex<Vec<CheckToken>>,
}

impl ScriptedChecklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, list: ChecklistName, answer: Answer) -> Self {
        self.answers.insert(list, answer);
        self
    }

    pub fn answer_for(mut self, list: ChecklistName, src: &str, answer: Answer) -> Self {
        self.by_source.insert((list, src.parse().unwrap()), answer);
        self
    }

    /// Every check of `list` is deferred.
    pub fn defer(mut self, list: ChecklistName) -> Self {
        self.deferred.push(list);
        self
    }

    pub fn calls(&self) -> Vec<Consultation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, list: ChecklistName) -> usize {
        self.calls().iter().filter(|c| c.list == list).count()
    }

    pub fn deferred_tokens(&self) -> Vec<CheckToken> {
        self.tokens.lock().unwrap().clone()
    }
}

impl Checklist for ScriptedChecklist {
    fn check(&self, query: CheckRequest<'_>, pending: &PendingChecks) -> Verdict {
        self.calls.lock().unwrap().push(Consultation {
            list: query.list,
            src_addr: query.src_addr,
        });

        if self.deferred.contains(&query.list) {
            let verdict = pending.defer();
            if let Verdict::Deferred(check) = &verdict {
                self.tokens.lock().unwrap().push(check.token());
            }
            return verdict;
        }

        let answer = self
            .by_source
            .get(&(query.list, query.src_addr))
            .or_else(|| self.answers.get(&query.list))
            .copied()
            .unwrap_or(Answer::Allowed);
        Verdict::Answer(answer)
    }
}

/// Rewrite helper returning a fixed reply, optionally after a delay.
pub struct FixedHelper {
    reply: HelperReply,
    delay: Option<Duration>,
    queries: Mutex<Vec<HelperQuery>>,
}

impl FixedHelper {
    pub fn new(reply: HelperReply) -> Self {
        Self {
            reply,
            delay: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn delayed(reply: HelperReply, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(reply)
        }
    }

    pub fn queries(&self) -> Vec<HelperQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl RewriteHelper for FixedHelper {
    fn query<'a>(&'a self, query: &'a HelperQuery) -> BoxFuture<'a, HelperReply> {
        Box::pin(async move {
            self.queries.lock().unwrap().push(query.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply.clone()
        })
    }
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, addrs: &[&str]) -> Self {
        self.hosts.insert(
            host.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str, _port: u16) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            self.hosts.get(host).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "unknown host")
            })
        })
    }
}

pub fn context(cfg: Config, services: Services, txn: &Transaction) -> TransactionContext {
    TransactionContext::new(Arc::new(cfg), services, txn.liveness())
}

pub fn local_addr() -> SocketAddr {
    LOCAL.parse().unwrap()
}

/// Records what it was asked to forward and answers 200.
#[derive(Default)]
pub struct RecordingForwarder {
    seen: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl RecordingForwarder {
    pub fn seen(&self) -> Vec<(String, String, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }
}

impl ForwardStage for RecordingForwarder {
    fn forward<'a>(
        &'a self,
        request: &'a Request,
        _upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, anyhow::Result<Response>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push((
                request.method().to_string(),
                request.effective_uri(),
                request.body.clone(),
            ));
            Ok(ResponseBuilder::new(StatusCode::Ok)
                .header("X-Origin", "fake")
                .body(b"from origin".to_vec())
                .build())
        })
    }

    fn open_tunnel<'a>(
        &'a self,
        _request: &'a Request,
        _upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, anyhow::Result<TcpStream>> {
        Box::pin(async { Err(anyhow::anyhow!("tunnels disabled in tests")) })
    }
}
