mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{FixedHelper, ScriptedChecklist, StaticResolver, configure, context, get, parse_request};
use frontgate::callout::checklist::{Answer, ChecklistName, PendingChecks};
use frontgate::callout::context::{Services, Transaction};
use frontgate::callout::helper::{HelperReply, HelperResult};
use frontgate::callout::pipeline::{CalloutPipeline, PipelineOutcome, run_callouts};
use frontgate::callout::state::{BumpMode, CalloutStep, ErrorCause, ForwardDecision, Redirect};
use frontgate::config::{Config, HelperConfig, ListenerConfig, TimeoutPolicy};
use frontgate::http::request::Request;
use frontgate::http::response::StatusCode;

const PLAIN_GET: &str = "GET http://origin.example/page HTTP/1.1\r\nHost: origin.example\r\n\r\n";

fn base_config() -> Config {
    let mut cfg = Config::default();
    configure(&mut cfg, ChecklistName::HttpAccess);
    cfg
}

fn xff_config() -> Config {
    let mut cfg = base_config();
    cfg.follow_x_forwarded_for.enabled = true;
    configure(&mut cfg, ChecklistName::FollowXForwardedFor);
    cfg
}

fn helper_config(timeout_ms: u64, on_timeout: TimeoutPolicy) -> HelperConfig {
    HelperConfig {
        program: vec!["unused".to_string()],
        timeout_ms,
        on_timeout,
    }
}

struct Run {
    outcome: Option<PipelineOutcome>,
    trace: Vec<CalloutStep>,
    xff_checks: usize,
}

async fn run(cfg: Config, services: Services, request: Request) -> Run {
    let txn = Transaction::new();
    let mut pipeline = CalloutPipeline::new(context(cfg, services, &txn));
    let outcome = pipeline.run(request).await;
    Run {
        outcome,
        trace: pipeline.trace().to_vec(),
        xff_checks: pipeline.xff_checks(),
    }
}

fn forwarded(run: Run) -> (Request, ForwardDecision) {
    match run.outcome {
        Some(PipelineOutcome::Forwardable(request, decision)) => (request, decision),
        other => panic!("expected forwardable request, got {:?}", other),
    }
}

fn denied(run: Run) -> (ErrorCause, StatusCode) {
    match run.outcome {
        Some(PipelineOutcome::Denied(cause, status)) => (cause, status),
        other => panic!("expected denial, got {:?}", other),
    }
}

fn ip(text: &str) -> IpAddr {
    text.parse().unwrap()
}

#[tokio::test]
async fn test_steps_run_in_fixed_order() {
    let mut cfg = xff_config();
    configure(&mut cfg, ChecklistName::AdaptedHttpAccess);
    configure(&mut cfg, ChecklistName::NoCache);
    configure(&mut cfg, ChecklistName::SslBump);
    cfg.listener.ssl_bump = true;

    let checklist = Arc::new(ScriptedChecklist::new());
    let services = Services::new(checklist.clone())
        .with_redirector(Arc::new(FixedHelper::new(HelperReply::ok())))
        .with_store_id(Arc::new(FixedHelper::new(HelperReply::ok())));
    let request = get(
        "GET http://origin.example/page HTTP/1.1\r\nHost: origin.example\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
    );

    let result = run(cfg, services, request).await;

    assert_eq!(
        result.trace,
        vec![
            CalloutStep::HostVerify,
            CalloutStep::FollowXff,
            CalloutStep::FollowXff,
            CalloutStep::AccessCheck,
            CalloutStep::RedirectorCheck,
            CalloutStep::StoreIdCheck,
            CalloutStep::AdaptedAccessCheck,
            CalloutStep::NoCacheCheck,
        ]
    );
    let lists: Vec<ChecklistName> = checklist.calls().iter().map(|c| c.list).collect();
    assert_eq!(
        lists,
        vec![
            ChecklistName::FollowXForwardedFor,
            ChecklistName::HttpAccess,
            ChecklistName::AdaptedHttpAccess,
            ChecklistName::NoCache,
        ]
    );

    let (request, decision) = forwarded(result);
    assert!(request.flags.host_verified);
    assert_eq!(decision, ForwardDecision::default());
}

#[tokio::test]
async fn test_inapplicable_steps_are_skipped() {
    let request = get("GET http://origin.example/ HTTP/1.1\r\n\r\n");
    let checklist = Arc::new(ScriptedChecklist::new());

    let result = run(base_config(), Services::new(checklist.clone()), request).await;

    assert_eq!(result.trace, vec![CalloutStep::AccessCheck]);
    let (request, _) = forwarded(result);
    assert!(!request.flags.host_verified);
}

#[tokio::test]
async fn test_denial_short_circuits() {
    let mut cfg = base_config();
    configure(&mut cfg, ChecklistName::NoCache);
    let checklist =
        Arc::new(ScriptedChecklist::new().answer(ChecklistName::HttpAccess, Answer::Denied));
    let redirector = Arc::new(FixedHelper::new(HelperReply::ok()));
    let services = Services::new(checklist.clone()).with_redirector(redirector.clone());

    let result = run(cfg, services, get(PLAIN_GET)).await;

    assert_eq!(result.trace.last(), Some(&CalloutStep::AccessCheck));
    let (cause, status) = denied(result);
    assert_eq!(cause, ErrorCause::AccessDenied);
    assert_eq!(status, StatusCode::Forbidden);
    assert!(redirector.queries().is_empty());
    assert_eq!(checklist.calls_to(ChecklistName::NoCache), 0);
}

#[tokio::test]
async fn test_missing_http_access_denies_everything() {
    let checklist = Arc::new(ScriptedChecklist::new());

    let result = run(Config::default(), Services::new(checklist.clone()), get(PLAIN_GET)).await;

    let (cause, status) = denied(result);
    assert_eq!(cause, ErrorCause::AccessDenied);
    assert_eq!(status, StatusCode::Forbidden);
    assert_eq!(checklist.calls_to(ChecklistName::HttpAccess), 0);
}

#[tokio::test]
async fn test_auth_required_challenge_status() {
    let checklist = || {
        Arc::new(ScriptedChecklist::new().answer(ChecklistName::HttpAccess, Answer::AuthRequired))
    };

    let result = run(base_config(), Services::new(checklist()), get(PLAIN_GET)).await;
    let (cause, status) = denied(result);
    assert_eq!(cause, ErrorCause::AuthRequired(StatusCode::ProxyAuthenticationRequired));
    assert_eq!(status.as_u16(), 407);

    let accel = ListenerConfig {
        accel: true,
        ..ListenerConfig::default()
    };
    let request = parse_request(b"GET /app HTTP/1.1\r\nHost: site.example\r\n\r\n", &accel);
    let result = run(base_config(), Services::new(checklist()), request).await;
    let (_, status) = denied(result);
    assert_eq!(status, StatusCode::Unauthorized);
}

#[tokio::test]
async fn test_xff_walk_adopts_last_trusted_hop() {
    let mut cfg = xff_config();
    cfg.follow_x_forwarded_for.acl_uses_indirect_client = true;
    let checklist = Arc::new(ScriptedChecklist::new());
    let request = get(
        "GET / HTTP/1.1\r\nHost: origin.example\r\nX-Forwarded-For: 1.1.1.1, 2.2.2.2\r\nX-Forwarded-For: 3.3.3.3\r\n\r\n",
    );

    let result = run(cfg, Services::new(checklist.clone()), request).await;

    // one check per hop, none once the header is exhausted
    assert_eq!(result.xff_checks, 3);
    let visits = result.trace.iter().filter(|s| **s == CalloutStep::FollowXff).count();
    assert_eq!(visits, 4);

    let xff_sources: Vec<IpAddr> = checklist
        .calls()
        .iter()
        .filter(|c| c.list == ChecklistName::FollowXForwardedFor)
        .map(|c| c.src_addr)
        .collect();
    assert_eq!(xff_sources, vec![ip("192.0.2.10"), ip("3.3.3.3"), ip("2.2.2.2")]);

    let access_src = checklist
        .calls()
        .iter()
        .find(|c| c.list == ChecklistName::HttpAccess)
        .map(|c| c.src_addr);
    assert_eq!(access_src, Some(ip("1.1.1.1")));

    let (request, _) = forwarded(result);
    assert_eq!(request.indirect_client_addr, ip("1.1.1.1"));
    assert!(request.flags.done_follow_xff);
}

#[tokio::test]
async fn test_xff_walk_stops_at_untrusted_hop() {
    let checklist = Arc::new(ScriptedChecklist::new().answer_for(
        ChecklistName::FollowXForwardedFor,
        "2.2.2.2",
        Answer::Denied,
    ));
    let request = get(
        "GET / HTTP/1.1\r\nHost: origin.example\r\nX-Forwarded-For: 1.1.1.1, 2.2.2.2, 3.3.3.3\r\n\r\n",
    );

    let result = run(xff_config(), Services::new(checklist.clone()), request).await;

    assert_eq!(result.xff_checks, 3);
    let (request, _) = forwarded(result);
    assert_eq!(request.indirect_client_addr, ip("2.2.2.2"));

    // without acl_uses_indirect_client later lists see the direct client
    let access_src = checklist
        .calls()
        .iter()
        .find(|c| c.list == ChecklistName::HttpAccess)
        .map(|c| c.src_addr);
    assert_eq!(access_src, Some(ip("192.0.2.10")));
}

#[tokio::test]
async fn test_xff_walk_stops_at_garbage() {
    let checklist = Arc::new(ScriptedChecklist::new());
    let request = get(
        "GET / HTTP/1.1\r\nHost: origin.example\r\nX-Forwarded-For: 1.1.1.1, unknown, [2001:db8::1]\r\n\r\n",
    );

    let result = run(xff_config(), Services::new(checklist), request).await;

    assert_eq!(result.xff_checks, 2);
    let (request, _) = forwarded(result);
    assert_eq!(request.indirect_client_addr, ip("2001:db8::1"));
}

#[tokio::test]
async fn test_xff_ignored_when_disabled() {
    let mut cfg = xff_config();
    cfg.follow_x_forwarded_for.enabled = false;
    let request = get("GET / HTTP/1.1\r\nHost: origin.example\r\nX-Forwarded-For: 1.1.1.1\r\n\r\n");

    let result = run(cfg, Services::new(Arc::new(ScriptedChecklist::new())), request).await;

    assert!(!result.trace.contains(&CalloutStep::FollowXff));
    let (request, _) = forwarded(result);
    assert_eq!(request.indirect_client_addr, ip("192.0.2.10"));
}

#[tokio::test]
async fn test_host_conflict_strict_denies() {
    let mut cfg = base_config();
    cfg.host_verify.strict = true;
    let request = get("GET http://a.example/ HTTP/1.1\r\nHost: b.example\r\n\r\n");

    let result = run(cfg, Services::new(Arc::new(ScriptedChecklist::new())), request).await;

    assert_eq!(result.trace, vec![CalloutStep::HostVerify]);
    let (cause, status) = denied(result);
    assert_eq!(cause, ErrorCause::HostConflict);
    assert_eq!(status, StatusCode::Conflict);
    assert!(cause.closes_connection());
}

#[tokio::test]
async fn test_host_conflict_lenient_disables_caching() {
    let request = get("GET http://a.example/ HTTP/1.1\r\nHost: a.example:8080\r\n\r\n");

    let result = run(base_config(), Services::new(Arc::new(ScriptedChecklist::new())), request).await;

    let (request, _) = forwarded(result);
    assert!(request.flags.host_forgery);
    assert!(!request.flags.host_verified);
    assert!(!request.flags.cachable);
    assert!(!request.flags.hierarchical);
}

#[tokio::test]
async fn test_host_default_port_matches() {
    let request = get("GET http://a.example:80/ HTTP/1.1\r\nHost: A.Example\r\n\r\n");

    let result = run(base_config(), Services::new(Arc::new(ScriptedChecklist::new())), request).await;

    let (request, _) = forwarded(result);
    assert!(request.flags.host_verified);
    assert!(!request.flags.host_forgery);
}

#[tokio::test]
async fn test_intercepted_host_verification() {
    let intercepted = ListenerConfig {
        intercepted: true,
        ..ListenerConfig::default()
    };
    let resolver = Arc::new(
        StaticResolver::default()
            .with("good.example", &["203.0.113.9", "198.51.100.1"])
            .with("evil.example", &["203.0.113.66"]),
    );
    let services = || {
        Services::new(Arc::new(ScriptedChecklist::new())).with_resolver(resolver.clone())
    };
    let mut strict = base_config();
    strict.host_verify.strict = true;

    let verified = |raw: &str| parse_request(raw.as_bytes(), &intercepted);

    let result = run(strict.clone(), services(), verified("GET / HTTP/1.1\r\nHost: good.example\r\n\r\n")).await;
    assert!(forwarded(result).0.flags.host_verified);

    let result = run(strict.clone(), services(), verified("GET / HTTP/1.1\r\nHost: 198.51.100.1:3128\r\n\r\n")).await;
    assert!(forwarded(result).0.flags.host_verified);

    for host in ["evil.example", "good.example:8080", "nowhere.example", "203.0.113.9"] {
        let raw = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
        let result = run(strict.clone(), services(), verified(&raw)).await;
        assert_eq!(denied(result).0, ErrorCause::HostConflict, "host {}", host);
    }
}

#[tokio::test]
async fn test_redirector_rewrites_url() {
    let mut cfg = base_config();
    cfg.redirector = Some(helper_config(1_000, TimeoutPolicy::Bypass));
    let redirector = Arc::new(FixedHelper::new(
        HelperReply::ok()
            .with_note("rewrite-url", "http://mirror.example/page")
            .with_note("tag", "mirrored"),
    ));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_redirector(redirector.clone());

    let result = run(cfg, services, get(PLAIN_GET)).await;

    let queries = redirector.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].to_line(), "http://origin.example/page 192.0.2.10/- - GET");

    let (request, decision) = forwarded(result);
    assert_eq!(request.effective_uri(), "http://mirror.example/page");
    assert!(request.flags.redirected);
    assert_eq!(request.log_tag.as_deref(), Some("mirrored"));
    assert_eq!(request.header("Host"), Some("origin.example"));
    assert!(decision.redirect.is_none());
}

#[tokio::test]
async fn test_redirector_relative_rewrite_keeps_authority() {
    let redirector = Arc::new(FixedHelper::new(HelperReply::ok().with_note("rewrite-url", "/other?x=1")));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_redirector(redirector);

    let (request, _) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

    assert_eq!(request.effective_uri(), "http://origin.example/other?x=1");
}

#[tokio::test]
async fn test_redirector_same_or_invalid_url_ignored() {
    for target in ["http://origin.example/page", "ftp://files.example/page"] {
        let redirector = Arc::new(FixedHelper::new(HelperReply::ok().with_note("rewrite-url", target)));
        let services = Services::new(Arc::new(ScriptedChecklist::new())).with_redirector(redirector);

        let (request, _) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

        assert!(!request.flags.redirected, "target {}", target);
        assert_eq!(request.effective_uri(), "http://origin.example/page");
    }
}

#[tokio::test]
async fn test_redirector_answers_with_redirect() {
    let cases = [(Some("301"), StatusCode::MovedPermanently), (None, StatusCode::Found), (Some("200"), StatusCode::Found)];

    for (status, expected) in cases {
        let mut reply = HelperReply::ok().with_note("url", "https://secure.example/page");
        if let Some(status) = status {
            reply = reply.with_note("status", status);
        }
        let services = Services::new(Arc::new(ScriptedChecklist::new()))
            .with_redirector(Arc::new(FixedHelper::new(reply)));

        let (request, decision) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

        assert!(!request.flags.redirected);
        assert_eq!(
            decision.redirect,
            Some(Redirect {
                status: expected,
                location: "https://secure.example/page".to_string(),
            })
        );
    }
}

#[tokio::test]
async fn test_redirector_gated_by_access_list() {
    let mut cfg = base_config();
    configure(&mut cfg, ChecklistName::RedirectorAccess);
    let checklist =
        Arc::new(ScriptedChecklist::new().answer(ChecklistName::RedirectorAccess, Answer::Denied));
    let redirector = Arc::new(FixedHelper::new(HelperReply::ok().with_note("rewrite-url", "/x")));
    let services = Services::new(checklist).with_redirector(redirector.clone());

    let result = run(cfg, services, get(PLAIN_GET)).await;

    assert!(result.trace.contains(&CalloutStep::RedirectorCheck));
    assert!(redirector.queries().is_empty());
    assert!(!forwarded(result).0.flags.redirected);
}

#[tokio::test]
async fn test_redirector_error_reply_continues() {
    for result in [HelperResult::Err, HelperResult::BrokenHelper, HelperResult::Unknown("??".to_string())] {
        let reply = HelperReply::new(result).with_note("rewrite-url", "/ignored");
        let services = Services::new(Arc::new(ScriptedChecklist::new()))
            .with_redirector(Arc::new(FixedHelper::new(reply)));

        let (request, _) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

        assert_eq!(request.effective_uri(), "http://origin.example/page");
    }
}

#[tokio::test]
async fn test_helper_timeout_bypass() {
    let mut cfg = base_config();
    cfg.redirector = Some(helper_config(10, TimeoutPolicy::Bypass));
    let slow = Arc::new(FixedHelper::delayed(
        HelperReply::ok().with_note("rewrite-url", "/late"),
        Duration::from_secs(5),
    ));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_redirector(slow);

    let (request, _) = forwarded(run(cfg, services, get(PLAIN_GET)).await);

    assert!(!request.flags.redirected);
}

#[tokio::test]
async fn test_helper_timeout_fail() {
    let mut cfg = base_config();
    cfg.store_id = Some(helper_config(10, TimeoutPolicy::Fail));
    let slow = Arc::new(FixedHelper::delayed(HelperReply::ok(), Duration::from_secs(5)));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_store_id(slow);

    let result = run(cfg, services, get(PLAIN_GET)).await;

    assert_eq!(result.trace.last(), Some(&CalloutStep::StoreIdCheck));
    let (cause, status) = denied(result);
    assert!(matches!(cause, ErrorCause::GatewayFailure(_)));
    assert_eq!(status, StatusCode::InternalServerError);
}

#[tokio::test]
async fn test_store_id_assigned() {
    let helper = Arc::new(FixedHelper::new(HelperReply::ok().with_note("store-id", "http://cdn.internal.example/page")));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_store_id(helper);

    let (request, _) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

    assert_eq!(request.store_id.as_deref(), Some("http://cdn.internal.example/page"));
    assert_eq!(request.effective_uri(), "http://origin.example/page");
}

#[tokio::test]
async fn test_store_id_equal_to_uri_ignored() {
    let helper = Arc::new(FixedHelper::new(HelperReply::ok().with_note("store-id", "http://origin.example/page")));
    let services = Services::new(Arc::new(ScriptedChecklist::new())).with_store_id(helper);

    let (request, _) = forwarded(run(base_config(), services, get(PLAIN_GET)).await);

    assert!(request.store_id.is_none());
}

#[tokio::test]
async fn test_no_cache_denial_marks_request() {
    let mut cfg = base_config();
    configure(&mut cfg, ChecklistName::NoCache);
    let checklist = Arc::new(ScriptedChecklist::new().answer(ChecklistName::NoCache, Answer::Denied));

    let (request, _) = forwarded(run(cfg.clone(), Services::new(checklist), get(PLAIN_GET)).await);
    assert!(request.flags.no_cache);
    assert!(!request.flags.cachable);

    let (request, _) = forwarded(run(cfg, Services::new(Arc::new(ScriptedChecklist::new())), get(PLAIN_GET)).await);
    assert!(!request.flags.no_cache);
    assert!(request.flags.cachable);
}

#[tokio::test]
async fn test_adapted_access_sees_rewritten_request() {
    let mut cfg = base_config();
    configure(&mut cfg, ChecklistName::AdaptedHttpAccess);
    let checklist =
        Arc::new(ScriptedChecklist::new().answer(ChecklistName::AdaptedHttpAccess, Answer::Denied));
    let redirector = Arc::new(FixedHelper::new(HelperReply::ok().with_note("rewrite-url", "/blocked")));
    let services = Services::new(checklist).with_redirector(redirector);

    let result = run(cfg, services, get(PLAIN_GET)).await;

    assert_eq!(result.trace.last(), Some(&CalloutStep::AdaptedAccessCheck));
    assert_eq!(denied(result).0, ErrorCause::AccessDenied);
}

fn bump_config() -> Config {
    let mut cfg = base_config();
    configure(&mut cfg, ChecklistName::SslBump);
    cfg.listener.ssl_bump = true;
    cfg
}

const CONNECT: &str = "CONNECT secure.example:443 HTTP/1.1\r\nHost: secure.example:443\r\n\r\n";

#[tokio::test]
async fn test_ssl_bump_modes() {
    let cases = [
        (Answer::Allowed, BumpMode::Bump),
        (Answer::Bump(BumpMode::Peek), BumpMode::Peek),
        (Answer::Denied, BumpMode::Splice),
    ];

    for (answer, expected) in cases {
        let checklist = Arc::new(ScriptedChecklist::new().answer(ChecklistName::SslBump, answer));

        let result = run(bump_config(), Services::new(checklist), get(CONNECT)).await;

        assert_eq!(result.trace.last(), Some(&CalloutStep::SslBumpCheck));
        let (_, decision) = forwarded(result);
        assert_eq!(decision.bump, Some(expected));
    }
}

#[tokio::test]
async fn test_ssl_bump_terminate_closes_connection() {
    let checklist = Arc::new(
        ScriptedChecklist::new().answer(ChecklistName::SslBump, Answer::Bump(BumpMode::Terminate)),
    );

    let result = run(bump_config(), Services::new(checklist), get(CONNECT)).await;

    assert!(matches!(result.outcome, Some(PipelineOutcome::ConnectionMustClose(_))));
}

#[tokio::test]
async fn test_ssl_bump_skipped_without_bump_listener() {
    let mut cfg = bump_config();
    cfg.listener.ssl_bump = false;
    let checklist = Arc::new(ScriptedChecklist::new());

    let result = run(cfg, Services::new(checklist.clone()), get(CONNECT)).await;

    assert!(!result.trace.contains(&CalloutStep::SslBumpCheck));
    assert_eq!(checklist.calls_to(ChecklistName::SslBump), 0);
    assert_eq!(forwarded(result).1.bump, None);
}

#[tokio::test]
async fn test_deferred_check_resolved() {
    let checklist = Arc::new(ScriptedChecklist::new().defer(ChecklistName::HttpAccess));
    let pending = PendingChecks::new();
    let services = Services::new(checklist.clone()).with_pending(pending.clone());
    let txn = Transaction::new();

    let handle = tokio::spawn(run_callouts(get(PLAIN_GET), context(base_config(), services, &txn)));
    while checklist.deferred_tokens().is_empty() {
        tokio::task::yield_now().await;
    }
    let token = checklist.deferred_tokens()[0];
    assert_eq!(pending.outstanding(), vec![token]);

    assert!(pending.resolve(token, Answer::Allowed));
    let outcome = handle.await.unwrap();

    assert!(matches!(outcome, Some(PipelineOutcome::Forwardable(..))));
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_late_answer_after_abort_is_discarded() {
    let mut cfg = base_config();
    cfg.redirector = Some(helper_config(1_000, TimeoutPolicy::Bypass));
    let checklist = Arc::new(ScriptedChecklist::new().defer(ChecklistName::HttpAccess));
    let redirector = Arc::new(FixedHelper::new(HelperReply::ok()));
    let services = Services::new(checklist.clone()).with_redirector(redirector.clone());
    let pending = services.pending.clone();
    let txn = Transaction::new();

    let handle = tokio::spawn(run_callouts(get(PLAIN_GET), context(cfg, services, &txn)));
    while checklist.deferred_tokens().is_empty() {
        tokio::task::yield_now().await;
    }
    let token = checklist.deferred_tokens()[0];

    txn.abort();
    let outcome = handle.await.unwrap();

    assert!(outcome.is_none());
    assert!(!pending.resolve(token, Answer::Allowed));
    assert!(pending.is_empty());
    assert!(redirector.queries().is_empty());
}

#[tokio::test]
async fn test_dropped_transaction_ends_pipeline() {
    let checklist = Arc::new(ScriptedChecklist::new().defer(ChecklistName::HttpAccess));
    let services = Services::new(checklist.clone());
    let pending = services.pending.clone();
    let txn = Transaction::new();

    let handle = tokio::spawn(run_callouts(get(PLAIN_GET), context(base_config(), services, &txn)));
    while checklist.deferred_tokens().is_empty() {
        tokio::task::yield_now().await;
    }

    drop(txn);

    assert!(handle.await.unwrap().is_none());
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_intercepted_request_end_to_end() {
    let mut cfg = xff_config();
    cfg.listener.intercepted = true;
    cfg.follow_x_forwarded_for.acl_uses_indirect_client = true;
    configure(&mut cfg, ChecklistName::NoCache);
    cfg.redirector = Some(helper_config(1_000, TimeoutPolicy::Bypass));

    let checklist = Arc::new(
        ScriptedChecklist::new()
            .answer_for(ChecklistName::HttpAccess, "192.0.2.10", Answer::Denied)
            .answer(ChecklistName::NoCache, Answer::Denied),
    );
    let redirector = Arc::new(FixedHelper::new(
        HelperReply::ok()
            .with_note("rewrite-url", "/v2/index.html")
            .with_note("user", "alice"),
    ));
    let store_id = Arc::new(FixedHelper::new(HelperReply::ok().with_note("store-id", "site/index")));
    let services = Services::new(checklist.clone())
        .with_redirector(redirector.clone())
        .with_store_id(store_id.clone())
        .with_resolver(Arc::new(StaticResolver::default().with("site.example", &["198.51.100.1"])));

    let listener = cfg.listener.clone();
    let request = parse_request(
        b"GET /index.html HTTP/1.1\r\nHost: site.example\r\nX-Forwarded-For: 172.16.0.5\r\n\r\n",
        &listener,
    );

    let result = run(cfg, services, request).await;
    assert_eq!(result.xff_checks, 1);
    let (request, decision) = forwarded(result);

    // the direct client would have been denied; the indirect one is not
    assert_eq!(request.indirect_client_addr, ip("172.16.0.5"));
    assert!(request.flags.host_verified);
    assert!(request.flags.redirected);
    assert_eq!(request.effective_uri(), "http://site.example/v2/index.html");
    assert_eq!(request.helper_user.as_deref(), Some("alice"));
    assert_eq!(request.store_id.as_deref(), Some("site/index"));
    assert!(request.flags.no_cache);
    assert!(!request.flags.cachable);
    assert_eq!(decision, ForwardDecision::default());

    // the store-ID helper saw the rewritten URL and the helper's user
    let queries = store_id.queries();
    assert_eq!(queries[0].url, "http://site.example/v2/index.html");
    assert_eq!(queries[0].user.as_deref(), Some("alice"));
    assert_eq!(queries[0].client, ip("172.16.0.5"));
}
