//! Host header verification.
//!
//! An intercepted connection was addressed by IP at the TCP level, so the
//! Host header is the client's unverified claim about where it meant to go.
//! Forwarding by that claim lets a page poison the cache for another
//! site. The header must therefore agree with the intercepted destination,
//! or, on a normal forward-proxy port, with the request's own authority.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::callout::context::TransactionContext;
use crate::callout::state::{ErrorCause, StepResult};
use crate::http::request::Request;
use crate::http::url::split_host_port;

/// The outcome of comparing the Host header with the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCheck {
    Verified,
    Conflict(String),
}

/// Whether the step has anything to look at.
pub fn applies(request: &Request) -> bool {
    request.header("Host").is_some()
}

pub async fn run(request: &mut Request, ctx: &TransactionContext) -> Option<StepResult> {
    let check = if request.flags.intercepted {
        ctx.liveness.guard(verify_intercepted(request, ctx)).await?
    } else {
        verify_authority(request)
    };

    match check {
        HostCheck::Verified => {
            debug!(host = ?request.header("Host"), "Host header verified");
            request.flags.host_verified = true;
            Some(StepResult::Advance)
        }
        HostCheck::Conflict(reason) => {
            warn!(
                client = %request.client_addr,
                local = %request.local_addr,
                host = ?request.header("Host"),
                reason = %reason,
                "SECURITY ALERT: Host header forgery detected"
            );
            request.flags.host_forgery = true;
            if ctx.config.host_verify.strict {
                return Some(StepResult::Deny(ErrorCause::HostConflict));
            }
            // keep serving this client, but never share the reply
            request.flags.cachable = false;
            request.flags.hierarchical = false;
            Some(StepResult::Advance)
        }
    }
}

/// Compares the Host header with the address the client actually connected to.
async fn verify_intercepted(request: &Request, ctx: &TransactionContext) -> HostCheck {
    let Some(header) = request.header("Host") else {
        return HostCheck::Verified;
    };
    let Some((host, port)) = split_host_port(header.trim()) else {
        return HostCheck::Conflict("malformed Host header".to_string());
    };

    let local = request.local_addr;
    if let Some(port) = port {
        if port != local.port() {
            return HostCheck::Conflict(format!("port {} differs from {}", port, local.port()));
        }
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return if ip == local.ip() {
            HostCheck::Verified
        } else {
            HostCheck::Conflict(format!("IP {} differs from {}", ip, local.ip()))
        };
    }

    match ctx.services.resolver.resolve(host, local.port()).await {
        Ok(addrs) if addrs.contains(&local.ip()) => HostCheck::Verified,
        Ok(addrs) => HostCheck::Conflict(format!(
            "{} resolves to {:?}, not {}",
            host,
            addrs,
            local.ip()
        )),
        Err(e) => HostCheck::Conflict(format!("cannot resolve {}: {}", host, e)),
    }
}

/// Compares the Host header with the request URL's authority.
pub fn verify_authority(request: &Request) -> HostCheck {
    let Some(header) = request.header("Host") else {
        return HostCheck::Verified;
    };
    let Some((host, port)) = split_host_port(header.trim()) else {
        return HostCheck::Conflict("malformed Host header".to_string());
    };

    let url = &request.url;
    if !host.eq_ignore_ascii_case(&url.host) {
        return HostCheck::Conflict(format!("host {} differs from {}", host, url.host));
    }

    let claimed = port.or_else(|| url.scheme.default_port());
    match (claimed, url.effective_port()) {
        (Some(claimed), Some(actual)) if claimed != actual => {
            HostCheck::Conflict(format!("port {} differs from {}", claimed, actual))
        }
        _ => HostCheck::Verified,
    }
}
