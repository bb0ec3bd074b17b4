//! Built-in rule checklist.
//!
//! Each named list is an ordered set of rules; the first rule whose
//! criteria all match decides, otherwise the list default applies. A rule
//! can match on the source network, a destination domain suffix and the
//! request method. That is the whole language.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::callout::checklist::{Answer, CheckRequest, Checklist, ChecklistName, PendingChecks, Verdict};
use crate::config::{AccessConfig, ChecklistConfig, ConfigError, RuleConfig};
use crate::http::request::Method;

const ALL_LISTS: [ChecklistName; 7] = [
    ChecklistName::HttpAccess,
    ChecklistName::AdaptedHttpAccess,
    ChecklistName::FollowXForwardedFor,
    ChecklistName::RedirectorAccess,
    ChecklistName::StoreIdAccess,
    ChecklistName::NoCache,
    ChecklistName::SslBump,
];

/// An address range such as `10.0.0.0/8` or a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (s, None),
        };
        let network: IpAddr = addr.trim().parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = prefix.unwrap_or(max);
        if prefix_len > max {
            return None;
        }
        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_bits(self.prefix_len, 32) as u32;
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_bits(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn mask_bits(prefix_len: u8, width: u32) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    let ones = u128::MAX << (128 - u32::from(prefix_len));
    ones >> (128 - width)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Answer,
    pub src: Option<CidrRange>,
    /// Lower-cased; a leading dot matches subdomains and the domain itself.
    pub dstdomain: Option<String>,
    pub methods: Vec<Method>,
}

impl Rule {
    fn from_config(list: ChecklistName, cfg: &RuleConfig) -> Result<Self, ConfigError> {
        let action = parse_action(list, &cfg.action)?;
        let src = match &cfg.src {
            Some(text) => Some(CidrRange::parse(text).ok_or_else(|| {
                ConfigError::Invalid(format!("{}: bad src network {:?}", list, text))
            })?),
            None => None,
        };
        Ok(Self {
            action,
            src,
            dstdomain: cfg.dstdomain.as_ref().map(|d| d.to_ascii_lowercase()),
            methods: cfg
                .methods
                .iter()
                .map(|m| Method::from_token(m.as_bytes()))
                .collect(),
        })
    }

    pub fn matches(&self, query: &CheckRequest<'_>) -> bool {
        if let Some(src) = &self.src {
            if !src.contains(query.src_addr) {
                return false;
            }
        }
        if let Some(domain) = &self.dstdomain {
            if !domain_matches(domain, &query.request.url.host) {
                return false;
            }
        }
        self.methods.is_empty() || self.methods.contains(query.request.method())
    }
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    match pattern.strip_prefix('.') {
        Some(base) => host == base || host.ends_with(pattern),
        None => host == pattern,
    }
}

fn parse_action(list: ChecklistName, text: &str) -> Result<Answer, ConfigError> {
    match text {
        "allow" => Ok(Answer::Allowed),
        "deny" => Ok(Answer::Denied),
        "auth" => Ok(Answer::AuthRequired),
        other => match other.strip_prefix("bump:") {
            Some(mode) if list == ChecklistName::SslBump => mode
                .parse()
                .map(Answer::Bump)
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", list, e))),
            _ => Err(ConfigError::Invalid(format!(
                "{}: unknown action {:?}",
                list, other
            ))),
        },
    }
}

#[derive(Debug, Clone)]
struct RuleList {
    rules: Vec<Rule>,
    default: Answer,
}

impl RuleList {
    fn from_config(list: ChecklistName, cfg: &ChecklistConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: cfg
                .rules
                .iter()
                .map(|r| Rule::from_config(list, r))
                .collect::<Result<_, _>>()?,
            default: parse_action(list, &cfg.default)?,
        })
    }

    fn evaluate(&self, query: &CheckRequest<'_>) -> Answer {
        self.rules
            .iter()
            .find(|rule| rule.matches(query))
            .map(|rule| rule.action)
            .unwrap_or(self.default)
    }
}

/// Checklist built from the `access` section of the configuration.
///
/// Always answers synchronously.
#[derive(Debug, Clone, Default)]
pub struct RuleChecklist {
    lists: HashMap<ChecklistName, RuleList>,
}

impl RuleChecklist {
    pub fn from_config(access: &AccessConfig) -> Result<Self, ConfigError> {
        let mut lists = HashMap::new();
        for name in ALL_LISTS {
            if let Some(cfg) = access.get(name) {
                lists.insert(name, RuleList::from_config(name, cfg)?);
            }
        }
        Ok(Self { lists })
    }

    pub fn evaluate(&self, query: &CheckRequest<'_>) -> Answer {
        match self.lists.get(&query.list) {
            Some(list) => list.evaluate(query),
            None => {
                tracing::debug!(list = %query.list, "checklist not configured; denying");
                Answer::Denied
            }
        }
    }
}

impl Checklist for RuleChecklist {
    fn check(&self, query: CheckRequest<'_>, _pending: &PendingChecks) -> Verdict {
        let answer = self.evaluate(&query);
        tracing::trace!(list = %query.list, src = %query.src_addr, answer = ?answer, "rule checklist");
        Verdict::Answer(answer)
    }
}
