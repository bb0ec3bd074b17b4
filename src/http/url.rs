//! Request URL as the proxy sees it: scheme, authority and path.
//!
//! Absolute-form targets go through the `url` crate. Authority-form
//! (`host:port`, CONNECT only) and origin-form (`/path`, completed from the
//! Host header) are handled here because `url::Url` cannot represent them.

use std::fmt;

use thiserror::Error;

use crate::http::request::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    /// CONNECT tunnels carry no scheme on the wire.
    Authority,
}

impl Scheme {
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Scheme::Http => Some(80),
            Scheme::Https => Some(443),
            Scheme::Authority => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Authority => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    pub scheme: Scheme,
    /// Lower-cased host name or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: Option<u16>,
    /// Path plus query; empty for authority-form.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("unsupported or malformed absolute URL: {0}")]
    Absolute(String),
    #[error("authority-form target requires CONNECT")]
    AuthorityWithoutConnect,
    #[error("malformed authority: {0}")]
    Authority(String),
    #[error("origin-form target without a Host header")]
    MissingHost,
    #[error("unrecognized request target: {0}")]
    Unrecognized(String),
}

impl RequestUrl {
    /// Builds the URL for a request target.
    ///
    /// `host_header` completes origin-form targets.
    pub fn from_target(
        method: &Method,
        target: &str,
        host_header: Option<&str>,
    ) -> Result<Self, UrlError> {
        if *method == Method::CONNECT {
            return Self::parse_authority(target, Scheme::Authority);
        }
        if target.starts_with('/') {
            let host = host_header.ok_or(UrlError::MissingHost)?;
            let mut url = Self::parse_authority(host, Scheme::Http)?;
            url.path = target.to_string();
            return Ok(url);
        }
        if target == "*" && *method == Method::OPTIONS {
            let host = host_header.ok_or(UrlError::MissingHost)?;
            let mut url = Self::parse_authority(host, Scheme::Http)?;
            url.path = "*".to_string();
            return Ok(url);
        }
        if target.contains("://") {
            return Self::parse_absolute(target);
        }
        if target.contains(':') {
            return Err(UrlError::AuthorityWithoutConnect);
        }
        Err(UrlError::Unrecognized(target.to_string()))
    }

    /// Parses an absolute `http`/`https` URL.
    pub fn parse_absolute(text: &str) -> Result<Self, UrlError> {
        let parsed =
            url::Url::parse(text).map_err(|_| UrlError::Absolute(text.to_string()))?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(UrlError::Absolute(text.to_string())),
        };
        let host = match parsed.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(UrlError::Absolute(text.to_string())),
        };
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            scheme,
            host,
            port: parsed.port(),
            path,
        })
    }

    /// Parses `host[:port]`, with IPv6 literals in brackets.
    pub fn parse_authority(text: &str, scheme: Scheme) -> Result<Self, UrlError> {
        let (host, port) =
            split_host_port(text).ok_or_else(|| UrlError::Authority(text.to_string()))?;
        if host.is_empty() || (scheme == Scheme::Authority && port.is_none()) {
            return Err(UrlError::Authority(text.to_string()));
        }
        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path: String::new(),
        })
    }

    /// Explicit port, or the scheme default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.scheme.default_port())
    }

    /// `host[:port]` as it would appear in a Host header.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    /// Path plus query, never empty.
    pub fn origin_form(&self) -> &str {
        if self.path.is_empty() { "/" } else { &self.path }
    }

    /// Resolves a helper-supplied rewrite against this URL.
    ///
    /// A target starting with `/` keeps scheme and authority and replaces the
    /// path; anything else must be an absolute URL.
    pub fn resolve(&self, rewrite: &str) -> Result<Self, UrlError> {
        if rewrite.starts_with('/') {
            return Ok(Self {
                path: rewrite.to_string(),
                ..self.clone()
            });
        }
        Self::parse_absolute(rewrite)
    }
}

impl fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Authority => write!(f, "{}", self.authority()),
            scheme => write!(f, "{}://{}{}", scheme.as_str(), self.authority(), self.origin_form()),
        }
    }
}

/// Splits `host[:port]`.
///
/// Returns `None` for a malformed port or an unterminated IPv6 literal.
/// An empty port (`host:`) counts as no port.
pub fn split_host_port(text: &str) -> Option<(&str, Option<u16>)> {
    let (host, rest) = if let Some(inner) = text.strip_prefix('[') {
        let close = inner.find(']')?;
        (&inner[..close], &inner[close + 1..])
    } else {
        match text.rfind(':') {
            Some(colon) => (&text[..colon], &text[colon..]),
            None => (text, ""),
        }
    };

    let port = match rest {
        "" | ":" => None,
        rest => {
            let digits = rest.strip_prefix(':')?;
            match digits.parse::<u16>() {
                Ok(0) | Err(_) => return None,
                Ok(port) => Some(port),
            }
        }
    };
    Some((host, port))
}
