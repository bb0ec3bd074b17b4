use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use thiserror::Error;

use crate::config::{ListenerConfig, ParserConfig};
use crate::http::headers::{HeaderError, HeaderMap};
use crate::http::parser::StatusHint;
use crate::http::url::{RequestUrl, UrlError};

/// HTTP request methods.
///
/// Registered methods get their own variant; any other token the parser
/// accepted is kept verbatim in `Other`. Methods are case-sensitive, so
/// `get` is an `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    OPTIONS,
    TRACE,
    CONNECT,
    PATCH,
    /// Cache purge, proxy-specific.
    PURGE,
    /// HTTP/2 connection preface.
    PRI,
    Other(String),
}

impl Method {
    /// Builds a method from a token the parser already validated as `tchar`s.
    pub fn from_token(token: &[u8]) -> Self {
        match token {
            b"GET" => Method::GET,
            b"HEAD" => Method::HEAD,
            b"POST" => Method::POST,
            b"PUT" => Method::PUT,
            b"DELETE" => Method::DELETE,
            b"OPTIONS" => Method::OPTIONS,
            b"TRACE" => Method::TRACE,
            b"CONNECT" => Method::CONNECT,
            b"PATCH" => Method::PATCH,
            b"PURGE" => Method::PURGE,
            b"PRI" => Method::PRI,
            other => Method::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
            Method::PATCH => "PATCH",
            Method::PURGE => "PURGE",
            Method::PRI => "PRI",
            Method::Other(token) => token,
        }
    }

    /// GET and HEAD responses may be cached and served to others.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::GET | Method::HEAD)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_0_9: HttpVersion = HttpVersion::new(0, 9);
    pub const HTTP_1_0: HttpVersion = HttpVersion::new(1, 0);
    pub const HTTP_1_1: HttpVersion = HttpVersion::new(1, 1);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// The parsed first line of a request. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: Bytes,
    pub version: HttpVersion,
}

impl RequestLine {
    pub fn target_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.target)
    }
}

/// Per-transaction flags, derived from headers and set by callouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFlags {
    /// Host header checked against the destination.
    pub host_verified: bool,
    /// Host header did not match the destination (security alert).
    pub host_forgery: bool,
    /// The reply may be stored.
    pub cachable: bool,
    /// The request may be passed to peer caches.
    pub hierarchical: bool,
    /// Do not serve the reply from cache.
    pub no_cache: bool,
    pub range: bool,
    pub auth: bool,
    pub ims: bool,
    /// The URL was replaced by the redirector.
    pub redirected: bool,
    pub done_follow_xff: bool,
    pub intercepted: bool,
    pub accelerated: bool,
    pub ssl_bumped: bool,
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self {
            host_verified: false,
            host_forgery: false,
            cachable: true,
            hierarchical: true,
            no_cache: false,
            range: false,
            auth: false,
            ims: false,
            redirected: false,
            done_follow_xff: false,
            intercepted: false,
            accelerated: false,
            ssl_bumped: false,
        }
    }
}

/// Ordered key/value annotations, mostly from helper replies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notes {
    entries: Vec<(String, String)>,
}

impl Notes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn find_first(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn append(&mut self, other: &Notes) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("unsupported protocol version {0}")]
    VersionNotSupported(HttpVersion),
    #[error("request target is not valid UTF-8")]
    TargetEncoding,
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
}

impl RequestError {
    pub fn hint(&self) -> StatusHint {
        match self {
            RequestError::VersionNotSupported(_) => StatusHint::VersionNotSupported,
            _ => StatusHint::BadRequest,
        }
    }
}

/// One in-flight transaction's request.
///
/// Owned by the connection for the life of the transaction; callouts borrow
/// it mutably one step at a time. A URL rewrite consumes it and yields a new
/// one (see [`Request::rewrite`]).
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub url: RequestUrl,
    pub headers: HeaderMap,
    pub flags: RequestFlags,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Client address asserted through X-Forwarded-For.
    pub indirect_client_addr: IpAddr,
    /// Alternate cache key from the store-ID helper.
    pub store_id: Option<String>,
    pub notes: Notes,
    pub log_tag: Option<String>,
    /// User name reported by a helper.
    pub helper_user: Option<String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Builds a request from the parser's output and the connection facts.
    ///
    /// Header flags are interpreted here because callouts never change
    /// header values.
    pub fn from_parsed(
        line: RequestLine,
        header_block: &[u8],
        parser: &ParserConfig,
        listener: &ListenerConfig,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<Self, RequestError> {
        let version = line.version;
        if version.major >= 2 || version == HttpVersion::new(0, 0) {
            return Err(RequestError::VersionNotSupported(version));
        }

        let headers = HeaderMap::parse(header_block, parser.relaxed)?;
        declared_length(&headers)?;
        let target =
            std::str::from_utf8(&line.target).map_err(|_| RequestError::TargetEncoding)?;
        let url = RequestUrl::from_target(&line.method, target, headers.get("Host"))?;

        let mut request = Self {
            line,
            url,
            headers,
            flags: RequestFlags {
                intercepted: listener.intercepted,
                accelerated: listener.accel,
                ..RequestFlags::default()
            },
            client_addr,
            local_addr,
            indirect_client_addr: client_addr.ip(),
            store_id: None,
            notes: Notes::new(),
            log_tag: None,
            helper_user: None,
            body: Vec::new(),
        };
        request.interpret_headers();
        Ok(request)
    }

    fn interpret_headers(&mut self) {
        let method = &self.line.method;
        let headers = &self.headers;

        self.flags.ims = headers.contains("If-Modified-Since");
        self.flags.no_cache = headers.has_list_member("Pragma", "no-cache")
            || headers.has_list_member("Cache-Control", "no-cache")
            || matches!(method, Method::Other(_));
        self.flags.range = headers.contains("Range") && matches!(method, Method::GET | Method::HEAD);
        if !matches!(method, Method::GET | Method::HEAD) {
            self.headers.remove("Range");
            self.headers.remove("Request-Range");
        }
        self.flags.auth =
            self.headers.contains("Authorization") || self.headers.contains("Proxy-Authorization");
        self.flags.cachable = self.line.method.is_cacheable();
        self.flags.hierarchical =
            self.line.method.is_cacheable() && !self.flags.auth && !self.flags.no_cache;
    }

    pub fn method(&self) -> &Method {
        &self.line.method
    }

    pub fn version(&self) -> HttpVersion {
        self.line.version
    }

    pub fn target(&self) -> &[u8] {
        &self.line.target
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The absolute URI used for logging and helper queries.
    pub fn effective_uri(&self) -> String {
        self.url.to_string()
    }

    /// Body length announced by Content-Length; 0 when absent.
    ///
    /// Malformed and conflicting values never reach a `Request`.
    pub fn content_length(&self) -> usize {
        declared_length(&self.headers).ok().flatten().unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_list_member("Transfer-Encoding", "chunked")
    }

    /// Determines whether the client connection may stay open afterwards.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 needs an explicit opt-in.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_list_member("Connection", "close") {
            return false;
        }
        if self.line.version >= HttpVersion::HTTP_1_1 {
            return true;
        }
        self.headers.has_list_member("Connection", "keep-alive")
            || self.headers.has_list_member("Proxy-Connection", "keep-alive")
    }

    /// Folds helper reply notes into the request.
    pub fn update_notes(&mut self, notes: &Notes) {
        if let Some(tag) = notes.find_first("tag") {
            self.log_tag = Some(tag.to_string());
        }
        if let Some(user) = notes.find_first("user") {
            self.helper_user = Some(user.to_string());
        }
        self.notes.append(notes);
    }

    /// Consumes the request and returns a new one aimed at `url`.
    ///
    /// Everything except the URL and the target is carried over; the new
    /// request is flagged as redirected.
    pub fn rewrite(self, url: RequestUrl) -> Request {
        let target = Bytes::from(url.to_string());
        Request {
            line: RequestLine {
                target,
                ..self.line
            },
            url,
            flags: RequestFlags {
                redirected: true,
                ..self.flags
            },
            ..self
        }
    }
}

/// The single length every Content-Length field agrees on.
///
/// Each field may carry a list; all members must be plain digits and equal,
/// otherwise the body boundary is ambiguous.
fn declared_length(headers: &HeaderMap) -> Result<Option<usize>, RequestError> {
    let mut length = None;

    for field in headers
        .iter()
        .filter(|f| f.name.eq_ignore_ascii_case("Content-Length"))
    {
        let invalid = || {
            RequestError::InvalidContentLength(String::from_utf8_lossy(&field.value).into_owned())
        };
        let text = field.value_str().ok_or_else(invalid)?;

        for member in text.split(',') {
            let member = member.trim_matches([' ', '\t']);
            if member.is_empty() || !member.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value: usize = member.parse().map_err(|_| invalid())?;
            match length {
                Some(seen) if seen != value => return Err(RequestError::ConflictingContentLength),
                _ => length = Some(value),
            }
        }
    }

    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_method_is_other() {
        assert_eq!(Method::from_token(b"get"), Method::Other("get".to_string()));
        assert_eq!(Method::from_token(b"GET").to_string(), "GET");
    }

    #[test]
    fn version_display() {
        assert_eq!(HttpVersion::HTTP_1_1.to_string(), "HTTP/1.1");
        assert!(HttpVersion::HTTP_1_0 < HttpVersion::HTTP_1_1);
    }
}
