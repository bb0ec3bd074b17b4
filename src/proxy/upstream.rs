//! Origin connection and request forwarding
//!
//! Requests that cleared the callouts are sent to the origin named by
//! their URL. CONNECT requests get a raw TCP connection for splicing.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::callout::helper::BoxFuture;
use crate::config::UpstreamConfig;
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Limit for an origin's status line plus headers.
const MAX_RESPONSE_HEADER: usize = 64 * 1024;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authorization",
    "Proxy-Authenticate",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// The stage a forwardable request is handed to.
pub trait ForwardStage: Send + Sync {
    /// Sends the request to its origin and returns the reply.
    fn forward<'a>(
        &'a self,
        request: &'a Request,
        upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, Result<Response>>;

    /// Opens the TCP connection a CONNECT tunnel is spliced onto.
    fn open_tunnel<'a>(
        &'a self,
        request: &'a Request,
        upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, Result<TcpStream>>;
}

/// Forwards straight to the origin server, one connection per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginForwarder;

impl OriginForwarder {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, request: &Request, upstream: &UpstreamConfig) -> Result<TcpStream> {
        let port = request
            .url
            .effective_port()
            .context("Request URL has no port")?;
        let addr = (request.url.host.as_str(), port);

        let stream = timeout(upstream.connect_timeout(), TcpStream::connect(addr))
            .await
            .context("Connection timeout")?
            .with_context(|| format!("Failed to connect to {}", request.url.authority()))?;

        tracing::trace!(origin = %request.url.authority(), "Connected to origin");
        Ok(stream)
    }

    async fn exchange(&self, request: &Request, upstream: &UpstreamConfig) -> Result<Response> {
        let mut stream = self.connect(request, upstream).await?;

        timeout(upstream.request_timeout(), async {
            let request_bytes = build_http_request(request);
            stream.write_all(&request_bytes).await?;
            stream.flush().await?;

            tracing::trace!("Request sent to origin");

            read_http_response(&mut stream, request.method()).await
        })
        .await
        .context("Request timeout")?
    }
}

impl ForwardStage for OriginForwarder {
    fn forward<'a>(
        &'a self,
        request: &'a Request,
        upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            tracing::debug!(
                method = %request.method(),
                uri = %request.effective_uri(),
                "Forwarding request to origin"
            );

            match self.exchange(request, upstream).await {
                Ok(response) => {
                    tracing::info!(
                        status = response.status.as_u16(),
                        method = %request.method(),
                        uri = %request.effective_uri(),
                        "Request forwarded successfully"
                    );
                    Ok(response)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        method = %request.method(),
                        uri = %request.effective_uri(),
                        "Failed to forward request"
                    );
                    Err(e)
                }
            }
        })
    }

    fn open_tunnel<'a>(
        &'a self,
        request: &'a Request,
        upstream: &'a UpstreamConfig,
    ) -> BoxFuture<'a, Result<TcpStream>> {
        Box::pin(self.connect(request, upstream))
    }
}

/// Builds the bytes sent to the origin.
///
/// The request line uses origin-form, hop-by-hop headers are dropped and
/// the connection is closed after one exchange.
pub fn build_http_request(request: &Request) -> Vec<u8> {
    let mut buffer = Vec::new();

    buffer.extend_from_slice(
        format!(
            "{} {} HTTP/1.1\r\n",
            request.method(),
            request.url.origin_form()
        )
        .as_bytes(),
    );

    let mut headers = request.headers.clone();

    // Connection may name further hop-by-hop headers
    let listed: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }

    headers.set("Host", request.url.authority());

    let forwarded = match headers.get_list("X-Forwarded-For") {
        Some(list) => format!("{}, {}", list, request.client_addr.ip()),
        None => request.client_addr.ip().to_string(),
    };
    headers.set("X-Forwarded-For", forwarded);
    headers.append("Via", format!("{}.{} frontgate", request.version().major, request.version().minor));

    if !request.body.is_empty() {
        headers.set("Content-Length", request.body.len().to_string());
    }
    headers.set("Connection", "close");

    for field in headers.iter() {
        buffer.extend_from_slice(field.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(&field.value);
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

/// Read HTTP response from the origin
async fn read_http_response(stream: &mut TcpStream, method: &Method) -> Result<Response> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let n = stream.read_buf(&mut buffer).await?;

        if n == 0 {
            anyhow::bail!("Connection closed before complete response received");
        }

        if let Some(headers_end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            let header_bytes = buffer.split_to(headers_end + 4);
            let (status, headers) = parse_response_head(&header_bytes)?;

            let body = if response_has_body(method, status) {
                read_response_body(stream, &mut buffer, &headers).await?
            } else {
                Vec::new()
            };

            return Ok(ResponseBuilder::new(status)
                .headers(headers)
                .body(body)
                .build());
        }

        if buffer.len() > MAX_RESPONSE_HEADER {
            anyhow::bail!("Response headers too large");
        }
    }
}

fn response_has_body(method: &Method, status: StatusCode) -> bool {
    let code = status.as_u16();
    *method != Method::HEAD && !(100..200).contains(&code) && code != 204 && code != 304
}

/// Parses the status line and header fields of an origin reply.
pub fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HeaderMap)> {
    let line_end = head
        .iter()
        .position(|b| *b == b'\n')
        .context("Empty response")?;
    let status_line = std::str::from_utf8(&head[..line_end])
        .context("Invalid UTF-8 in status line")?
        .trim_end();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        anyhow::bail!("Invalid status line: {}", status_line);
    }
    let code: u16 = parts
        .next()
        .context("Status line without code")?
        .parse()
        .context("Invalid status code")?;

    let mut headers =
        HeaderMap::parse(&head[line_end + 1..], true).context("Invalid response headers")?;
    for name in ["Connection", "Keep-Alive", "Proxy-Connection"] {
        headers.remove(name);
    }

    Ok((StatusCode::from_u16(code), headers))
}

/// Read response body based on Content-Length
async fn read_response_body(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    headers: &HeaderMap,
) -> Result<Vec<u8>> {
    let content_length = match headers.get("Content-Length") {
        Some(cl) if !headers.contains("Transfer-Encoding") => cl
            .trim()
            .parse::<usize>()
            .context("Invalid Content-Length from origin")?,
        _ => {
            // No usable length: the origin closes when done
            let mut body = buffer.to_vec();
            buffer.clear();
            stream.read_to_end(&mut body).await?;
            return Ok(body);
        }
    };

    let mut body = Vec::with_capacity(content_length);

    // Use existing buffer data first
    let from_buffer = buffer.len().min(content_length);
    body.extend_from_slice(&buffer[..from_buffer]);
    buffer.advance(from_buffer);

    let mut chunk = [0u8; BUFFER_SIZE];
    while body.len() < content_length {
        let to_read = (content_length - body.len()).min(BUFFER_SIZE);
        let n = stream.read(&mut chunk[..to_read]).await?;

        if n == 0 {
            anyhow::bail!("Connection closed before complete body received");
        }

        body.extend_from_slice(&chunk[..n]);
    }

    Ok(body)
}

/// Maps a forwarding failure to the response the client gets.
pub fn error_response(error: &anyhow::Error) -> Response {
    if error.chain().any(|cause| cause.is::<Elapsed>()) {
        Response::error(
            StatusCode::GatewayTimeout,
            "The origin server did not respond in time.",
        )
    } else {
        Response::error(StatusCode::BadGateway, "Failed to reach the origin server.")
    }
}
