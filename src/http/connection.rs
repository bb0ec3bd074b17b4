use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::callout::context::{Transaction, TransactionContext};
use crate::callout::pipeline::{PipelineOutcome, run_callouts};
use crate::callout::state::BumpMode;
use crate::config::Config;
use crate::http::parser::{ParseOutcome, RequestParser};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::ProxyState;
use crate::proxy::upstream;

/// Largest request body buffered for forwarding.
pub const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
    state: ConnectionState,
    proxy: ProxyState,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    /// The client shut down its sending side.
    half_closed: bool,
}

pub enum ConnectionState {
    Reading,
    /// A request and the configuration snapshot it was parsed under.
    Processing(Request, Arc<Config>),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

enum ReadOutcome {
    Request(Request, Arc<Config>),
    /// Answer with this and close.
    Reject(Response),
    Eof,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        proxy: ProxyState,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            state: ConnectionState::Reading,
            proxy,
            client_addr,
            local_addr,
            half_closed: false,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        ReadOutcome::Request(request, cfg) => {
                            ConnectionState::Processing(request, cfg)
                        }
                        ReadOutcome::Reject(response) => respond(response, false),
                        ReadOutcome::Eof => ConnectionState::Closed,
                    };
                }

                ConnectionState::Processing(request, cfg) => {
                    self.state = self.process(request, cfg).await?;
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads one request, including its body.
    ///
    /// Parse and construction failures come back as a response to send
    /// before closing.
    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        let cfg = self.proxy.config.snapshot();
        let mut parser = RequestParser::new(cfg.parser.clone());

        loop {
            let step = parser.parse(&self.buffer);
            self.buffer.advance(step.consumed);

            match step.outcome {
                ParseOutcome::Parsed(line, header_block) => {
                    let request = match Request::from_parsed(
                        line,
                        &header_block,
                        &cfg.parser,
                        &cfg.listener,
                        self.client_addr,
                        self.local_addr,
                    ) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(client = %self.client_addr, error = %e, "rejecting request");
                            return Ok(ReadOutcome::Reject(Response::error(
                                e.hint().status(),
                                &e.to_string(),
                            )));
                        }
                    };
                    return self.read_body(request, cfg).await;
                }

                ParseOutcome::Failed(failure, hint) => {
                    warn!(client = %self.client_addr, error = %failure, "HTTP parse error");
                    return Ok(ReadOutcome::Reject(Response::error(
                        hint.status(),
                        &failure.to_string(),
                    )));
                }

                ParseOutcome::NeedMoreData => {}
            }

            if self.half_closed {
                // requests buffered before the half-close have been served
                return Ok(ReadOutcome::Eof);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;

            if n == 0 {
                // Client closed connection
                if !self.buffer.is_empty() {
                    debug!(client = %self.client_addr, pending = self.buffer.len(), "client closed mid-request");
                }
                return Ok(ReadOutcome::Eof);
            }

            tracing::trace!(bytes = n, "read from client");
        }
    }

    async fn read_body(
        &mut self,
        mut request: Request,
        cfg: Arc<Config>,
    ) -> anyhow::Result<ReadOutcome> {
        if request.is_chunked() {
            return Ok(ReadOutcome::Reject(Response::error(
                StatusCode::NotImplemented,
                "Chunked request bodies are not supported.",
            )));
        }

        let length = request.content_length();
        if length > MAX_REQUEST_BODY {
            return Ok(ReadOutcome::Reject(Response::error(
                StatusCode::PayloadTooLarge,
                "Request body too large.",
            )));
        }

        while self.buffer.len() < length {
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                debug!(client = %self.client_addr, "client closed mid-body");
                return Ok(ReadOutcome::Eof);
            }
        }
        if length > 0 {
            request.body = self.buffer.split_to(length).to_vec();
        }

        info!(
            client = %self.client_addr,
            method = %request.method(),
            uri = %request.effective_uri(),
            version = %request.version(),
            "request received"
        );
        Ok(ReadOutcome::Request(request, cfg))
    }

    async fn process(
        &mut self,
        request: Request,
        cfg: Arc<Config>,
    ) -> anyhow::Result<ConnectionState> {
        let keep_alive = request.keep_alive();
        let txn = Transaction::new();
        let services = (*self.proxy.services()).clone();
        let ctx = TransactionContext::new(cfg.clone(), services, txn.liveness());

        let Some(outcome) = self.await_callouts(request, ctx, &txn, &cfg).await else {
            debug!(client = %self.client_addr, epoch = txn.epoch(), "transaction aborted");
            return Ok(ConnectionState::Closed);
        };

        let next = match outcome {
            PipelineOutcome::Forwardable(request, decision) => {
                if let Some(redirect) = decision.redirect {
                    respond(Response::redirect(redirect.status, &redirect.location), keep_alive)
                } else if *request.method() == Method::CONNECT {
                    self.tunnel(request, decision.bump, &cfg).await?;
                    ConnectionState::Closed
                } else {
                    let response = match self.proxy.forwarder.forward(&request, &cfg.upstream).await {
                        Ok(response) => response,
                        Err(e) => upstream::error_response(&e),
                    };
                    respond(response, keep_alive)
                }
            }

            PipelineOutcome::Denied(cause, status) => {
                let mut response = Response::error(status, &cause.to_string());
                match status {
                    StatusCode::ProxyAuthenticationRequired => {
                        response.headers.set("Proxy-Authenticate", "Basic realm=\"frontgate\"");
                    }
                    StatusCode::Unauthorized => {
                        response.headers.set("WWW-Authenticate", "Basic realm=\"frontgate\"");
                    }
                    _ => {}
                }
                respond(response, keep_alive && !cause.closes_connection())
            }

            PipelineOutcome::ConnectionMustClose(reason) => {
                info!(client = %self.client_addr, reason = %reason, "closing connection");
                ConnectionState::Closed
            }
        };

        Ok(next)
    }

    /// Runs the callouts while watching the client socket.
    ///
    /// Bytes the client pipelines meanwhile are buffered for the next
    /// request. A reset aborts the transaction. A half-close does not.
    async fn await_callouts(
        &mut self,
        request: Request,
        ctx: TransactionContext,
        txn: &Transaction,
        cfg: &Config,
    ) -> Option<PipelineOutcome> {
        let limit = cfg.parser.max_request_header_size;
        let callouts = run_callouts(request, ctx);
        tokio::pin!(callouts);

        loop {
            let reading = !self.half_closed && !txn.is_aborted() && self.buffer.len() < limit;
            tokio::select! {
                outcome = &mut callouts => return outcome,
                read = self.stream.read_buf(&mut self.buffer), if reading => match read {
                    Ok(0) => {
                        debug!(client = %self.client_addr, "client half-closed during callouts");
                        self.half_closed = true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(client = %self.client_addr, error = %e, "client lost during callouts");
                        txn.abort();
                    }
                },
            }
        }
    }

    /// Answers a CONNECT and splices bytes both ways until either side closes.
    async fn tunnel(
        &mut self,
        request: Request,
        bump: Option<BumpMode>,
        cfg: &Config,
    ) -> anyhow::Result<()> {
        if let Some(mode @ (BumpMode::Bump | BumpMode::Peek | BumpMode::Stare)) = bump {
            warn!(
                mode = %mode,
                authority = %request.url.authority(),
                "TLS interception is not available; splicing instead"
            );
        }

        let mut origin = match self.proxy.forwarder.open_tunnel(&request, &cfg.upstream).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(authority = %request.url.authority(), error = %e, "tunnel setup failed");
                let mut response = upstream::error_response(&e);
                response.headers.set("Connection", "close");
                ResponseWriter::new(&response)
                    .write_to_stream(&mut self.stream)
                    .await?;
                return Ok(());
            }
        };

        self.stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        self.stream.flush().await?;

        if !self.buffer.is_empty() {
            origin.write_all(&self.buffer).await?;
            self.buffer.clear();
        }

        let (from_client, from_origin) = tokio::io::copy_bidirectional(&mut self.stream, &mut origin)
            .await
            .context("tunnel I/O failed")?;

        info!(
            authority = %request.url.authority(),
            from_client,
            from_origin,
            "tunnel closed"
        );
        Ok(())
    }
}

fn respond(mut response: Response, keep_alive: bool) -> ConnectionState {
    if !keep_alive {
        response.headers.set("Connection", "close");
    }
    ConnectionState::Writing(ResponseWriter::new(&response), keep_alive)
}
