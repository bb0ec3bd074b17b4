//! HTTP front door.
//!
//! This module turns client bytes into [`request::Request`] objects and
//! answers the client once the callouts have decided what to do.
//!
//! # Architecture
//!
//! - **`charset`**: character classes used by the tokenizer and parser
//! - **`tokenizer`**: a cursor over a byte buffer with commit/rollback
//! - **`parser`**: incremental request-line and header-block parser
//! - **`headers`**: ordered, case-insensitive header fields
//! - **`url`**: request targets and their normalized form
//! - **`request`**: the request object built from a parsed message
//! - **`response`**: response representation with builder pattern
//! - **`writer`**: serializes and writes responses to the client
//! - **`connection`**: the per-client state machine
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Parse request line, headers and body
//!        └──────┬──────┘
//!               │ Request built (parse failures skip to Writing)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Run callouts, then forward/redirect/tunnel
//!        └──────┬───────────┘
//!               │ Response ready (tunnels and aborts go to Closed)
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use frontgate::config::Config;
//! use frontgate::http::connection::Connection;
//! use frontgate::proxy::ProxyState;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let proxy = ProxyState::from_config(Config::default())?;
//!     let listener = TcpListener::bind("127.0.0.1:3128").await?;
//!     let local = listener.local_addr()?;
//!
//!     loop {
//!         let (socket, peer) = listener.accept().await?;
//!         let proxy = proxy.clone();
//!         tokio::spawn(async move {
//!             let mut conn = Connection::new(socket, peer, local, proxy);
//!             if let Err(e) = conn.run().await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```

pub mod charset;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod tokenizer;
pub mod url;
pub mod writer;
