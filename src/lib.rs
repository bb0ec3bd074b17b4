//! Frontgate - HTTP caching proxy front door
//!
//! Parses client requests, runs them through the access and rewrite
//! callouts, and forwards what survives.

pub mod callout;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
