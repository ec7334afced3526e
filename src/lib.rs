//! Stub Server
//!
//! A configurable HTTP stub server: any request gets a programmable
//! response, so client code can be tested against controllable server
//! behavior.
//!
//! # Features
//!
//! - **Live Configuration**: Set status, body, and delay per path or globally
//! - **Failure Injection**: Fail every Nth request with a chosen status
//! - **Generated Content**: Random strings and buffers, fresh or cached by size
//! - **Request History**: Inspect recent exchanges, filtered by URL
//! - **Hit Counters**: Per-path, per-method request counts
//! - **Forwarding**: Proxy a path to an upstream URL
//!
//! # Example
//!
//! ```text
//! GET /.config?path=/hello&body=Hello&statusCode=201
//! GET /.config?path=/flaky&errorCode=503&errorPct=3
//! GET /hello                          -> 201 "Hello"
//! GET /:delay/250/orders              -> delayed self-description
//! GET /.config?log=5&logFilter=flaky  -> last five /flaky exchanges
//! ```

pub mod config;
pub mod content;
pub mod context;
pub mod directive;
pub mod engine;
pub mod fault;
pub mod history;
pub mod proxy;
pub mod server;
pub mod store;

pub use config::StubServerConfig;
pub use engine::Engine;
