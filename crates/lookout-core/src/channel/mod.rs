//! Instrumentation channel between injected observation scripts and the
//! evaluator.
//!
//! The channel is a local TCP listener speaking newline-delimited JSON
//! ([`ChannelMessage`](crate::domain::ChannelMessage) per line). A physical
//! connection binds to a logical session by sending a `hello` handshake with
//! the session id; a later `hello` for the same session supersedes the
//! previous transport. Nothing is buffered across a drop — a lost message is
//! lost, and idempotent scripts re-initialize on reconnect (the staged
//! observation source is re-sent on every connect).

pub mod server;

pub use server::{ChannelServer, Inbound, SessionChannel};
