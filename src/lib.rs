//! Turnstile - Per-Client Admission Control
//!
//! This crate decides, per incoming request, whether to admit or reject it
//! based on token-bucket rate budgets keyed by client address, HTTP method and
//! requested resource. Rules are loaded once from a `ratelimit` directive file;
//! the gate wraps any downstream [`gate::Handler`].

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
