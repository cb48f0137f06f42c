//! Request gate placing admission control in front of a downstream handler.

mod handler;
mod service;

pub use handler::{Handler, Request, Response, StatusHandler, STATUS_OK, STATUS_TOO_MANY_REQUESTS};
pub use service::{
    too_many_requests, Admission, RequestGate, RATE_LIMIT_RETRY_AFTER_HEADER, RETRY_AFTER_HEADER,
};
