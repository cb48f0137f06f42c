//! Request handler abstraction.

use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;

/// Status returned by handlers that accept a request.
pub const STATUS_OK: u16 = 200;
/// Status returned when a request is rate limited.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// The parts of an inbound request admission control looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Address of the client, already resolved by the transport
    pub client_ip: IpAddr,
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Request path, e.g. `/api/users`
    pub path: String,
}

impl Request {
    pub fn new(client_ip: IpAddr, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip,
            method: method.into(),
            path: path.into(),
        }
    }
}

/// A minimal response: a status code and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header value; names compare case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Anything that can answer a request.
///
/// The gate implements this itself, so it can wrap and be wrapped by other
/// handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, request: Request) -> Response {
        (**self).handle(request).await
    }
}

/// A handler that answers every request with the same status.
#[derive(Debug, Clone, Copy)]
pub struct StatusHandler {
    status: u16,
}

impl StatusHandler {
    pub fn new(status: u16) -> Self {
        Self { status }
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::new(STATUS_OK)
    }
}

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(&self, _request: Request) -> Response {
        Response::new(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let response = Response::new(STATUS_TOO_MANY_REQUESTS).with_header("Retry-After", "6");

        assert_eq!(response.header("retry-after"), Some("6"));
        assert_eq!(response.header("RETRY-AFTER"), Some("6"));
        assert_eq!(response.header("X-Other"), None);
    }

    #[tokio::test]
    async fn test_status_handler() {
        let request = Request::new("127.0.0.1".parse().unwrap(), "GET", "/");

        assert_eq!(StatusHandler::default().handle(request.clone()).await.status, STATUS_OK);
        assert_eq!(StatusHandler::new(503).handle(request).await.status, 503);
    }

    #[tokio::test]
    async fn test_shared_handler() {
        let handler: Arc<dyn Handler> = Arc::new(StatusHandler::new(204));
        let request = Request::new("::1".parse().unwrap(), "DELETE", "/item");

        assert_eq!(handler.handle(request).await.status, 204);
    }
}
