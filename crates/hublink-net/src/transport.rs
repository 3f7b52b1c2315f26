/*!
 * Transport contract for hub connections.
 *
 * The runtime never opens sockets itself; it drives abstract transports
 * through this contract. A transport represents one HTTP-like exchange with
 * a hub and is advanced cooperatively, one bounded step at a time, from the
 * single execution context that owns the client.
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use hublink_core::error::{Error, Result};

/// Progress status returned by one transport step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Nothing became ready within the wait budget
    Idle,
    /// New reply bytes are available
    DataReady,
    /// The exchange reached end-of-stream
    Eof,
}

/// Request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Read-only request
    Get,
    /// Request carrying a body
    Post,
}

/// One request to perform against a hub
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Root URL of the target hub, with a trailing slash
    pub hub_url: String,
    /// Request verb
    pub verb: Verb,
    /// Path and query relative to the device root, starting with `/`
    pub path: String,
    /// Request body, empty for GET
    pub body: Vec<u8>,
    /// Authentication user, empty for anonymous access
    pub user: String,
    /// Authentication password
    pub password: String,
}

impl RequestSpec {
    /// Build a GET request for a hub path
    pub fn get<U: Into<String>, P: Into<String>>(hub_url: U, path: P) -> Self {
        Self {
            hub_url: hub_url.into(),
            verb: Verb::Get,
            path: path.into(),
            body: Vec::new(),
            user: String::new(),
            password: String::new(),
        }
    }

    /// Build a POST request for a hub path
    pub fn post<U: Into<String>, P: Into<String>>(hub_url: U, path: P, body: Vec<u8>) -> Self {
        Self {
            hub_url: hub_url.into(),
            verb: Verb::Post,
            path: path.into(),
            body,
            user: String::new(),
            password: String::new(),
        }
    }

    /// Attach credentials to the request
    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, user: U, password: P) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }
}

/// Reply metadata exposed by a transport
#[derive(Debug, Clone, Default)]
pub struct TransportMeta {
    /// HTTP status code, 0 if the reply carried no status line
    pub http_status: u16,
    /// Raw status line
    pub status_line: String,
}

/// One in-flight exchange with a hub
#[async_trait]
pub trait Transport: Send {
    /// Advance the exchange, waiting up to `wait` for readiness
    async fn process(&mut self, wait: Duration) -> Result<TransportStatus>;

    /// Whether the exchange reached end-of-stream
    fn eof(&self) -> bool;

    /// Take the reply bytes received since the previous call
    fn take_bytes(&mut self) -> Bytes;

    /// Reply metadata, meaningful once headers were received
    fn meta(&self) -> &TransportMeta;

    /// The error that terminated the exchange, if any
    fn error(&self) -> Option<Error>;

    /// Release the underlying connection
    async fn close(&mut self);
}

/// Opens transports for request specs
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new exchange
    async fn open(&self, spec: &RequestSpec) -> Result<Box<dyn Transport>>;
}
