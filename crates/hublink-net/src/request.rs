/*!
 * Pending-request scheduler.
 *
 * All hub I/O funnels through a single list of pending requests advanced
 * cooperatively, one bounded step at a time. Each step opens transports for
 * requests that lack one, gives every open transport a slice of the wait
 * budget, routes notification-stream bytes to the caller and retires
 * requests that reached end-of-stream or their deadline.
 */
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use hublink_core::error::{Error, Result};

use crate::transport::{RequestSpec, Transport, TransportFactory, TransportMeta, TransportStatus};

/// Default deadline for a synchronous device request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Deadline for log, file and message endpoints
pub const LOG_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for firmware upload and flash endpoints
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline class for a device request path
pub fn request_timeout(path: &str) -> Duration {
    let path = path.split('?').next().unwrap_or(path);
    if path.ends_with("upload.html") || path.ends_with("flash.json") {
        FLASH_TIMEOUT
    } else if path.ends_with("logs.txt")
        || path.ends_with("rxmsg.json")
        || path.ends_with("files.json")
        || path.ends_with("dataLogger.json")
    {
        LOG_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

/// Map a finished reply to success or an error
///
/// HTTP 200 and 304 succeed; replies without a status line succeed when they
/// open with one of the device OK markers; 401 maps to an authorization
/// error, anything else to an I/O error.
pub fn reply_status(meta: &TransportMeta, reply: &[u8]) -> Result<()> {
    match meta.http_status {
        200 | 304 => Ok(()),
        401 => Err(Error::unauthorized("Authentication required")),
        0 => {
            if reply.starts_with(b"OK") || reply.starts_with(b"0K") {
                Ok(())
            } else {
                Err(Error::io("Reply carried no status"))
            }
        }
        status => Err(Error::io(format!("HTTP error {}", status))),
    }
}

/// One queued exchange with a hub
pub struct PendingRequest {
    /// Scheduler-assigned request id
    pub id: u64,
    /// The request to perform
    pub spec: RequestSpec,
    /// Fire-and-forget requests retire as soon as they complete
    pub is_async: bool,
    /// Notification streams route bytes out instead of accumulating them
    pub is_notification: bool,
    /// Accumulated reply body
    pub reply: BytesMut,
    /// Reply metadata captured from the transport
    pub meta: TransportMeta,
    /// Whether the exchange is over, successfully or not
    pub completed: bool,
    /// The error that ended the exchange, if any
    pub error: Option<Error>,
    /// Absolute deadline, none for notification streams
    pub deadline: Option<Instant>,
    transport: Option<Box<dyn Transport>>,
}

/// Byte-level outcome of one scheduler step
#[derive(Debug)]
pub enum IoEvent {
    /// Bytes arrived on a hub's notification stream
    Notification {
        /// Root URL of the hub owning the stream
        hub_url: String,
        /// Raw stream bytes, possibly a partial line
        bytes: Bytes,
    },
    /// A request completed (check its error before using the reply)
    Completed {
        /// Id of the completed request
        id: u64,
    },
}

/// Cooperative scheduler for every pending hub request
pub struct RequestScheduler {
    factory: Arc<dyn TransportFactory>,
    requests: Vec<PendingRequest>,
    next_id: u64,
}

impl RequestScheduler {
    /// Create a scheduler opening transports through `factory`
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            requests: Vec::new(),
            next_id: 1,
        }
    }

    /// Queue a request; the transport opens on the next step
    pub fn issue(
        &mut self,
        spec: RequestSpec,
        is_async: bool,
        is_notification: bool,
        timeout: Option<Duration>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.requests.push(PendingRequest {
            id,
            spec,
            is_async,
            is_notification,
            reply: BytesMut::new(),
            meta: TransportMeta::default(),
            completed: false,
            error: None,
            deadline: timeout.map(|t| Instant::now() + t),
            transport: None,
        });
        id
    }

    /// Whether a request is still tracked
    pub fn contains(&self, id: u64) -> bool {
        self.requests.iter().any(|r| r.id == id)
    }

    /// Whether a request has completed
    pub fn is_completed(&self, id: u64) -> bool {
        self.requests
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.completed)
            .unwrap_or(true)
    }

    /// Remove and return a completed request
    pub fn take_finished(&mut self, id: u64) -> Option<PendingRequest> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.id == id && r.completed)?;
        Some(self.requests.remove(pos))
    }

    /// Abort one request with an error
    pub async fn abort(&mut self, id: u64, err: Error) {
        for req in &mut self.requests {
            if req.id == id && !req.completed {
                if let Some(transport) = req.transport.as_mut() {
                    transport.close().await;
                }
                req.error = Some(err);
                req.completed = true;
                return;
            }
        }
    }

    /// Abort every in-flight request against a hub
    pub async fn abort_hub(&mut self, hub_url: &str, err: Error) {
        for req in &mut self.requests {
            if req.spec.hub_url == hub_url && !req.completed {
                if let Some(transport) = req.transport.as_mut() {
                    transport.close().await;
                }
                req.error = Some(err.clone());
                req.completed = true;
            }
        }
    }

    /// Number of pending (not yet completed) requests
    pub fn pending_count(&self) -> usize {
        self.requests.iter().filter(|r| !r.completed).count()
    }

    /// Run one cooperative scheduler step
    ///
    /// The wait budget goes to the first incomplete request; the rest are
    /// polled without blocking, which bounds the step to roughly `wait`.
    pub async fn poll_once(&mut self, wait: Duration) -> Vec<IoEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut budget = wait;

        for req in &mut self.requests {
            if req.completed {
                continue;
            }
            if req.transport.is_none() {
                match self.factory.open(&req.spec).await {
                    Ok(transport) => req.transport = Some(transport),
                    Err(err) => {
                        debug!(url = %req.spec.hub_url, path = %req.spec.path, %err,
                            "Failed to open transport");
                        req.error = Some(err);
                        req.completed = true;
                        events.push(IoEvent::Completed { id: req.id });
                        continue;
                    }
                }
            }
            let transport = req.transport.as_mut().expect("transport just opened");
            let status = match transport.process(budget).await {
                Ok(status) => status,
                Err(err) => {
                    req.error = Some(err);
                    req.completed = true;
                    events.push(IoEvent::Completed { id: req.id });
                    continue;
                }
            };
            budget = Duration::ZERO;

            let bytes = transport.take_bytes();
            if !bytes.is_empty() {
                if req.is_notification {
                    events.push(IoEvent::Notification {
                        hub_url: req.spec.hub_url.clone(),
                        bytes,
                    });
                } else {
                    req.reply.extend_from_slice(&bytes);
                }
            }
            if status == TransportStatus::Eof || transport.eof() {
                req.meta = transport.meta().clone();
                req.error = transport.error();
                req.completed = true;
                events.push(IoEvent::Completed { id: req.id });
                continue;
            }
            if let Some(deadline) = req.deadline {
                if now >= deadline {
                    warn!(url = %req.spec.hub_url, path = %req.spec.path,
                        "Request deadline exceeded");
                    transport.close().await;
                    req.error = Some(Error::timeout(format!(
                        "{}{} did not complete in time",
                        req.spec.hub_url, req.spec.path
                    )));
                    req.completed = true;
                    events.push(IoEvent::Completed { id: req.id });
                }
            }
        }

        // Fire-and-forget and notification requests retire on completion
        self.requests
            .retain(|r| !(r.completed && (r.is_async || r.is_notification)));
        events
    }
}
