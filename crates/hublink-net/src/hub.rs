/*!
 * Hub state.
 *
 * A [`Hub`] holds everything the runtime tracks per registered hub: its
 * normalized URL and credentials, the notification stream position and
 * health, the reconnect backoff, the device index table used to resolve
 * tiny-notification indexes, and the next enumeration deadline.
 */
use std::time::{Duration, Instant};

use hublink_core::error::{Error, Result};

/// Initial (and post-success) notification reconnect delay
pub const NOTIFY_RETRY_MIN: Duration = Duration::from_millis(15);
/// Upper bound of the notification reconnect backoff
pub const NOTIFY_RETRY_MAX: Duration = Duration::from_millis(15_000);
/// Enumeration fallback period while notifications are unhealthy
pub const UNHEALTHY_LIST_VALIDITY: Duration = Duration::from_millis(500);

/// Default hub port when the registered URL does not name one
const DEFAULT_PORT: u16 = 4444;

/// State of one registered hub
#[derive(Debug)]
pub struct Hub {
    /// Normalized root URL, scheme + host + port + trailing slash
    pub url: String,
    /// Authentication user, empty for anonymous access
    pub user: String,
    /// Authentication password
    pub password: String,
    /// Disabled hubs are skipped by every sync pass
    pub enabled: bool,
    /// Preregistered hubs stay registered while unreachable
    pub mandatory: bool,
    /// Whether the hub rejects unauthenticated writes
    pub write_protected: bool,
    /// Serial number of the hub device, once learned
    pub serial: Option<String>,
    /// Request id of the active notification stream, if any
    pub notif_request: Option<u64>,
    /// Absolute notification stream position, -1 when unknown
    pub notif_pos: i64,
    /// Bytes of a partial notification line awaiting its newline
    pub notif_carry: Vec<u8>,
    /// Whether tiny notifications are being decoded successfully
    pub notif_healthy: bool,
    /// Current reconnect backoff delay
    pub retry_delay: Duration,
    /// Earliest instant at which a reconnect may be attempted
    pub retry_at: Instant,
    /// Device serial by tiny-notification device index
    pub serial_by_ydx: Vec<Option<String>>,
    /// When the current enumeration stops being trusted
    pub dev_list_expires: Instant,
    /// Last error observed while talking to this hub
    pub last_error: Option<Error>,
}

impl Hub {
    /// Create a hub from a user-supplied URL
    pub fn new<U: AsRef<str>>(url: U, user: &str, password: &str, mandatory: bool) -> Result<Self> {
        let now = Instant::now();
        Ok(Self {
            url: normalize_url(url.as_ref())?,
            user: user.to_string(),
            password: password.to_string(),
            enabled: true,
            mandatory,
            write_protected: false,
            serial: None,
            notif_request: None,
            notif_pos: -1,
            notif_carry: Vec::new(),
            notif_healthy: false,
            retry_delay: NOTIFY_RETRY_MIN,
            retry_at: now,
            serial_by_ydx: Vec::new(),
            dev_list_expires: now,
            last_error: None,
        })
    }

    /// Path of the notification stream request, resuming at the current
    /// position when one is known
    pub fn notify_path(&self) -> String {
        if self.notif_pos >= 0 {
            format!("/not.byn?len=0&abs={}", self.notif_pos)
        } else {
            "/not.byn?len=0".to_string()
        }
    }

    /// Record a notification stream failure and back off
    pub fn notify_failed(&mut self, now: Instant) {
        self.notif_request = None;
        self.notif_healthy = false;
        self.retry_at = now + self.retry_delay;
        self.retry_delay = (self.retry_delay * 2).min(NOTIFY_RETRY_MAX);
    }

    /// Record a successfully decoded tiny notification
    pub fn notify_healthy(&mut self) {
        self.notif_healthy = true;
        self.retry_delay = NOTIFY_RETRY_MIN;
    }

    /// React to a protocol desync: drop the resume position and force the
    /// next sync pass to run immediately
    pub fn mark_desync(&mut self, now: Instant) {
        self.notif_healthy = false;
        self.notif_pos = -1;
        self.dev_list_expires = now;
    }

    /// Force the next sync pass to run immediately
    pub fn invalidate_device_list(&mut self, now: Instant) {
        self.dev_list_expires = now;
    }

    /// Record which serial a tiny-notification device index refers to
    pub fn set_serial_for_ydx(&mut self, ydx: usize, serial: &str) {
        if self.serial_by_ydx.len() <= ydx {
            self.serial_by_ydx.resize(ydx + 1, None);
        }
        self.serial_by_ydx[ydx] = Some(serial.to_string());
    }

    /// Resolve a tiny-notification device index to a serial
    pub fn serial_for_ydx(&self, ydx: usize) -> Option<&str> {
        self.serial_by_ydx.get(ydx)?.as_deref()
    }

    /// Whether the given device root URL belongs to this hub
    pub fn owns_url(&self, root_url: &str) -> bool {
        root_url.starts_with(&self.url)
    }
}

/// Normalize a hub URL: default scheme and port, trailing slash
pub fn normalize_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::invalid_argument("Empty hub URL"));
    }
    let (scheme, rest) = match url.split_once("://") {
        Some((s, rest)) => {
            if s != "http" && s != "ws" && s != "https" && s != "wss" {
                return Err(Error::invalid_argument(format!(
                    "Unsupported URL scheme: {}",
                    s
                )));
            }
            (s, rest)
        }
        None => ("http", url),
    };
    let rest = rest.trim_end_matches('/');
    let (host_port, path) = match rest.split_once('/') {
        Some((hp, path)) => (hp, format!("/{}", path)),
        None => (rest, String::new()),
    };
    if host_port.is_empty() {
        return Err(Error::invalid_argument(format!("No host in URL: {}", url)));
    }
    let host_port = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{}:{}", host_port, DEFAULT_PORT)
    };
    Ok(format!("{}://{}{}/", scheme, host_port, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("192.168.1.20").unwrap(),
            "http://192.168.1.20:4444/"
        );
        assert_eq!(
            normalize_url("http://192.168.1.20:80").unwrap(),
            "http://192.168.1.20:80/"
        );
        assert_eq!(
            normalize_url("http://hub.local:4444/").unwrap(),
            "http://hub.local:4444/"
        );
        assert!(normalize_url("").is_err());
        assert!(normalize_url("ftp://hub").is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut hub = Hub::new("10.0.0.1", "", "", false).unwrap();
        let now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..12 {
            hub.notify_failed(now);
            assert!(hub.retry_delay >= last);
            last = hub.retry_delay;
        }
        assert_eq!(hub.retry_delay, NOTIFY_RETRY_MAX);
        hub.notify_healthy();
        assert_eq!(hub.retry_delay, NOTIFY_RETRY_MIN);
    }

    #[test]
    fn test_notify_path_resume() {
        let mut hub = Hub::new("10.0.0.1", "", "", false).unwrap();
        assert_eq!(hub.notify_path(), "/not.byn?len=0");
        hub.notif_pos = 4200;
        assert_eq!(hub.notify_path(), "/not.byn?len=0&abs=4200");
    }

    #[test]
    fn test_serial_index_table() {
        let mut hub = Hub::new("10.0.0.1", "", "", false).unwrap();
        hub.set_serial_for_ydx(2, "THRMSTR1-32DD7");
        assert_eq!(hub.serial_for_ydx(2), Some("THRMSTR1-32DD7"));
        assert_eq!(hub.serial_for_ydx(0), None);
        assert_eq!(hub.serial_for_ydx(9), None);
    }

    #[test]
    fn test_desync_resets_position() {
        let mut hub = Hub::new("10.0.0.1", "", "", false).unwrap();
        hub.notif_pos = 999;
        hub.notif_healthy = true;
        hub.mark_desync(Instant::now());
        assert_eq!(hub.notif_pos, -1);
        assert!(!hub.notif_healthy);
        assert_eq!(hub.notify_path(), "/not.byn?len=0");
    }
}
