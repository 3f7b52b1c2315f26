/*!
 * Error types for the HubLink core crate.
 *
 * Every fallible operation in the library funnels into this taxonomy. Each
 * variant carries a stable negative code so embedders that prefer error-code
 * style can map results one-to-one.
 */
use thiserror::Error;

/// Error type for HubLink operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The library context has not been initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// An argument was invalid or a reply was malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not supported by the device or firmware
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The device is not plugged in or cannot be found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device firmware is too old or too recent for this operation
    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    /// The device is busy with another task
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// The operation did not complete before its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An I/O failure on the transport
    #[error("I/O error: {0}")]
    Io(String),

    /// The stream or enumeration has no more data
    #[error("No more data: {0}")]
    NoMoreData(String),

    /// A device-side resource is exhausted (memory, handles)
    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    /// Concurrent access to the same resource was detected
    #[error("Concurrent access conflict: {0}")]
    DoubleAccess(String),

    /// Authentication failed or the hub is write-protected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The device real-time clock has not been set yet
    #[error("RTC not ready: {0}")]
    RtcNotReady(String),

    /// A file was not found on the device
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A TLS-level failure
    #[error("TLS error: {0}")]
    Ssl(String),

    /// The peer certificate is not signed by a trusted authority
    #[error("Untrusted TLS certificate: {0}")]
    SslUntrustedCa(String),

    /// The provided buffer is too small for the reply
    #[error("Buffer too small: {0}")]
    BufferTooSmall(String),

    /// Host name resolution failed
    #[error("DNS error: {0}")]
    Dns(String),
}

/// Result type for HubLink operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Get the stable negative code for this error
    pub fn code(&self) -> i32 {
        match self {
            Error::NotInitialized(_) => -1,
            Error::InvalidArgument(_) => -2,
            Error::NotSupported(_) => -3,
            Error::DeviceNotFound(_) => -4,
            Error::VersionMismatch(_) => -5,
            Error::DeviceBusy(_) => -6,
            Error::Timeout(_) => -7,
            Error::Io(_) => -8,
            Error::NoMoreData(_) => -9,
            Error::Exhausted(_) => -10,
            Error::DoubleAccess(_) => -11,
            Error::Unauthorized(_) => -12,
            Error::RtcNotReady(_) => -13,
            Error::FileNotFound(_) => -14,
            Error::Ssl(_) => -15,
            Error::SslUntrustedCa(_) => -16,
            Error::BufferTooSmall(_) => -17,
            Error::Dns(_) => -18,
        }
    }

    /// Create a new not-initialized error
    pub fn not_initialized<S: AsRef<str>>(msg: S) -> Self {
        Error::NotInitialized(msg.as_ref().to_string())
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new not-supported error
    pub fn not_supported<S: AsRef<str>>(msg: S) -> Self {
        Error::NotSupported(msg.as_ref().to_string())
    }

    /// Create a new device-not-found error
    pub fn device_not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::DeviceNotFound(msg.as_ref().to_string())
    }

    /// Create a new version-mismatch error
    pub fn version_mismatch<S: AsRef<str>>(msg: S) -> Self {
        Error::VersionMismatch(msg.as_ref().to_string())
    }

    /// Create a new device-busy error
    pub fn device_busy<S: AsRef<str>>(msg: S) -> Self {
        Error::DeviceBusy(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new I/O error
    pub fn io<S: AsRef<str>>(msg: S) -> Self {
        Error::Io(msg.as_ref().to_string())
    }

    /// Create a new no-more-data error
    pub fn no_more_data<S: AsRef<str>>(msg: S) -> Self {
        Error::NoMoreData(msg.as_ref().to_string())
    }

    /// Create a new double-access error
    pub fn double_access<S: AsRef<str>>(msg: S) -> Self {
        Error::DoubleAccess(msg.as_ref().to_string())
    }

    /// Create a new unauthorized error
    pub fn unauthorized<S: AsRef<str>>(msg: S) -> Self {
        Error::Unauthorized(msg.as_ref().to_string())
    }

    /// Create a new file-not-found error
    pub fn file_not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::FileNotFound(msg.as_ref().to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(Error::not_initialized("x").code(), -1);
        assert_eq!(Error::invalid_argument("x").code(), -2);
        assert_eq!(Error::timeout("x").code(), -7);
        assert_eq!(Error::io("x").code(), -8);
        assert_eq!(Error::unauthorized("x").code(), -12);
        assert_eq!(Error::Dns("x".to_string()).code(), -18);
    }

    #[test]
    fn test_display_includes_message() {
        let e = Error::device_not_found("THRMSTR1-32DD7");
        assert!(e.to_string().contains("THRMSTR1-32DD7"));
    }
}
