//! Error types for htunnel.

use thiserror::Error;

/// Exit codes for the forwarder binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Listen failed
    ListenFailed = 10,
    /// Configuration error
    ConfigError = 11,
    /// TLS setup or handshake failed
    TlsFailed = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for htunnel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("target not specified")]
    TargetNotSpecified,

    #[error("UDP is not supported by HTTP outbound")]
    UdpNotSupported,

    #[error("0 target server")]
    EmptyServerList,

    #[error("failed to find an available destination")]
    NoAvailableDestination(#[source] Box<Error>),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("negotiated unsupported application layer protocol: {0}")]
    UnsupportedAlpn(String),

    #[error("Proxy responded with non 200 code: {0}")]
    ProxyStatus(String),

    #[error("invalid proxy response: {0}")]
    InvalidResponse(String),

    #[error("HTTP/2 connection failed: {0}")]
    Http2(String),

    #[error("connection ends")]
    ConnectionEnds(#[source] Box<Error>),

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::Tls(_) => ExitCode::TlsFailed,
            _ => ExitCode::ConfigError,
        }
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Self {
        Error::Http2(err.to_string())
    }
}

/// Result type alias for htunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_available_destination_keeps_cause() {
        let err = Error::NoAvailableDestination(Box::new(Error::ProxyStatus(
            "407 Proxy Authentication Required".to_string(),
        )));
        assert_eq!(err.to_string(), "failed to find an available destination");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("non 200 code"));
    }

    #[test]
    fn proxy_status_display_includes_status() {
        let err = Error::ProxyStatus("502 Bad Gateway".to_string());
        assert!(err.to_string().contains("non 200 code: 502"));
    }
}
