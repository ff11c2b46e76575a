use std::io;

use http::StatusCode;

/// Boxed error returned by caller-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Terminal failure of a single proxied exchange.
///
/// Every error maps to an HTTP status via [`status`](ProxyError::status),
/// which the host can use to build an error response when the response head
/// has not been flushed yet, and optionally to an errno-style
/// [`code`](ProxyError::code) describing the transport-level cause. The
/// library itself never writes an error body to the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The `Via` chain already contains this proxy's name.
    #[error("proxy loop detected")]
    LoopDetected,
    /// An upgrade was requested with a method other than GET.
    #[error("upgrade requires the GET method")]
    UpgradeMethod,
    /// The `Upgrade` header is missing or names a protocol other than
    /// websocket.
    #[error("unsupported upgrade protocol")]
    UpgradeProtocol,
    /// The inbound request body stalled past the configured idle limit.
    #[error("request timeout")]
    RequestTimeout,
    /// The upstream stalled past the configured idle limit.
    #[error("gateway timeout")]
    GatewayTimeout,
    /// The upstream connection closed before the exchange completed.
    #[error("socket hang up")]
    UpstreamHangup { source: io::Error },
    /// Dialing the upstream failed.
    #[error("failed to connect to upstream {host}:{port}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },
    /// The upstream sent bytes that do not parse as an HTTP/1.x response.
    #[error("invalid upstream response: {reason}")]
    UpstreamProtocol { reason: String },
    /// A caller-supplied hook failed.
    #[error("request hook failed")]
    Hook { source: BoxError },
    /// Any other transport failure.
    #[error("proxy io error")]
    Io { source: io::Error },
}

impl ProxyError {
    /// The HTTP status a host should answer with when the response head is
    /// still unsent.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::LoopDetected => StatusCode::LOOP_DETECTED,
            Self::UpgradeMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::UpgradeProtocol => StatusCode::BAD_REQUEST,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamHangup { .. } | Self::UpstreamProtocol { .. } => StatusCode::BAD_GATEWAY,
            Self::Connect { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Hook { .. } | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errno-style code for transport-level causes, when one applies.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::UpstreamHangup { .. } => Some("ECONNRESET"),
            Self::Connect { source, .. } => match source.kind() {
                io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                io::ErrorKind::NotFound => Some("ENOTFOUND"),
                _ => None,
            },
            _ => None,
        }
    }

    /// Maps transport errors observed on the upstream connection.
    pub(crate) fn upstream_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::UpstreamHangup { source: err },
            io::ErrorKind::InvalidData => Self::UpstreamProtocol {
                reason: err.to_string(),
            },
            io::ErrorKind::TimedOut => Self::GatewayTimeout,
            _ => Self::Io { source: err },
        }
    }

    /// Whether an inbound-side transport error means the client went away.
    pub(crate) fn is_disconnect(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        )
    }
}
