use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// Connection-level metadata for an inbound request.
///
/// `local` and `remote` are the addresses of the transport the request
/// arrived on; either may be unknown (e.g. Unix sockets). `tls` reports
/// whether the host terminated TLS on the client connection.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Address the host accepted the connection on.
    pub local: Option<IpAddr>,
    /// Address of the connecting client.
    pub remote: Option<IpAddr>,
    /// Whether the client connection was TLS.
    pub tls: bool,
}

/// The head of an inbound request, as supplied by the host server.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target (path and query, exactly as received).
    pub target: String,
    pub version: Version,
    /// End-to-end and hop-by-hop headers as received. Pseudo-headers never
    /// appear here; an `http::HeaderMap` cannot hold `:`-prefixed names.
    pub headers: HeaderMap,
    /// HTTP/2 `:authority` pseudo-header, when the host accepted HTTP/2.
    pub authority: Option<String>,
    pub peer: PeerInfo,
}

impl RequestHead {
    /// The authority to advertise upstream: `:authority` or the `Host` header.
    pub(crate) fn host(&self) -> Option<&str> {
        self.authority.as_deref().or_else(|| {
            self.headers
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
        })
    }
}

/// An inbound request paired with its body stream.
///
/// The body yields the request payload with transfer framing already
/// removed; the host's HTTP layer owns client-side framing.
#[derive(Debug)]
pub struct InboundRequest<B> {
    pub head: RequestHead,
    pub body: B,
}

impl<B> InboundRequest<B> {
    pub fn new(head: RequestHead, body: B) -> Self {
        Self { head, body }
    }
}

impl InboundRequest<tokio::io::Empty> {
    /// A request with no body (e.g. GET).
    pub fn without_body(head: RequestHead) -> Self {
        Self::new(head, tokio::io::empty())
    }
}

/// Parsed HTTP response head: status, reason, and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Parses a response head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the head. Header pairs
    /// with invalid names or values are skipped.
    pub fn parse_with_len(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        let header_len = match res
            .parse(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(header_len) => header_len,
        };
        let code = res.code.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "missing response status code")
        })?;
        let status = StatusCode::from_u16(code)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let reason = res.reason.map(ToOwned::to_owned);
        let mut map = HeaderMap::with_capacity(res.headers.len());
        for header in res.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(header.value),
            ) {
                map.append(name, value);
            }
        }
        Ok(Some((
            header_len,
            Self {
                status,
                reason,
                headers: map,
            },
        )))
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Serializes the head, one line per header value.
    ///
    /// `end_header_section` terminates the head with an empty line.
    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
        end_header_section: bool,
    ) -> io::Result<()> {
        writer.write_all(self.status_line().as_bytes()).await?;
        for (name, value) in self.headers.iter() {
            writer.write_all(name.as_str().as_bytes()).await?;
            writer.write_all(b": ").await?;
            writer.write_all(value.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        if end_header_section {
            writer.write_all(b"\r\n").await?;
        }
        Ok(())
    }
}
