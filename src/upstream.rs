//! The origin-facing leg: dialing, request building, response reading.
//!
//! One connection per exchange. The request head is hand-encoded and the
//! response is parsed off the raw stream, which keeps the leg usable for
//! protocol upgrades and for hook-supplied transports alike.

use std::{io, time::Duration};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tracing::{debug, trace};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    error::ProxyError,
    forward::ProxyOptions,
    headers,
    parse::{RequestHead, ResponseHead},
    util::{RelayStream, Rewind},
};

pub(crate) use self::body::{BodyFraming, BodyReader};

pub(crate) mod body;

/// Boxed duplex stream carrying the upstream leg.
pub type UpstreamIo = Box<dyn RelayStream>;

/// Descriptor for the HTTP/1.1 request sent to the origin.
///
/// Handed to the [`PrepareUpstream`](crate::forward::PrepareUpstream) hook
/// before dialing; every public field may be rewritten there.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Host to dial. Also advertised as `Host` when the inbound request
    /// carried none (HTTP/2 inbound requests usually don't).
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Raw request target (path and query).
    pub target: String,
    /// End-to-end headers, already rewritten. Wire-framing headers are
    /// appended at encode time and never appear here.
    pub headers: HeaderMap,
    pub(crate) body: BodyFraming,
}

impl UpstreamRequest {
    /// Builds the descriptor from an inbound head and the proxy options.
    pub(crate) fn from_inbound(req: &RequestHead, opts: &ProxyOptions, upgrade: bool) -> Self {
        let mut headers = headers::upstream_headers(req);
        if let Some(name) = opts.proxy_name.as_deref() {
            headers::append_via(&mut headers, req.version, name);
        }
        let body = if upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
            BodyFraming::None
        } else if is_chunked(&req.headers) {
            // Re-framed below; a stray length would contradict the coding.
            headers.remove(header::CONTENT_LENGTH);
            BodyFraming::Chunked
        } else {
            content_length(&headers).map_or(BodyFraming::None, BodyFraming::Length)
        };
        let mut this = Self {
            method: req.method.clone(),
            host: opts.hostname.clone(),
            port: opts.port,
            target: req.target.clone(),
            headers,
            body,
        };
        if !this.headers.contains_key(header::HOST)
            && let Ok(value) = HeaderValue::from_str(&format!("{}:{}", this.host, this.port))
        {
            this.headers.insert(header::HOST, value);
        }
        this
    }

    /// Serializes the request head, including wire-framing headers.
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if self.body == BodyFraming::Chunked {
            buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.freeze()
    }
}

/// Dials the origin over TCP, bounded by the upstream idle limit.
pub(crate) async fn dial(
    request: &UpstreamRequest,
    idle: Option<Duration>,
) -> Result<UpstreamIo, ProxyError> {
    let connect = TcpStream::connect((request.host.as_str(), request.port));
    let stream = match idle {
        Some(limit) => time::timeout(limit, connect)
            .await
            .map_err(|_| ProxyError::GatewayTimeout)?,
        None => connect.await,
    }
    .map_err(|source| ProxyError::Connect {
        host: request.host.clone(),
        port: request.port,
        source,
    })?;
    debug!(host = %request.host, port = request.port, "connected to upstream");
    Ok(Box::new(stream))
}

/// Outcome of pumping the inbound body upstream.
pub(crate) enum SendOutcome {
    /// The body was fully delivered (or there was none).
    Sent,
    /// The client abandoned the request mid-body.
    ClientGone,
}

/// Pumps the inbound request body to the upstream connection, applying the
/// inbound idle limit to each read.
pub(crate) async fn send_body<B, W>(
    body: &mut B,
    wr: &mut W,
    framing: BodyFraming,
    idle: Option<Duration>,
) -> Result<SendOutcome, ProxyError>
where
    B: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    match framing {
        BodyFraming::None => Ok(SendOutcome::Sent),
        BodyFraming::Length(mut remaining) => {
            while remaining > 0 {
                buf.clear();
                let n = read_step(body, &mut buf, idle).await?;
                if n == 0 {
                    return Ok(SendOutcome::ClientGone);
                }
                let take = remaining.min(n as u64) as usize;
                wr.write_all(&buf[..take])
                    .await
                    .map_err(ProxyError::upstream_io)?;
                remaining -= take as u64;
            }
            trace!("request body sent");
            Ok(SendOutcome::Sent)
        }
        BodyFraming::Chunked => loop {
            buf.clear();
            let n = read_step(body, &mut buf, idle).await?;
            if n == 0 {
                body::finish_chunked(wr).await.map_err(ProxyError::upstream_io)?;
                trace!("request body sent");
                return Ok(SendOutcome::Sent);
            }
            body::write_chunk(wr, &buf).await.map_err(ProxyError::upstream_io)?;
        },
        BodyFraming::Unbounded => loop {
            buf.clear();
            let n = read_step(body, &mut buf, idle).await?;
            if n == 0 {
                return Ok(SendOutcome::Sent);
            }
            wr.write_all(&buf).await.map_err(ProxyError::upstream_io)?;
        },
    }
}

/// One inbound body read. Returns 0 when the client is done or gone.
async fn read_step<B: AsyncRead + Unpin>(
    body: &mut B,
    buf: &mut BytesMut,
    idle: Option<Duration>,
) -> Result<usize, ProxyError> {
    let read = body.read_buf(buf);
    let result = match idle {
        Some(limit) => time::timeout(limit, read)
            .await
            .map_err(|_| ProxyError::RequestTimeout)?,
        None => read.await,
    };
    match result {
        Ok(n) => Ok(n),
        Err(err) if ProxyError::is_disconnect(&err) => Ok(0),
        Err(err) => Err(ProxyError::Io { source: err }),
    }
}

/// Reads the next real response head, skipping informational responses.
///
/// `allow_upgrade` lets a `101` head surface to the caller; in plain web
/// mode an upgrade nobody asked for is a protocol error.
pub(crate) async fn read_response_head<R: AsyncRead + Unpin>(
    rd: &mut Rewind<R>,
    idle: Option<Duration>,
    allow_upgrade: bool,
) -> Result<ResponseHead, ProxyError> {
    loop {
        let head = read_head(rd, idle).await?;
        debug!(status = %head.status, "read upstream response head");
        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            if allow_upgrade {
                return Ok(head);
            }
            return Err(ProxyError::UpstreamProtocol {
                reason: "unexpected 101 response".to_string(),
            });
        }
        if head.status.is_informational() {
            continue;
        }
        return Ok(head);
    }
}

async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut Rewind<R>,
    idle: Option<Duration>,
) -> Result<ResponseHead, ProxyError> {
    loop {
        match ResponseHead::parse_with_len(rd.buffer()) {
            Err(err) => return Err(ProxyError::upstream_io(err)),
            Ok(Some((len, head))) => {
                rd.discard(len);
                return Ok(head);
            }
            Ok(None) => {}
        }
        if rd.is_full() {
            return Err(ProxyError::UpstreamProtocol {
                reason: format!(
                    "response header section exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
                ),
            });
        }
        let more = rd.buffer_more();
        let n = match idle {
            Some(limit) => time::timeout(limit, more)
                .await
                .map_err(|_| ProxyError::GatewayTimeout)?,
            None => more.await,
        }
        .map_err(ProxyError::upstream_io)?;
        if n == 0 {
            return Err(ProxyError::UpstreamHangup {
                source: io::ErrorKind::UnexpectedEof.into(),
            });
        }
    }
}

/// Determines how a response body is delimited (RFC 9112 §6.3).
pub(crate) fn response_framing(
    req_method: &Method,
    head: &ResponseHead,
) -> Result<BodyFraming, ProxyError> {
    if req_method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    match head.headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(BodyFraming::Length)
            .ok_or_else(|| ProxyError::UpstreamProtocol {
                reason: "invalid content-length".to_string(),
            }),
        None => Ok(BodyFraming::Unbounded),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
