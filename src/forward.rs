//! The forwarding engine: per-call lifecycle coordination for proxied
//! exchanges.
//!
//! One call forwards one inbound request. All concurrent activity of a call
//! (request-body pump, response reading, byte relay) is driven from the
//! call's own future, so cancellation, cleanup, and the exactly-once
//! completion all collapse into a single exit path: returning from the
//! entry point drops the pumps and the upstream connection, which aborts
//! everything still in flight.

use std::{pin::pin, time::Duration};

use bytes::Bytes;
use http::{Method, StatusCode, header};
use tokio::io::{self, AsyncRead, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    error::ProxyError,
    headers,
    parse::{InboundRequest, RequestHead, ResponseHead},
    upstream::{self, BodyReader, SendOutcome, UpstreamIo, UpstreamRequest},
    util::{RelayStream, Rewind, relay_bidi},
};

mod opts;

pub use opts::{InspectResponse, PrepareUpstream, ProxyOptions};

/// Sink for the proxied response in [`web`] mode.
///
/// The host implements this over its own response writer. `write_head` is
/// called at most once, before any `write_body`; `end` is called exactly
/// once on the success path and never after an error — the host decides how
/// to finish an errored response.
pub trait ResponseSink: Send {
    /// Whether status and headers have already been written.
    fn headers_sent(&self) -> bool;

    /// Writes status and headers.
    fn write_head<'a>(
        &'a mut self,
        head: &'a ResponseHead,
    ) -> impl Future<Output = io::Result<()>> + Send + 'a;

    /// Writes a chunk of the response body.
    fn write_body<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a;

    /// Finishes the response body.
    fn end<'a>(&'a mut self) -> impl Future<Output = io::Result<()>> + Send + 'a;
}

/// Forwards a request/response exchange to the configured upstream.
///
/// Completes exactly once: `Ok(())` when the exchange finished — including
/// the client abandoning it — and `Err` when it failed. On error the
/// response head may or may not have been flushed already; hosts should
/// check [`ResponseSink::headers_sent`] before formatting an error
/// response from [`ProxyError::status`].
pub async fn web<B, S>(
    req: InboundRequest<B>,
    res: &mut S,
    opts: &ProxyOptions,
) -> Result<(), ProxyError>
where
    B: AsyncRead + Send + Unpin,
    S: ResponseSink,
{
    let InboundRequest { head: req, mut body } = req;
    check_loop(&req, opts)?;

    let mut request = UpstreamRequest::from_inbound(&req, opts, false);
    let stream = connect(&req, &mut request, opts).await?;
    let framing = request.body;
    let head_bytes = request.encode();
    debug!(method = %request.method, target = %request.target, host = %request.host, "forwarding request");

    let (rd, mut wr) = io::split(stream);
    let mut rd = Rewind::new(rd, HEADER_SECTION_MAX_LENGTH);
    wr.write_all(&head_bytes)
        .await
        .map_err(ProxyError::upstream_io)?;

    let mut upload_done = false;
    let mut upload = pin!(upstream::send_body(
        &mut body,
        &mut wr,
        framing,
        opts.timeout
    ));

    // Response head, while the request body keeps flowing.
    let mut response = {
        let mut read_head = pin!(upstream::read_response_head(
            &mut rd,
            opts.proxy_timeout,
            false
        ));
        loop {
            tokio::select! {
                biased;
                head = read_head.as_mut() => break head?,
                sent = upload.as_mut(), if !upload_done => match sent? {
                    SendOutcome::Sent => upload_done = true,
                    SendOutcome::ClientGone => {
                        debug!("client went away before the upstream responded");
                        return Ok(());
                    }
                },
            }
        }
    };

    let framing = upstream::response_framing(&req.method, &response)?;
    headers::strip_hop_by_hop(&mut response.headers);
    opts.run_inspect(&req, &mut response).await?;
    if !res.headers_sent() && !sink_ok(res.write_head(&response).await)? {
        return Ok(());
    }

    let mut reader = BodyReader::new(rd, framing);
    loop {
        let chunk = {
            let mut next = pin!(next_body_chunk(&mut reader, opts.proxy_timeout));
            loop {
                tokio::select! {
                    biased;
                    chunk = next.as_mut() => break chunk?,
                    sent = upload.as_mut(), if !upload_done => match sent? {
                        SendOutcome::Sent => upload_done = true,
                        SendOutcome::ClientGone => {
                            debug!("client went away mid-response");
                            return Ok(());
                        }
                    },
                }
            }
        };
        match chunk {
            Some(chunk) => {
                trace!(len = chunk.len(), "forwarding response chunk");
                if !sink_ok(res.write_body(&chunk).await)? {
                    return Ok(());
                }
            }
            None => break,
        }
    }
    if !sink_ok(res.end().await)? {
        return Ok(());
    }
    debug!("response forwarded");
    Ok(())
}

/// Forwards a protocol-upgrade exchange, then relays bytes transparently
/// once the upstream accepts the upgrade.
///
/// `head` holds any bytes the host already read past the request preamble;
/// they are pushed back in front of the socket so the relay sees them
/// first. On every error path the client socket is shut down before the
/// error is returned — after a failed or half-done upgrade there is nothing
/// sensible left to write to it.
pub async fn ws<S>(
    req: RequestHead,
    socket: S,
    head: Bytes,
    opts: &ProxyOptions,
) -> Result<(), ProxyError>
where
    S: RelayStream,
{
    if let Err(err) = socket.tune() {
        trace!(%err, "client socket tuning failed");
    }
    let mut client = Rewind::with_buffer(socket, head, HEADER_SECTION_MAX_LENGTH);
    match ws_inner(&req, &mut client, opts).await {
        Ok(()) => Ok(()),
        Err(err) => {
            client.shutdown().await.ok();
            Err(err)
        }
    }
}

async fn ws_inner<S: RelayStream>(
    req: &RequestHead,
    client: &mut Rewind<S>,
    opts: &ProxyOptions,
) -> Result<(), ProxyError> {
    if req.method != Method::GET {
        return Err(ProxyError::UpgradeMethod);
    }
    let upgrade = req
        .headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());
    if upgrade.as_deref() != Some("websocket") {
        return Err(ProxyError::UpgradeProtocol);
    }
    check_loop(req, opts)?;

    let mut request = UpstreamRequest::from_inbound(req, opts, true);
    let io = connect(req, &mut request, opts).await?;
    let mut upstream_io = Rewind::new(io, HEADER_SECTION_MAX_LENGTH);
    upstream_io
        .write_all(&request.encode())
        .await
        .map_err(ProxyError::upstream_io)?;
    debug!(target = %request.target, host = %request.host, "requested upgrade from upstream");

    let mut response =
        upstream::read_response_head(&mut upstream_io, opts.proxy_timeout, true).await?;

    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream answered with a plain response. There is no response
        // writer in upgrade mode, so surface the head to the hook and end
        // the client socket.
        debug!(status = %response.status, "upstream declined the upgrade");
        headers::strip_hop_by_hop(&mut response.headers);
        opts.run_inspect(req, &mut response).await?;
        client.shutdown().await.ok();
        return Ok(());
    }

    if let Err(err) = upstream_io.get_ref().tune() {
        trace!(%err, "upstream socket tuning failed");
    }
    // Relay the 101 head verbatim; bytes the upstream sent past it are
    // still buffered and will be relayed first.
    if !sink_ok(response.write(client, true).await)? {
        return Ok(());
    }

    match relay_bidi(client, &mut upstream_io).await {
        Ok((to_upstream, to_client)) => {
            debug!(to_upstream, to_client, "upgrade relay finished");
            Ok(())
        }
        Err(err) if ProxyError::is_disconnect(&err) => Ok(()),
        Err(err) => Err(ProxyError::Io { source: err }),
    }
}

/// Refuses requests whose `Via` chain already names this proxy.
fn check_loop(req: &RequestHead, opts: &ProxyOptions) -> Result<(), ProxyError> {
    if let Some(name) = opts.proxy_name.as_deref()
        && headers::via_contains(&req.headers, name)
    {
        warn!(%name, "refusing forwarding loop");
        return Err(ProxyError::LoopDetected);
    }
    Ok(())
}

/// Resolves the upstream connection: the hook's, or a fresh TCP dial.
async fn connect(
    req: &RequestHead,
    request: &mut UpstreamRequest,
    opts: &ProxyOptions,
) -> Result<UpstreamIo, ProxyError> {
    if let Some(io) = opts.run_prepare(req, request).await? {
        debug!("using hook-supplied upstream connection");
        return Ok(io);
    }
    upstream::dial(request, opts.proxy_timeout).await
}

async fn next_body_chunk<R: AsyncRead + Unpin>(
    reader: &mut BodyReader<R>,
    idle: Option<Duration>,
) -> Result<Option<Bytes>, ProxyError> {
    let next = reader.next_chunk();
    let result = match idle {
        Some(limit) => tokio::time::timeout(limit, next)
            .await
            .map_err(|_| ProxyError::GatewayTimeout)?,
        None => next.await,
    };
    result.map_err(ProxyError::upstream_io)
}

/// Folds a client-side write result: `false` means the client went away and
/// the call should finish cleanly.
fn sink_ok(result: io::Result<()>) -> Result<bool, ProxyError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if ProxyError::is_disconnect(&err) => {
            debug!("client went away mid-response");
            Ok(false)
        }
        Err(err) => Err(ProxyError::Io { source: err }),
    }
}
