//! Utilities for embedding an HTTP/1.1 reverse proxy into a host server.
//!
//! The host owns listening sockets, routing, TLS termination, and request
//! logging; this crate owns the forwarding engine. It takes one inbound
//! request at a time, forwards it to a single upstream origin, streams the
//! response back (or relays an upgraded connection byte-for-byte), rewrites
//! connection-scoped headers, and releases every resource on every exit
//! path.
//!
//! Two entry points, one per flow mode:
//!
//! - [`web`] forwards a request/response exchange into a host-implemented
//!   [`ResponseSink`].
//! - [`ws`] forwards a protocol upgrade (e.g. WebSocket) and then relays
//!   the hijacked client socket against the upstream socket.
//!
//! ```ignore
//! let opts = ProxyOptions::new("127.0.0.1", 3000)
//!     .proxy_name("edge")
//!     .proxy_timeout(Duration::from_secs(30));
//! web(request, &mut sink, &opts).await?;
//! ```

mod error;
pub mod forward;
mod headers;
mod parse;
pub mod upstream;
mod util;

pub use error::{BoxError, ProxyError};
pub use forward::{InspectResponse, PrepareUpstream, ProxyOptions, ResponseSink, web, ws};
pub use parse::{InboundRequest, PeerInfo, RequestHead, ResponseHead};
pub use util::RelayStream;

/// How much data to buffer for a response header section before it's
/// considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
