use std::{sync::Arc, time::Duration};

use dynosaur::dynosaur;

use crate::{
    error::{BoxError, ProxyError},
    parse::{RequestHead, ResponseHead},
    upstream::{UpstreamIo, UpstreamRequest},
};

/// Per-call options for a proxied exchange.
///
/// Immutable for the duration of one [`web`](super::web) or
/// [`ws`](super::ws) call; clone freely across calls.
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOptions {
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) timeout: Option<Duration>,
    pub(crate) proxy_timeout: Option<Duration>,
    pub(crate) proxy_name: Option<String>,
    #[debug("{:?}", prepare.as_ref().map(|_| "DynPrepareUpstream"))]
    prepare: Option<Arc<DynPrepareUpstream<'static>>>,
    #[debug("{:?}", inspect.as_ref().map(|_| "DynInspectResponse"))]
    inspect: Option<Arc<DynInspectResponse<'static>>>,
}

impl ProxyOptions {
    /// Options targeting the given upstream origin.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            timeout: None,
            proxy_timeout: None,
            proxy_name: None,
            prepare: None,
            inspect: None,
        }
    }

    /// Idle limit applied to inbound request-body reads.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Idle limit applied to dialing and reading the upstream.
    pub fn proxy_timeout(mut self, limit: Duration) -> Self {
        self.proxy_timeout = Some(limit);
        self
    }

    /// Identity recorded in `Via` and checked for forwarding loops.
    pub fn proxy_name(mut self, name: impl Into<String>) -> Self {
        self.proxy_name = Some(name.into());
        self
    }

    /// Installs a hook that may rewrite the upstream request or supply its
    /// own connection to send it over.
    pub fn prepare_upstream(mut self, hook: impl PrepareUpstream + 'static) -> Self {
        self.prepare = Some(DynPrepareUpstream::new_arc(hook));
        self
    }

    /// Installs a hook that observes or rewrites the response head before
    /// it is flushed downstream.
    pub fn inspect_response(mut self, hook: impl InspectResponse + 'static) -> Self {
        self.inspect = Some(DynInspectResponse::new_arc(hook));
        self
    }

    pub(crate) async fn run_prepare(
        &self,
        req: &RequestHead,
        upstream: &mut UpstreamRequest,
    ) -> Result<Option<UpstreamIo>, ProxyError> {
        match &self.prepare {
            None => Ok(None),
            Some(hook) => hook
                .prepare(req, upstream)
                .await
                .map_err(|source| ProxyError::Hook { source }),
        }
    }

    pub(crate) async fn run_inspect(
        &self,
        req: &RequestHead,
        res: &mut ResponseHead,
    ) -> Result<(), ProxyError> {
        match &self.inspect {
            None => Ok(()),
            Some(hook) => hook
                .inspect(req, res)
                .await
                .map_err(|source| ProxyError::Hook { source }),
        }
    }
}

#[dynosaur(DynPrepareUpstream = dyn(box) PrepareUpstream)]
/// Rewrites the upstream request before it is sent, optionally supplying
/// the connection to send it over.
pub trait PrepareUpstream: Send + Sync {
    /// Returning `Ok(Some(io))` replaces the default TCP dial; the request
    /// head is then written over the supplied stream.
    fn prepare<'a>(
        &'a self,
        req: &'a RequestHead,
        upstream: &'a mut UpstreamRequest,
    ) -> impl Future<Output = Result<Option<UpstreamIo>, BoxError>> + Send + 'a;
}

#[dynosaur(DynInspectResponse = dyn(box) InspectResponse)]
/// Observes or rewrites the response head before it is flushed downstream.
pub trait InspectResponse: Send + Sync {
    fn inspect<'a>(
        &'a self,
        req: &'a RequestHead,
        res: &'a mut ResponseHead,
    ) -> impl Future<Output = Result<(), BoxError>> + Send + 'a;
}
