//! Upstream pool session.
//!
//! An [`UpstreamSession`] owns one connection to a pool. It first drives the
//! setup handshake ([`init`](UpstreamSession::init)), then becomes the shared
//! upstream for any number of downstream sessions
//! ([`run`](UpstreamSession::run)).
//!
//! # Handshake
//!
//! All four setup requests are written back to back, then responses are
//! consumed in whatever order the pool sends them, with notifications and
//! Ex-Messages mixed in. Responses are routed by their string id. The
//! session is Authorized once every setup response has been consumed and
//! both subscribe and authorize succeeded; any fatal error closes it.
//!
//! # Event loop
//!
//! After the handshake the session is owned by a single task that applies
//! [`UpstreamEvent`]s one at a time. Other tasks hold an [`UpstreamHandle`]
//! and can only enqueue events, so the downstream-session map has exactly
//! one writer.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::capabilities::{NegotiatedParams, ServerCapabilities};
use super::connection::{Connection, Transport};
use super::downstream::DownstreamSession;
use super::error::{UpstreamError, UpstreamResult};
use super::frame::{self, InboundUnit};
use super::messages::{
    AUTHORIZE_ID, CAPABILITIES_ID, CONFIGURE_ID, JsonRpcMessage, SUBSCRIBE_ID, authorize_request,
    capabilities_request, configure_request, subscribe_request,
};
use crate::config::{AgentConfig, PoolAddress};
use crate::tracing::prelude::*;

/// Smallest extranonce2 the proxy can split between downstream sessions.
pub const MIN_EXTRANONCE2_SIZE: usize = 6;

/// Connection status.
///
/// Ordered: progress only moves forward, except that any state may drop to
/// [`Status::Disconnected`], which is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Authorized,
}

/// Requests to mutate upstream state, applied by the event loop.
pub enum UpstreamEvent {
    /// Record a downstream session and give it a handle back
    AttachDownstream(Arc<dyn DownstreamSession>),
}

impl fmt::Debug for UpstreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamEvent::AttachDownstream(session) => f
                .debug_tuple("AttachDownstream")
                .field(&session.session_id())
                .finish(),
        }
    }
}

/// Cloneable reference to a running upstream session.
///
/// Does not own the session: it can only observe status and enqueue events.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    pool_index: usize,
    events: mpsc::Sender<UpstreamEvent>,
    status: watch::Receiver<Status>,
    handshake_done: watch::Receiver<bool>,
}

impl UpstreamHandle {
    /// Index of the pool this session talks to.
    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    /// Current status of the session.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Wait until the handshake has finished and return the outcome,
    /// either [`Status::Authorized`] or [`Status::Disconnected`].
    pub async fn handshake_finished(&self) -> Status {
        let mut done = self.handshake_done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            // Session dropped without finishing
            return Status::Disconnected;
        }
        self.status()
    }

    /// Attach a downstream session to this upstream.
    ///
    /// Only waits for channel capacity. Sessions attached before the
    /// handshake finishes are applied once the event loop starts. Fails with
    /// [`UpstreamError::SessionClosed`] if the event loop is gone.
    pub async fn attach_downstream_session(
        &self,
        session: Arc<dyn DownstreamSession>,
    ) -> UpstreamResult<()> {
        self.events
            .send(UpstreamEvent::AttachDownstream(session))
            .await
            .map_err(|_| UpstreamError::SessionClosed)
    }
}

/// Which setup responses have been consumed successfully.
#[derive(Debug, Default)]
struct HandshakeProgress {
    subscribed: bool,
    configured: bool,
    capabilities: bool,
    authorized: bool,
}

impl HandshakeProgress {
    fn complete(&self) -> bool {
        self.subscribed && self.configured && self.capabilities && self.authorized
    }
}

/// One connection to a pool, shared by many downstream sessions.
pub struct UpstreamSession {
    config: Arc<AgentConfig>,
    sub_account: String,
    pool_index: usize,
    pool: PoolAddress,
    shutdown: CancellationToken,

    transport: Option<Box<dyn Transport>>,
    peer_addr: Option<SocketAddr>,
    status_tx: watch::Sender<Status>,
    handshake_done: watch::Sender<bool>,
    progress: HandshakeProgress,

    /// Assigned by the pool in the subscribe response
    session_id: u32,
    version_mask: u32,
    extranonce2_size: usize,
    capabilities: ServerCapabilities,
    negotiated: NegotiatedParams,

    /// Only touched by the event loop once the handshake is done
    downstream: HashMap<u32, Arc<dyn DownstreamSession>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    event_rx: mpsc::Receiver<UpstreamEvent>,
}

impl UpstreamSession {
    /// Create a disconnected session for `config.pools[pool_index]`.
    pub fn new(
        config: Arc<AgentConfig>,
        sub_account: impl Into<String>,
        pool_index: usize,
        shutdown: CancellationToken,
    ) -> UpstreamResult<Self> {
        let pool = config
            .pools
            .get(pool_index)
            .cloned()
            .ok_or(UpstreamError::UnknownPool(pool_index))?;
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));

        Ok(Self {
            sub_account: sub_account.into(),
            pool_index,
            pool,
            shutdown,
            transport: None,
            peer_addr: None,
            status_tx: watch::Sender::new(Status::Disconnected),
            handshake_done: watch::Sender::new(false),
            progress: HandshakeProgress::default(),
            session_id: 0,
            version_mask: 0,
            extranonce2_size: 0,
            capabilities: ServerCapabilities::default(),
            negotiated: NegotiatedParams::default(),
            downstream: HashMap::new(),
            event_tx,
            event_rx,
            config,
        })
    }

    /// Get a handle for attaching downstream sessions.
    pub fn handle(&self) -> UpstreamHandle {
        UpstreamHandle {
            pool_index: self.pool_index,
            events: self.event_tx.clone(),
            status: self.status_tx.subscribe(),
            handshake_done: self.handshake_done.subscribe(),
        }
    }

    pub fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    pub fn sub_account(&self) -> &str {
        &self.sub_account
    }

    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn version_mask(&self) -> u32 {
        self.version_mask
    }

    /// Extranonce2 width, known once subscribed.
    pub fn extranonce2_size(&self) -> Option<usize> {
        (self.status() >= Status::Subscribed).then_some(self.extranonce2_size)
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    pub fn negotiated_params(&self) -> NegotiatedParams {
        self.negotiated
    }

    /// Number of attached downstream sessions.
    pub fn downstream_count(&self) -> usize {
        self.downstream.len()
    }

    /// Look up an attached downstream session.
    pub fn downstream(&self, session_id: u32) -> Option<&Arc<dyn DownstreamSession>> {
        self.downstream.get(&session_id)
    }

    /// Peer address once connected, configured `host:port` before that.
    pub fn remote_address(&self) -> String {
        match self.peer_addr {
            Some(addr) => addr.to_string(),
            None => self.pool.to_string(),
        }
    }

    fn set_status(&self, status: Status) {
        self.status_tx.send_replace(status);
    }

    /// Dial the pool.
    async fn connect(&mut self) -> UpstreamResult<()> {
        self.set_status(Status::Connecting);

        match Connection::connect(&self.pool.to_string(), self.config.dial_timeout).await {
            Ok(conn) => {
                self.attach_transport(Box::new(conn));
                Ok(())
            }
            Err(e) => {
                self.set_status(Status::Disconnected);
                Err(e)
            }
        }
    }

    fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        if let Some(addr) = transport.peer_addr() {
            self.peer_addr = Some(addr);
        }
        self.transport = Some(transport);
        self.set_status(Status::Connected);
    }

    /// Send one request line to the pool.
    pub async fn write_request(&mut self, request: &JsonRpcMessage) -> UpstreamResult<()> {
        if matches!(self.status(), Status::Connecting | Status::Disconnected) {
            return Err(UpstreamError::ConnectionClosed);
        }
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(UpstreamError::ConnectionClosed)?;

        let line = request.to_line()?;
        transport.write_line(&line).await
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.set_status(Status::Disconnected);
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
        }
    }

    /// Connect and run the handshake.
    ///
    /// Errors are not returned: they are logged, the session is closed, and
    /// the outcome is visible through [`status`](Self::status).
    pub async fn init(&mut self) {
        if let Err(e) = self.connect().await {
            error!(server = %self.remote_address(), error = %e, "Connect failed");
            self.handshake_done.send_replace(true);
            return;
        }
        self.handshake().await;
    }

    /// Run the handshake over an already-open transport.
    pub(crate) async fn init_with_transport(&mut self, transport: Box<dyn Transport>) {
        self.attach_transport(transport);
        self.handshake().await;
    }

    async fn handshake(&mut self) {
        let limit = self.config.handshake_timeout;

        let result = match self.send_setup_requests().await {
            Ok(()) => match tokio::time::timeout(limit, self.consume_responses()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::HandshakeTimeout(limit)),
            },
            Err(e) => {
                error!(server = %self.remote_address(), error = %e, "Write JSON request failed");
                Err(e)
            }
        };

        match result {
            Ok(()) => {}
            Err(UpstreamError::Shutdown) => {
                info!(server = %self.remote_address(), "Handshake interrupted by shutdown");
                self.close().await;
            }
            Err(e) => {
                error!(
                    server = %self.remote_address(),
                    sub_account = %self.sub_account,
                    error = %e,
                    "Handshake failed"
                );
                self.close().await;
            }
        }

        self.handshake_done.send_replace(true);
    }

    async fn send_setup_requests(&mut self) -> UpstreamResult<()> {
        let requests = [
            subscribe_request(&self.config.user_agent),
            configure_request(),
            capabilities_request(),
            authorize_request(&self.sub_account),
        ];

        for request in &requests {
            self.write_request(request).await?;
        }
        Ok(())
    }

    /// Read and handle units until the handshake leaves the in-progress
    /// states. Fatal errors are returned for the caller to close on.
    async fn consume_responses(&mut self) -> UpstreamResult<()> {
        let shutdown = self.shutdown.clone();

        while matches!(self.status(), Status::Connected | Status::Subscribed) {
            let transport = self
                .transport
                .as_deref_mut()
                .ok_or(UpstreamError::ConnectionClosed)?;

            let unit = tokio::select! {
                unit = frame::read_unit(transport) => unit?,
                _ = shutdown.cancelled() => return Err(UpstreamError::Shutdown),
            };

            match unit {
                InboundUnit::ExMessage(header) => {
                    trace!(
                        kind = header.kind,
                        length = header.length,
                        "Skipping ex-message during handshake"
                    );
                }
                InboundUnit::Line(line) => self.handle_line(&line)?,
            }
        }

        Ok(())
    }

    /// Handle one JSON line. Decode failures are logged and dropped.
    fn handle_line(&mut self, line: &[u8]) -> UpstreamResult<()> {
        let msg = match JsonRpcMessage::from_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                info!(
                    server = %self.remote_address(),
                    error = %e,
                    line = %String::from_utf8_lossy(line).trim_end(),
                    "JSON decode failed, ignoring line"
                );
                return Ok(());
            }
        };

        match &msg {
            JsonRpcMessage::Request { method, params, .. } => {
                self.handle_pool_request(method, params);
            }
            JsonRpcMessage::Response { result, error, .. } => {
                match msg.id() {
                    Some(SUBSCRIBE_ID) => {
                        self.handle_subscribe_response(result.as_ref(), error.as_ref())?
                    }
                    Some(CONFIGURE_ID) => {
                        self.handle_configure_response(result.as_ref(), error.as_ref())
                    }
                    Some(CAPABILITIES_ID) => self.handle_capabilities_response(result.as_ref()),
                    Some(AUTHORIZE_ID) => {
                        self.handle_authorize_response(result.as_ref(), error.as_ref())?
                    }
                    id => {
                        info!(
                            server = %self.remote_address(),
                            id = ?id,
                            "Unexpected pool response"
                        );
                    }
                }
                self.promote_if_complete();
            }
        }

        Ok(())
    }

    fn handle_pool_request(&mut self, method: &str, params: &Value) {
        match method {
            "mining.set_version_mask" => self.handle_set_version_mask(params),
            "mining.set_difficulty" | "mining.notify" => {
                trace!(method = %method, "Ignoring pool request during handshake");
            }
            _ => {
                info!(server = %self.remote_address(), method = %method, "Unhandled pool request");
            }
        }
    }

    fn handle_set_version_mask(&mut self, params: &Value) {
        let Some(first) = params.as_array().and_then(|arr| arr.first()) else {
            return;
        };

        let Some(mask_hex) = first.as_str() else {
            warn!(
                server = %self.remote_address(),
                params = %params,
                "Version mask is not a string"
            );
            return;
        };

        match u32::from_str_radix(mask_hex.trim_start_matches("0x"), 16) {
            Ok(mask) => {
                self.version_mask = mask;
                info!(
                    server = %self.remote_address(),
                    mask = %format!("{:#010x}", mask),
                    "Version mask updated"
                );
            }
            Err(_) => {
                warn!(server = %self.remote_address(), mask = %mask_hex, "Version mask is not hex");
            }
        }
    }

    /// `[[subscriptions...], session_id_hex, extranonce2_size]`
    fn handle_subscribe_response(
        &mut self,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> UpstreamResult<()> {
        let failed = |what: &str| {
            UpstreamError::SubscriptionFailed(format!("{}, pool error: {:?}", what, error))
        };

        let arr = result
            .and_then(Value::as_array)
            .ok_or_else(|| failed("result is not an array"))?;
        if arr.len() < 3 {
            return Err(failed("result is missing items"));
        }

        let session_id_hex = arr[1]
            .as_str()
            .ok_or_else(|| failed("session id is not a string"))?;
        let session_id =
            u32::from_str_radix(session_id_hex, 16).map_err(|_| failed("session id is not hex"))?;

        // Pools send a JSON number; anything fractional is truncated
        let size = arr[2]
            .as_f64()
            .ok_or_else(|| failed("extranonce2 size is not a number"))? as i64;
        if size < MIN_EXTRANONCE2_SIZE as i64 {
            return Err(UpstreamError::IncompatibleExtranonce2Size {
                size,
                min: MIN_EXTRANONCE2_SIZE,
            });
        }

        self.session_id = session_id;
        self.extranonce2_size = size as usize;
        self.progress.subscribed = true;
        self.set_status(Status::Subscribed);

        debug!(
            server = %self.remote_address(),
            session_id = %format!("{:08x}", session_id),
            extranonce2_size = size,
            "Subscribed"
        );
        Ok(())
    }

    fn handle_configure_response(&mut self, result: Option<&Value>, error: Option<&Value>) {
        // Negotiated parameters keep their requested values for now
        self.progress.configured = true;
        debug!(
            server = %self.remote_address(),
            result = ?result,
            error = ?error,
            "Configure response received"
        );
    }

    fn handle_capabilities_response(&mut self, result: Option<&Value>) {
        let (caps, problems) = ServerCapabilities::from_result(result);
        for problem in &problems {
            warn!(
                server = %self.remote_address(),
                problem = %problem,
                result = ?result,
                "Get server capabilities failed"
            );
        }

        self.capabilities = caps;
        self.progress.capabilities = true;

        if !caps.version_rolling {
            warn!(server = %self.remote_address(), "Pool server does not support ASICBoost");
        }
        if self.config.submit_response_from_server && !caps.submit_response {
            warn!(
                server = %self.remote_address(),
                "Pool server does not support sending submit responses to the agent"
            );
        }
    }

    fn handle_authorize_response(
        &mut self,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> UpstreamResult<()> {
        if result != Some(&Value::Bool(true)) {
            return Err(UpstreamError::AuthorizationFailed(format!(
                "result: {:?}, pool error: {:?}",
                result, error
            )));
        }

        self.progress.authorized = true;
        info!(
            server = %self.remote_address(),
            sub_account = %self.sub_account,
            "Authorize success"
        );
        Ok(())
    }

    fn promote_if_complete(&mut self) {
        if self.progress.complete() && self.status() == Status::Subscribed {
            self.set_status(Status::Authorized);
            debug!(server = %self.remote_address(), "Handshake complete");
        }
    }

    /// Apply events until shutdown, then close.
    ///
    /// On shutdown the channel is closed to new events; the ones already
    /// queued are still applied.
    pub async fn run(&mut self) {
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(server = %self.remote_address(), "Upstream session shutting down");
                    break;
                }

                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }

        self.event_rx.close();
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }
        self.close().await;
    }

    /// Handshake, then serve events if authorized.
    ///
    /// Returns once the session is closed. Handles fail to attach from then
    /// on.
    pub async fn start(mut self) {
        self.init().await;

        if self.status() == Status::Authorized {
            self.run().await;
        } else {
            self.drop_pending_events();
        }
    }

    /// Refuse further events and discard the queued ones.
    ///
    /// Sessions attached before a failed handshake never get an upstream.
    fn drop_pending_events(&mut self) {
        self.event_rx.close();
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                UpstreamEvent::AttachDownstream(session) => {
                    warn!(
                        server = %self.remote_address(),
                        session_id = %format!("{:08x}", session.session_id()),
                        "Upstream unavailable, downstream session not attached"
                    );
                }
            }
        }
    }

    fn handle_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::AttachDownstream(session) => self.add_downstream_session(session),
        }
    }

    fn add_downstream_session(&mut self, session: Arc<dyn DownstreamSession>) {
        let id = session.session_id();
        if self.downstream.insert(id, Arc::clone(&session)).is_some() {
            debug!(session_id = %format!("{:08x}", id), "Replaced stale downstream session");
        }
        session.set_upstream(self.handle());

        debug!(
            server = %self.remote_address(),
            session_id = %format!("{:08x}", id),
            sessions = self.downstream.len(),
            "Downstream session attached"
        );
    }
}
