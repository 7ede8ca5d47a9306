//! The request-correlation engine.
//!
//! An [`RpcClient`] multiplexes unary and streaming requests over one
//! [`Protocol`]. Every request gets a fresh [`RequestId`] and a pending entry;
//! frames delivered by the protocol's `run` loop are routed back to that entry
//! by id.
//!
//! # Request lifecycle
//!
//! ```text
//! Dispatched ──Exit──────────────────────────▶ Completed
//!     │  └──Chunk* (streams)──▶ Streaming ──Exit──▶ Completed
//!     ├──answered or failed by middleware────▶ Completed
//!     ├──caller interrupted / scope closed──▶ Interrupted (+ Interrupt frame)
//!     ├──Defect frame────────────────────────▶ Aborted (every request)
//!     └──client shutdown─────────────────────▶ Interrupted (every request)
//! ```
//!
//! Ids are never reused, and a frame for an id that is no longer pending is
//! dropped.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ember_runtime::{
    fiber, Cause, Deferred, Defect, Exit, Fiber, FiberError, FiberId, FinalizerKey, Mailbox,
    Scope, ScopeClosed,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, debug_span, trace, warn};

use crate::error::{RpcClientError, RpcError};
use crate::group::{decode_exit, Procedure, ProcedureDef, ProcedureKind, RpcGroup, RpcStream};
use crate::message::{defect_from_value, FromClient, FromServer, Headers, RequestId, TraceContext};
use crate::middleware::{run_chain, Dispatch, RpcRequest};
use crate::protocol::{FrameHandler, Protocol, Transferable};

/// Configuration for an [`RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of each streaming request's mailbox
    pub mailbox_capacity: usize,
    /// Upper bound on sending an `Interrupt` or `Eof` frame
    pub interrupt_timeout: Duration,
    /// Headers added to every request; per-call headers take precedence
    pub headers: Headers,
    /// Omit trace linkage from requests and skip per-request spans
    pub disable_tracing: bool,
    /// Prefix of per-request span names
    pub span_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 16,
            interrupt_timeout: Duration::from_secs(1),
            headers: Headers::new(),
            disable_tracing: false,
            span_prefix: "RpcClient".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.interrupt_timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_tracing_disabled(mut self) -> Self {
        self.disable_tracing = true;
        self
    }

    pub fn with_span_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.span_prefix = prefix.into();
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: Headers,
    /// Sent only when the protocol supports transferables.
    pub transferables: Vec<Transferable>,
    /// Parent span to link the request to.
    pub trace: Option<TraceContext>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_transferable(mut self, transferable: impl Into<Transferable>) -> Self {
        self.transferables.push(transferable.into());
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

enum PendingEntry {
    Unary {
        resume: Deferred<Exit<Value, Value>>,
    },
    Stream {
        mailbox: Mailbox<Value, Value>,
        /// The consumer's scope and the finalizer interrupting the request.
        scope: Scope,
        finalizer: FinalizerKey,
    },
}

impl PendingEntry {
    fn kind(&self) -> ProcedureKind {
        match self {
            PendingEntry::Unary { .. } => ProcedureKind::Unary,
            PendingEntry::Stream { .. } => ProcedureKind::Stream,
        }
    }

    /// Resolve the entry with its final exit. A stream's success value is
    /// dropped.
    fn resolve(self, exit: Exit<Value, Value>) {
        match self {
            PendingEntry::Unary { resume } => {
                resume.complete(exit);
            }
            PendingEntry::Stream {
                mailbox,
                scope,
                finalizer,
            } => {
                scope.remove_finalizer(finalizer);
                mailbox.done(exit.as_void());
            }
        }
    }

    fn fail(self, cause: Cause<Value>) {
        self.resolve(Exit::Failure(cause));
    }
}

#[derive(Default)]
struct ClientState {
    pending: FxHashMap<RequestId, PendingEntry>,
    shutdown: bool,
}

struct ClientInner {
    protocol: Arc<dyn Protocol>,
    group: RpcGroup,
    config: ClientConfig,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
    run_fiber: Mutex<Option<Fiber<()>>>,
}

/// Client side of an RPC connection.
///
/// `RpcClient` is a shared handle; clones refer to the same connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a client and start the protocol's `run` loop.
    ///
    /// The client shuts down when `scope` closes. If `scope` is already
    /// closed, nothing is started and `Err(ScopeClosed)` is returned.
    pub fn make(
        scope: &Scope,
        protocol: Arc<dyn Protocol>,
        group: RpcGroup,
        config: ClientConfig,
    ) -> Result<Self, ScopeClosed> {
        let client = Self {
            inner: Arc::new(ClientInner {
                protocol,
                group,
                config,
                next_id: AtomicU64::new(0),
                state: Mutex::new(ClientState::default()),
                run_fiber: Mutex::new(None),
            }),
        };

        let shutdown = client.clone();
        scope.add_finalizer(move || shutdown.shutdown())?;

        let run_fiber = fiber::fork(run_loop(Arc::downgrade(&client.inner)));
        let mut slot = client.inner.run_fiber.lock();
        if client.is_shutdown() {
            run_fiber.interrupt();
        } else {
            *slot = Some(run_fiber);
        }
        drop(slot);

        debug!(procedures = client.inner.group.len(), "rpc client started");
        Ok(client)
    }

    pub fn group(&self) -> &RpcGroup {
        &self.inner.group
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of requests awaiting their terminating frame.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    fn next_id(&self) -> RequestId {
        RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn take_pending(&self, id: RequestId) -> Option<PendingEntry> {
        self.inner.state.lock().pending.remove(&id)
    }

    /// Call a unary procedure and wait for its outcome.
    ///
    /// Interrupting the calling fiber abandons the request: the entry is
    /// removed, an `Interrupt` frame is sent in the background and the call
    /// returns an interrupted exit. After shutdown every call returns an
    /// interrupted exit without being sent.
    pub fn call(
        &self,
        tag: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<Exit<Value, Value>, RpcClientError> {
        let def = self.inner.group.resolve(tag, ProcedureKind::Unary)?;
        let id = self.next_id();
        let resume = Deferred::new();
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Ok(Exit::interrupt(fiber::current_id()));
            }
            state.pending.insert(
                id,
                PendingEntry::Unary {
                    resume: resume.clone(),
                },
            );
        }

        self.dispatch(def, id, payload, options);

        match resume.wait() {
            Ok(exit) => Ok(exit),
            Err(interrupted) => {
                if self.take_pending(id).is_some() {
                    debug!(request_id = %id, tag, "request interrupted by caller");
                    self.send_interrupt(id, vec![interrupted.0]);
                    Ok(Exit::interrupt(interrupted.0))
                } else {
                    // Resolved concurrently with the interruption.
                    Ok(resume.poll().unwrap_or(Exit::interrupt(interrupted.0)))
                }
            }
        }
    }

    /// Start a streaming procedure, returning the mailbox its values arrive
    /// in.
    ///
    /// The request lives as long as `scope`: closing the scope while the
    /// request is pending sends an `Interrupt` frame and shuts the mailbox.
    pub fn stream(
        &self,
        scope: &Scope,
        tag: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<Mailbox<Value, Value>, RpcClientError> {
        let def = self.inner.group.resolve(tag, ProcedureKind::Stream)?.clone();
        let id = self.next_id();
        let mailbox = Mailbox::bounded(self.inner.config.mailbox_capacity);

        let client = self.clone();
        let consumer = mailbox.clone();
        let registered = scope.add_finalizer_exit(move |exit| {
            if client.take_pending(id).is_some() {
                let interruptors = exit
                    .cause()
                    .map(Cause::interruptors)
                    .filter(|ids| !ids.is_empty())
                    .unwrap_or_else(|| vec![fiber::current_id()]);
                debug!(request_id = %id, "stream scope closed while pending");
                client.send_interrupt(id, interruptors);
            }
            consumer.shutdown();
        });
        let Ok(finalizer) = registered else {
            return Ok(mailbox);
        };

        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                drop(state);
                scope.remove_finalizer(finalizer);
                mailbox.fail_cause(Cause::interrupt(fiber::current_id()));
                return Ok(mailbox);
            }
            state.pending.insert(
                id,
                PendingEntry::Stream {
                    mailbox: mailbox.clone(),
                    scope: scope.clone(),
                    finalizer,
                },
            );
        }
        if scope.is_closed() {
            // Closed between registration and insertion; the finalizer saw
            // nothing to interrupt.
            self.take_pending(id);
            return Ok(mailbox);
        }

        let client = self.clone();
        let sender = fiber::fork(move || client.dispatch(&def, id, payload, options));
        let registered = scope.add_finalizer(move || {
            if !sender.is_finished() {
                sender.interrupt();
            }
        });
        if let Err(ScopeClosed) = registered {
            trace!(request_id = %id, "scope closed before stream sender was tracked");
        }

        Ok(mailbox)
    }

    /// Run the request through the procedure's middleware and send it.
    ///
    /// When the chain fails the request, answers it itself or returns without
    /// sending, the pending entry is resolved here; there is no frame to wait
    /// for. If the request did reach the transport before being resolved
    /// locally, the server is told to interrupt it.
    fn dispatch(&self, def: &ProcedureDef, id: RequestId, payload: Value, options: CallOptions) {
        let config = &self.inner.config;
        let span = if config.disable_tracing {
            tracing::Span::none()
        } else {
            debug_span!(
                "rpc_request",
                rpc.method = %format!("{}.{}", config.span_prefix, def.tag()),
                request_id = %id
            )
        };
        let _entered = span.enter();

        let mut headers = config.headers.clone();
        headers.extend(options.headers);
        let trace = if config.disable_tracing { None } else { options.trace };
        let transferables = if self.inner.protocol.supports_transferables() {
            options.transferables
        } else {
            Vec::new()
        };

        let request = RpcRequest {
            id,
            tag: def.tag().to_string(),
            payload,
            headers,
        };
        let sent = Cell::new(false);
        let send = |request: RpcRequest| -> Dispatch {
            trace!(request_id = %request.id, tag = %request.tag, "sending request");
            let frame = FromClient::Request {
                id: request.id,
                tag: request.tag,
                payload: request.payload,
                headers: request.headers,
                trace_id: trace.as_ref().map(|t| t.trace_id.clone()),
                span_id: trace.as_ref().map(|t| t.span_id.clone()),
                sampled: trace.as_ref().map(|t| t.sampled),
            };
            self.inner
                .protocol
                .send(frame, transferables.clone())
                .map_err(|err| Cause::die(Defect::from(err)))?;
            sent.set(true);
            Ok(None)
        };

        let exit = match run_chain(def.middleware(), request, &send) {
            Ok(None) if sent.get() => return,
            Ok(None) => {
                warn!(request_id = %id, "middleware returned without dispatching");
                Exit::die(Defect::new("middleware did not dispatch request"))
            }
            Ok(Some(exit)) => exit,
            Err(cause) => Exit::Failure(cause),
        };
        let Some(entry) = self.take_pending(id) else {
            return;
        };
        debug!(
            request_id = %id,
            sent = sent.get(),
            success = exit.is_success(),
            "request resolved by middleware"
        );
        if sent.get() {
            self.send_interrupt(id, vec![fiber::current_id()]);
        }
        entry.resolve(exit);
    }

    /// Route a frame from the server to its pending request.
    pub fn write(&self, frame: FromServer) {
        match frame {
            FromServer::Chunk { request_id, values } => self.write_chunk(request_id, values),
            FromServer::Exit { request_id, exit } => match self.take_pending(request_id) {
                Some(entry) => {
                    debug!(
                        request_id = %request_id,
                        kind = ?entry.kind(),
                        success = exit.is_success(),
                        "request resolved"
                    );
                    entry.resolve(exit);
                }
                None => trace!(request_id = %request_id, "dropping exit for unknown request"),
            },
            FromServer::Defect { defect } => self.abort_all(defect_from_value(&defect)),
            FromServer::ClientEnd => trace!("server ended the client"),
        }
    }

    fn write_chunk(&self, request_id: RequestId, values: Vec<Value>) {
        let mailbox = match self.inner.state.lock().pending.get(&request_id) {
            Some(PendingEntry::Stream { mailbox, .. }) => mailbox.clone(),
            Some(PendingEntry::Unary { .. }) => {
                warn!(request_id = %request_id, "dropping chunk for unary request");
                return;
            }
            None => {
                trace!(request_id = %request_id, "dropping chunk for unknown request");
                return;
            }
        };

        trace!(request_id = %request_id, values = values.len(), "enqueueing chunk");
        match mailbox.offer_all(values) {
            Ok(true) => {
                if self.inner.protocol.supports_ack() {
                    let ack = FromClient::Ack { request_id };
                    if let Err(err) = self.inner.protocol.send(ack, Vec::new()) {
                        warn!(request_id = %request_id, error = %err, "failed to send ack");
                    }
                }
            }
            Ok(false) => trace!(request_id = %request_id, "consumer gone, chunk dropped"),
            Err(interrupted) => {
                trace!(request_id = %request_id, by = %interrupted.0, "chunk delivery interrupted")
            }
        }
    }

    /// Fail every pending request with `defect`.
    fn abort_all(&self, defect: Defect) {
        let entries: Vec<_> = self.inner.state.lock().pending.drain().collect();
        if !entries.is_empty() {
            warn!(pending = entries.len(), defect = %defect, "connection defect, aborting requests");
        }
        for (_, entry) in entries {
            entry.fail(Cause::die(defect.clone()));
        }
    }

    /// Send `Interrupt` for `id` in the background, bounded by the
    /// configured timeout. Failures are logged and dropped.
    fn send_interrupt(&self, id: RequestId, interruptors: Vec<FiberId>) {
        let frame = FromClient::Interrupt {
            request_id: id,
            interruptors,
        };
        let protocol = Arc::clone(&self.inner.protocol);
        let timeout = self.inner.config.interrupt_timeout;
        fiber::fork(move || send_bounded(protocol, frame, timeout));
    }

    /// Shut the client down.
    ///
    /// Every pending request resolves as interrupted, later requests are
    /// refused, the run loop is interrupted and a best-effort `Eof` is sent.
    pub fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.pending.drain().collect()
        };
        debug!(pending = entries.len(), "shutting down rpc client");

        let interruptor = fiber::current_id();
        for (_, entry) in entries {
            entry.fail(Cause::interrupt(interruptor));
        }
        if let Some(run_fiber) = self.inner.run_fiber.lock().take() {
            run_fiber.interrupt();
        }
        send_bounded(
            Arc::clone(&self.inner.protocol),
            FromClient::Eof,
            self.inner.config.interrupt_timeout,
        );
    }

    /// Call a typed unary procedure.
    pub fn invoke<Req, Resp, Err>(
        &self,
        procedure: &Procedure<Req, Resp, Err>,
        request: &Req,
    ) -> Result<Resp, RpcError<Err>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        Err: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|err| RpcError::Encode(err.to_string()))?;
        let exit = self.call(procedure.tag(), payload, CallOptions::default())?;
        decode_exit(exit)
    }

    /// Start a typed streaming procedure tied to `scope`.
    pub fn invoke_stream<Req, Resp, Err>(
        &self,
        scope: &Scope,
        procedure: &Procedure<Req, Resp, Err>,
        request: &Req,
    ) -> Result<RpcStream<Resp, Err>, RpcError<Err>>
    where
        Req: Serialize,
    {
        let payload = serde_json::to_value(request).map_err(|err| RpcError::Encode(err.to_string()))?;
        let mailbox = self.stream(scope, procedure.tag(), payload, CallOptions::default())?;
        Ok(RpcStream::new(mailbox))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RpcClient")
            .field("pending", &state.pending.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Body of the fiber running the protocol. A failing transport aborts every
/// pending request.
fn run_loop(inner: Weak<ClientInner>) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(protocol) = inner.upgrade().map(|inner| Arc::clone(&inner.protocol)) else {
            return;
        };
        let handler_target = inner.clone();
        let handler: FrameHandler = Arc::new(move |frame| {
            if let Some(inner) = handler_target.upgrade() {
                RpcClient { inner }.write(frame);
            }
        });

        let result = protocol.run(handler);
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let client = RpcClient { inner };
        match result {
            Ok(()) => debug!("protocol run loop finished"),
            Err(err) if client.is_shutdown() => {
                trace!(error = %err, "protocol stopped after shutdown")
            }
            Err(err) => client.abort_all(Defect::from(err)),
        }
    }
}

/// Send `frame` on a helper fiber, giving up after `timeout`.
fn send_bounded(protocol: Arc<dyn Protocol>, frame: FromClient, timeout: Duration) {
    let request_id = frame.request_id();
    let sender = fiber::fork(move || protocol.send(frame, Vec::new()));
    match fiber::uninterruptible(|| sender.join_timeout(timeout)) {
        Ok(Ok(())) => trace!(request_id = ?request_id, "control frame sent"),
        Ok(Err(err)) => warn!(request_id = ?request_id, error = %err, "failed to send control frame"),
        Err(FiberError::Timeout(_)) => {
            sender.interrupt();
            warn!(request_id = ?request_id, ?timeout, "timed out sending control frame");
        }
        Err(err) => warn!(request_id = ?request_id, error = %err, "control frame sender failed"),
    }
}
