//! Procedure tables.
//!
//! An [`RpcGroup`] is the static description of what a client may call: one
//! [`ProcedureDef`] per tag, each with its kind and middleware. The table is
//! built once and shared by the client. [`Procedure`] values give the same
//! tags a typed face so callers never handle raw JSON.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ember_runtime::{Exit, Mailbox};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{RpcClientError, RpcError};
use crate::middleware::Middleware;

/// Whether a procedure answers once or with a stream of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Unary,
    Stream,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::Unary => f.write_str("unary"),
            ProcedureKind::Stream => f.write_str("stream"),
        }
    }
}

/// One entry of the procedure table.
#[derive(Clone)]
pub struct ProcedureDef {
    tag: String,
    kind: ProcedureKind,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ProcedureDef {
    pub fn new(tag: impl Into<String>, kind: ProcedureKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
            middleware: Vec::new(),
        }
    }

    /// Append a middleware; earlier middleware wraps later middleware.
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }
}

impl fmt::Debug for ProcedureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureDef")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// The procedures a client can call, keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct RpcGroup {
    procedures: IndexMap<String, ProcedureDef>,
}

impl RpcGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a procedure definition, replacing any previous one with the same
    /// tag.
    pub fn add(mut self, def: ProcedureDef) -> Self {
        self.procedures.insert(def.tag.clone(), def);
        self
    }

    /// Add the definition of a typed procedure.
    pub fn add_procedure<Req, Resp, Err>(self, procedure: &Procedure<Req, Resp, Err>) -> Self {
        self.add(ProcedureDef::new(procedure.tag, procedure.kind))
    }

    /// Add `middleware` to every procedure currently in the group, outside
    /// the middleware they already have.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        for def in self.procedures.values_mut() {
            def.middleware.insert(0, Arc::clone(&middleware));
        }
        self
    }

    pub fn get(&self, tag: &str) -> Option<&ProcedureDef> {
        self.procedures.get(tag)
    }

    /// Look up `tag` and check that it has the expected kind.
    pub fn resolve(&self, tag: &str, expected: ProcedureKind) -> Result<&ProcedureDef, RpcClientError> {
        let def = self
            .procedures
            .get(tag)
            .ok_or_else(|| RpcClientError::UnknownProcedure(tag.to_string()))?;
        if def.kind != expected {
            return Err(RpcClientError::WrongKind {
                tag: tag.to_string(),
                expected,
                actual: def.kind,
            });
        }
        Ok(def)
    }

    /// Tags in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// A typed procedure handle.
///
/// `Req` is sent as the payload, `Resp` is the success value (or the element
/// type for streams) and `Err` the declared failure.
pub struct Procedure<Req, Resp, Err> {
    tag: &'static str,
    kind: ProcedureKind,
    _types: PhantomData<fn(Req) -> (Resp, Err)>,
}

impl<Req, Resp, Err> Procedure<Req, Resp, Err> {
    pub const fn unary(tag: &'static str) -> Self {
        Self {
            tag,
            kind: ProcedureKind::Unary,
            _types: PhantomData,
        }
    }

    pub const fn stream(tag: &'static str) -> Self {
        Self {
            tag,
            kind: ProcedureKind::Stream,
            _types: PhantomData,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }
}

impl<Req, Resp, Err> Clone for Procedure<Req, Resp, Err> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp, Err> Copy for Procedure<Req, Resp, Err> {}

impl<Req, Resp, Err> fmt::Debug for Procedure<Req, Resp, Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .finish()
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

/// Typed view over the mailbox of a streaming request.
///
/// Iterating blocks until the next value arrives. The iterator ends after
/// the stream completes, or after yielding its one error.
pub struct RpcStream<Resp, Err> {
    mailbox: Mailbox<Value, Value>,
    finished: bool,
    _types: PhantomData<fn() -> (Resp, Err)>,
}

impl<Resp, Err> RpcStream<Resp, Err> {
    pub(crate) fn new(mailbox: Mailbox<Value, Value>) -> Self {
        Self {
            mailbox,
            finished: false,
            _types: PhantomData,
        }
    }

    /// The untyped mailbox behind this stream.
    pub fn mailbox(&self) -> &Mailbox<Value, Value> {
        &self.mailbox
    }
}

impl<Resp, Err> Iterator for RpcStream<Resp, Err>
where
    Resp: DeserializeOwned,
    Err: DeserializeOwned,
{
    type Item = Result<Resp, RpcError<Err>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = match self.mailbox.take() {
            Ok(Some(value)) => decode(value).map_err(RpcError::Decode),
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(cause) => Err(RpcError::from_cause(cause, decode)),
        };
        if next.is_err() {
            self.finished = true;
        }
        Some(next)
    }
}

impl<Resp, Err> fmt::Debug for RpcStream<Resp, Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("mailbox", &self.mailbox)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Decode a unary outcome into the typed result.
pub(crate) fn decode_exit<Resp, Err>(exit: Exit<Value, Value>) -> Result<Resp, RpcError<Err>>
where
    Resp: DeserializeOwned,
    Err: DeserializeOwned,
{
    match exit {
        Exit::Success(value) => decode(value).map_err(RpcError::Decode),
        Exit::Failure(cause) => Err(RpcError::from_cause(cause, decode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;
    use crate::middleware::{Next, RpcRequest};
    use ember_runtime::Cause;
    use serde_json::json;

    const GET_USER: Procedure<u32, String, String> = Procedure::unary("GetUser");
    const TAIL: Procedure<(), u32, String> = Procedure::stream("Tail");

    #[test]
    fn test_resolve_checks_kind() {
        let group = RpcGroup::new().add_procedure(&GET_USER).add_procedure(&TAIL);

        assert_eq!(group.resolve("GetUser", ProcedureKind::Unary).unwrap().tag(), "GetUser");
        assert_eq!(
            group.resolve("Tail", ProcedureKind::Unary).unwrap_err(),
            RpcClientError::WrongKind {
                tag: "Tail".to_string(),
                expected: ProcedureKind::Unary,
                actual: ProcedureKind::Stream,
            }
        );
        assert_eq!(
            group.resolve("Missing", ProcedureKind::Unary).unwrap_err(),
            RpcClientError::UnknownProcedure("Missing".to_string())
        );
        assert_eq!(group.tags().collect::<Vec<_>>(), vec!["GetUser", "Tail"]);
    }

    #[test]
    fn test_group_middleware_wraps_procedure_middleware() {
        let inner = |mut request: RpcRequest, next: Next<'_>| {
            request.headers.insert("order".to_string(), "inner".to_string());
            next(request)
        };
        let outer = |mut request: RpcRequest, next: Next<'_>| {
            request.headers.insert("order".to_string(), "outer".to_string());
            next(request)
        };
        let group = RpcGroup::new()
            .add(ProcedureDef::new("Ping", ProcedureKind::Unary).with_middleware(inner))
            .middleware(outer);

        let def = group.get("Ping").unwrap();
        let seen = parking_lot::Mutex::new(None);
        crate::middleware::run_chain(
            def.middleware(),
            RpcRequest {
                id: crate::message::RequestId::new(0),
                tag: "Ping".to_string(),
                payload: Value::Null,
                headers: Headers::new(),
            },
            &|request| {
                *seen.lock() = request.headers.get("order").cloned();
                Ok(None)
            },
        )
        .unwrap();

        // The inner middleware runs last, so its header wins.
        assert_eq!(seen.lock().as_deref(), Some("inner"));
    }

    #[test]
    fn test_decode_exit() {
        let ok: Result<String, RpcError<String>> = decode_exit(Exit::succeed(json!("ada")));
        assert_eq!(ok, Ok("ada".to_string()));

        let failed: Result<String, RpcError<String>> = decode_exit(Exit::fail(json!("missing")));
        assert_eq!(failed, Err(RpcError::Failure("missing".to_string())));

        let bad: Result<u32, RpcError<String>> = decode_exit(Exit::succeed(json!("ada")));
        assert!(matches!(bad, Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_stream_yields_values_then_error() {
        let mailbox: Mailbox<Value, Value> = Mailbox::bounded(4);
        mailbox.offer_all([json!(1), json!(2)]).unwrap();
        mailbox.fail_cause(Cause::fail(json!("lagging")));

        let stream: RpcStream<u32, String> = RpcStream::new(mailbox);
        let items: Vec<_> = stream.collect();
        assert_eq!(
            items,
            vec![Ok(1), Ok(2), Err(RpcError::Failure("lagging".to_string()))]
        );
    }
}
