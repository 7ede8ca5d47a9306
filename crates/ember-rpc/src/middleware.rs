//! Client middleware.
//!
//! Middleware intercepts outgoing requests before they reach the transport.
//! A chain is folded right-to-left, so the first middleware registered is the
//! outermost: it sees the request first and decides whether, and how often,
//! the rest of the chain runs.
//!
//! A middleware ends in one of three ways:
//! - `Ok(None)`: the request went to the transport; the answer arrives as a
//!   frame
//! - `Ok(Some(exit))`: the middleware answered the request itself
//! - `Err(cause)`: the request fails with `cause`
//!
//! ```rust
//! use ember_rpc::middleware::{Dispatch, Middleware, Next, RpcRequest};
//!
//! struct Tenant(&'static str);
//!
//! impl Middleware for Tenant {
//!     fn wrap(&self, mut request: RpcRequest, next: Next<'_>) -> Dispatch {
//!         request.headers.insert("x-tenant".to_string(), self.0.to_string());
//!         next(request)
//!     }
//! }
//! ```

use std::sync::Arc;

use ember_runtime::{Cause, Exit};
use serde_json::Value;

use crate::message::{Headers, RequestId};

/// A request as seen by middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: RequestId,
    pub tag: String,
    pub payload: Value,
    pub headers: Headers,
}

/// How a request left a middleware chain.
pub type Dispatch = Result<Option<Exit<Value, Value>>, Cause<Value>>;

/// The downstream continuation of a middleware.
pub type Next<'a> = &'a dyn Fn(RpcRequest) -> Dispatch;

/// An interceptor around request dispatch.
///
/// Returning without calling `next` short-circuits the request: `Err(cause)`
/// fails it and `Ok(Some(exit))` answers it. `Ok(None)` without a call to
/// `next` leaves nothing to wait for, so the client fails the request with a
/// defect.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, request: RpcRequest, next: Next<'_>) -> Dispatch;
}

impl<F> Middleware for F
where
    F: Fn(RpcRequest, Next<'_>) -> Dispatch + Send + Sync + 'static,
{
    fn wrap(&self, request: RpcRequest, next: Next<'_>) -> Dispatch {
        self(request, next)
    }
}

/// Run `request` through `chain`, ending in `terminal`.
pub(crate) fn run_chain(
    chain: &[Arc<dyn Middleware>],
    request: RpcRequest,
    terminal: Next<'_>,
) -> Dispatch {
    match chain.split_first() {
        None => terminal(request),
        Some((outer, rest)) => outer.wrap(request, &|request| run_chain(rest, request, terminal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn request() -> RpcRequest {
        RpcRequest {
            id: RequestId::new(1),
            tag: "Ping".to_string(),
            payload: Value::Null,
            headers: Headers::new(),
        }
    }

    fn tracing_layer(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Middleware> {
        let log = Arc::clone(log);
        Arc::new(move |request: RpcRequest, next: Next<'_>| {
            log.lock().push(format!("enter {name}"));
            let result = next(request);
            log.lock().push(format!("exit {name}"));
            result
        })
    }

    #[test]
    fn test_first_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![tracing_layer(&log, "a"), tracing_layer(&log, "b")];
        let terminal_log = Arc::clone(&log);

        run_chain(&chain, request(), &|_| {
            terminal_log.lock().push("send".to_string());
            Ok(None)
        })
        .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["enter a", "enter b", "send", "exit b", "exit a"]
        );
    }

    #[test]
    fn test_short_circuit_skips_transport() {
        let deny: Arc<dyn Middleware> = Arc::new(|_: RpcRequest, _: Next<'_>| -> Dispatch {
            Err(Cause::fail(Value::String("unauthorized".to_string())))
        });
        let result = run_chain(&[deny], request(), &|_| panic!("transport reached"));
        assert_eq!(result, Err(Cause::fail(Value::String("unauthorized".to_string()))));
    }

    #[test]
    fn test_middleware_may_answer_locally() {
        let cached: Arc<dyn Middleware> = Arc::new(|request: RpcRequest, next: Next<'_>| -> Dispatch {
            if request.tag == "Ping" {
                Ok(Some(Exit::succeed(Value::String("pong".to_string()))))
            } else {
                next(request)
            }
        });
        let result = run_chain(&[cached], request(), &|_| panic!("transport reached"));
        assert_eq!(result, Ok(Some(Exit::succeed(Value::String("pong".to_string())))));
    }

    #[test]
    fn test_middleware_may_retry() {
        let attempts = Arc::new(Mutex::new(0));
        let retry: Arc<dyn Middleware> = Arc::new(|request: RpcRequest, next: Next<'_>| {
            next(request.clone()).or_else(|_| next(request))
        });
        let counter = Arc::clone(&attempts);

        let result = run_chain(&[retry], request(), &|_| {
            let mut attempts = counter.lock();
            *attempts += 1;
            if *attempts == 1 {
                Err(Cause::die("flaky"))
            } else {
                Ok(None)
            }
        });

        assert_eq!(result, Ok(None));
        assert_eq!(*attempts.lock(), 2);
    }
}
