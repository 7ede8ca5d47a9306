//! Ember RPC - client-side request correlation
//!
//! An [`RpcClient`] sends requests over a pluggable [`Protocol`] and routes
//! the frames that come back to the caller that is waiting for them:
//! - Unary calls wait for a single `Exit` frame
//! - Streaming calls receive `Chunk` frames into a bounded [`Mailbox`],
//!   acknowledging each one when the transport asks for it
//! - Abandoned requests send an `Interrupt` frame so the server can stop work
//! - A `Defect` frame or a failing transport aborts every pending request
//!
//! Requests pass through per-procedure [`Middleware`] before reaching the
//! transport, and the client shuts down with the [`Scope`] it was made in.
//!
//! # Example
//!
//! ```rust
//! use ember_rpc::{Procedure, ProcedureKind, RpcGroup};
//!
//! const GET_USER: Procedure<u32, String, String> = Procedure::unary("GetUser");
//! const WATCH: Procedure<(), String, String> = Procedure::stream("Watch");
//!
//! let group = RpcGroup::new().add_procedure(&GET_USER).add_procedure(&WATCH);
//! assert!(group.resolve("GetUser", ProcedureKind::Unary).is_ok());
//! assert!(group.resolve("Watch", ProcedureKind::Unary).is_err());
//! ```
//!
//! [`Mailbox`]: ember_runtime::Mailbox
//! [`Scope`]: ember_runtime::Scope

pub mod client;
pub mod error;
pub mod group;
pub mod message;
pub mod middleware;
pub mod protocol;

pub use client::{CallOptions, ClientConfig, RpcClient};
pub use error::{ProtocolError, RpcClientError, RpcError};
pub use group::{Procedure, ProcedureDef, ProcedureKind, RpcGroup, RpcStream};
pub use message::{FromClient, FromServer, Headers, RequestId, TraceContext};
pub use middleware::{Dispatch, Middleware, Next, RpcRequest};
pub use protocol::{FrameHandler, Protocol, Transferable};
