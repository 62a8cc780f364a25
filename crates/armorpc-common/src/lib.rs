//! armorpc protocol types and codec
//!
//! This crate provides the protocol layer shared by the armorpc client:
//!
//! - **Protocol types**: request/response structures, the error taxonomy,
//!   and per-instance request id generation
//! - **Codec**: JSON-RPC 1.0 encoding and strict response decoding
//!
//! # Wire format
//!
//! armorpc speaks JSON-RPC 1.0 style envelopes over HTTP POST bodies:
//!
//! - Request: `{"id": <u64>, "method": "<name>", "params": [<args>]}`
//! - Success: `{"id": <u64>, "result": <value>}`
//! - Failure: `{"id": <u64>, "error": {"code": <int>, "message": "<text>"}}`
//!
//! A server-reported `error` object decodes to [`RpcError::Fault`]; anything
//! else that deviates from this shape (unparseable JSON, an id that does not
//! match the outstanding request, a body with neither `result` nor `error`)
//! is [`RpcError::Protocol`].

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::*;
