//! armorpc client
//!
//! A JSON-RPC 1.0 client over HTTP(S) with strict TLS trust and connection
//! pooling.
//!
//! # Overview
//!
//! - **Strict TLS by default**: https endpoints require an explicit CA bundle
//!   (or a platform-trust opt-in), the full chain is always validated, and
//!   hostname validation is on unless deliberately disabled. Client
//!   certificates are supported for mutual TLS.
//! - **Connection pooling**: persistent connections are reused across calls,
//!   bounded per endpoint, liveness-checked before reuse, and reclaimed
//!   through an RAII checkout guard so broken connections never circulate.
//! - **Explicit errors**: server faults, TLS rejections, pool exhaustion,
//!   transport failures, and protocol violations each have their own
//!   [`RpcError`] variant.
//!
//! # Example
//!
//! ```no_run
//! use armorpc_client::{rpc_params, ServerProxy};
//!
//! # async fn run() -> armorpc_client::Result<()> {
//! let proxy = ServerProxy::builder("https://rpc.internal:8443/jsonrpc")
//!     .ca_certs("/etc/armorpc/ca.pem")
//!     .client_identity("/etc/armorpc/client.pem", "/etc/armorpc/client.key")
//!     .pool_connections(true)
//!     .build()?;
//!
//! let state = proxy
//!     .call("examples.getStateName", rpc_params![41])
//!     .await?;
//! println!("{}", state);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod pool;
pub mod tls;
pub mod transport;

pub use client::{ProxyBuilder, ServerProxy};
pub use connection::{Connection, HttpResponse, Timeouts};
pub use endpoint::{Endpoint, Scheme};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use tls::{TlsOptions, TlsPolicy};
pub use transport::HttpTransport;

pub use armorpc_common::{
    FaultBody, JsonCodec, RequestIdSource, Result, RpcError, RpcParams, RpcRequest, RpcResponse,
};

// Re-exported for `rpc_params!`.
#[doc(hidden)]
pub use serde_json;

/// Build positional JSON-RPC params from Rust expressions.
///
/// ```
/// use armorpc_client::rpc_params;
///
/// let params = rpc_params![1, "two", [3, 4]];
/// assert_eq!(params.len(), 3);
///
/// let empty = rpc_params![];
/// assert!(empty.is_empty());
/// ```
#[macro_export]
macro_rules! rpc_params {
    ($($param:expr),* $(,)?) => {{
        let params: $crate::RpcParams = vec![$($crate::serde_json::json!($param)),*];
        params
    }};
}
