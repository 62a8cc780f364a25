use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use armorpc_common::{JsonCodec, RequestIdSource, Result, RpcParams, RpcRequest};

use crate::connection::Timeouts;
use crate::endpoint::Endpoint;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::tls::TlsOptions;
use crate::transport::HttpTransport;

/// Builder for [`ServerProxy`].
///
/// Everything is validated by [`build`](Self::build): URI scheme and host,
/// CA bundle, client credentials. A misconfigured proxy fails here, never on
/// the first call.
pub struct ProxyBuilder {
    uri: String,
    tls: TlsOptions,
    pool: PoolConfig,
    timeouts: Timeouts,
    extra_headers: Vec<(String, String)>,
    keep_cookies: bool,
    ids: Option<RequestIdSource>,
}

impl ProxyBuilder {
    fn new(uri: String) -> Self {
        ProxyBuilder {
            uri,
            tls: TlsOptions::default(),
            pool: PoolConfig::default(),
            timeouts: Timeouts::default(),
            extra_headers: Vec::new(),
            keep_cookies: false,
            ids: None,
        }
    }

    /// PEM bundle of CA certificates the server chain must validate against.
    pub fn ca_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_certs = Some(path.into());
        self
    }

    /// PEM client certificate and key presented during the handshake.
    pub fn client_identity(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.tls.cert_file = Some(cert_file.into());
        self.tls.key_file = Some(key_file.into());
        self
    }

    /// Whether the server certificate must match the endpoint hostname
    /// (default true). Chain validation is unconditional either way.
    pub fn validate_hostname(mut self, validate: bool) -> Self {
        self.tls.validate_hostname = validate;
        self
    }

    /// Opt in to the platform trust store instead of (or in addition to) an
    /// explicit CA bundle.
    pub fn platform_roots(mut self, enabled: bool) -> Self {
        self.tls.platform_roots = enabled;
        self
    }

    /// Keep connections alive and reuse them across calls (default off).
    pub fn pool_connections(mut self, enabled: bool) -> Self {
        self.pool.enabled = enabled;
        self
    }

    pub fn pool_max_size(mut self, max: usize) -> Self {
        self.pool.max_per_endpoint = max;
        self
    }

    pub fn pool_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool.checkout_timeout = timeout;
        self
    }

    pub fn pool_max_idle(mut self, max_idle: Duration) -> Self {
        self.pool.max_idle = max_idle;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.io = timeout;
        self
    }

    /// Header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Remember `Set-Cookie` values and replay them on later requests.
    pub fn keep_cookies(mut self, enabled: bool) -> Self {
        self.keep_cookies = enabled;
        self
    }

    /// Inject a deterministic request id source (tests).
    pub fn request_ids(mut self, ids: RequestIdSource) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<ServerProxy> {
        let endpoint = Endpoint::parse(&self.uri)?;
        let tls = if endpoint.is_tls() {
            Some(self.tls.build()?)
        } else {
            None
        };
        let pool = ConnectionPool::new(self.pool, tls, self.timeouts);
        let transport = HttpTransport::new(
            endpoint,
            pool,
            self.extra_headers,
            self.keep_cookies,
            self.timeouts,
        );
        Ok(ServerProxy {
            transport,
            ids: self.ids.unwrap_or_default(),
        })
    }
}

/// Proxy to a remote JSON-RPC service.
///
/// The generic primitive is [`call`](Self::call): any method name, including
/// dotted server-side namespaces (`"examples.getStateName"`), is passed
/// through verbatim with positional params. Build params with
/// [`rpc_params!`](crate::rpc_params).
///
/// A `ServerProxy` is safe to share across tasks; concurrent calls contend
/// only on the connection pool.
///
/// # Example
///
/// ```no_run
/// use armorpc_client::{rpc_params, ServerProxy};
///
/// # async fn run() -> armorpc_common::Result<()> {
/// let proxy = ServerProxy::builder("https://rpc.internal:8443/jsonrpc")
///     .ca_certs("/etc/armorpc/ca.pem")
///     .pool_connections(true)
///     .build()?;
///
/// let sum = proxy.call("math.add", rpc_params![1, 2]).await?;
/// assert_eq!(sum, 3);
/// # Ok(())
/// # }
/// ```
pub struct ServerProxy {
    transport: HttpTransport,
    ids: RequestIdSource,
}

impl std::fmt::Debug for ServerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProxy").finish_non_exhaustive()
    }
}

impl ServerProxy {
    pub fn builder(uri: impl Into<String>) -> ProxyBuilder {
        ProxyBuilder::new(uri.into())
    }

    /// Invoke `method` with positional `params` and decode the reply.
    ///
    /// Server-reported errors come back as `RpcError::Fault`; transport,
    /// TLS, and framing failures use their own variants and never masquerade
    /// as faults.
    pub async fn call(&self, method: &str, params: RpcParams) -> Result<Value> {
        let id = self.ids.next_id();
        let request = RpcRequest::new(id, method, params);
        let body = JsonCodec::encode_request(&request)?;
        tracing::debug!(method, id, "sending JSON-RPC request");
        let reply = self.transport.post(&body).await?;
        JsonCodec::decode_response(&reply, id)
    }

    /// Like [`call`](Self::call) but skip response decoding and hand back the
    /// raw HTTP body.
    pub async fn call_raw(&self, method: &str, params: RpcParams) -> Result<Vec<u8>> {
        let id = self.ids.next_id();
        let request = RpcRequest::new(id, method, params);
        let body = JsonCodec::encode_request(&request)?;
        tracing::debug!(method, id, "sending JSON-RPC request (raw)");
        self.transport.post(&body).await
    }

    /// Total connections opened since construction. With pooling enabled and
    /// a healthy server this stays at 1 for any number of sequential calls.
    pub fn connections_opened(&self) -> usize {
        self.transport.pool().connections_opened()
    }

    /// Shut the pool down: close idle connections and fail further calls.
    pub fn shutdown(&self) {
        self.transport.pool().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armorpc_common::RpcError;

    #[test]
    fn test_builder_rejects_unsupported_scheme() {
        let err = ServerProxy::builder("gopher://foo.com/").build().unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[test]
    fn test_builder_https_requires_trust() {
        // No CA bundle, no platform opt-in: must fail at build time.
        let err = ServerProxy::builder("https://foo.com/").build().unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[test]
    fn test_builder_http_needs_no_tls() {
        assert!(ServerProxy::builder("http://foo.com/").build().is_ok());
    }

    #[test]
    fn test_builder_missing_tls_material_fails_fast() {
        let err = ServerProxy::builder("https://foo.com/")
            .ca_certs("/does/not/exist.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }
}
