use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use armorpc_common::{Result, RpcError};

use crate::endpoint::Endpoint;
use crate::tls::TlsPolicy;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Connect and per-operation I/O deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(10),
            io: Duration::from_secs(30),
        }
    }
}

enum ConnStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ConnStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            ConnStream::Plain(stream) => stream,
            ConnStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One parsed HTTP response.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the server asked for this connection not to be reused.
    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

/// A single persistent channel (plain TCP or TLS) to one host:port.
///
/// A connection performs one HTTP request/response cycle at a time; exclusive
/// use is enforced by the pool's checkout protocol, not by locking here.
pub struct Connection {
    stream: ConnStream,
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the endpoint, performing the TLS handshake for https.
    ///
    /// Certificate verification failures surface as
    /// [`RpcError::TlsVerification`]; there is no fallback to an unverified
    /// session.
    pub async fn open(
        endpoint: &Endpoint,
        tls: Option<&TlsPolicy>,
        timeouts: Timeouts,
    ) -> Result<Connection> {
        let policy = if endpoint.is_tls() {
            Some(tls.ok_or_else(|| {
                RpcError::Config(format!(
                    "https endpoint {} requires a TLS policy",
                    endpoint.authority()
                ))
            })?)
        } else {
            None
        };

        let tcp = Self::connect_tcp(endpoint, timeouts.connect).await?;
        let _ = tcp.set_nodelay(true);

        let stream = if let Some(policy) = policy {
            let connector = TlsConnector::from(policy.client_config());
            let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|_| {
                RpcError::Config(format!("invalid TLS server name: {}", endpoint.host))
            })?;
            let tls_stream = timeout(timeouts.connect, connector.connect(server_name, tcp))
                .await
                .map_err(|_| {
                    RpcError::Transport(format!(
                        "TLS handshake with {} timed out",
                        endpoint.authority()
                    ))
                })?
                .map_err(|e| classify_handshake_error(e, endpoint))?;
            ConnStream::Tls(Box::new(tls_stream))
        } else {
            ConnStream::Plain(tcp)
        };

        let now = Instant::now();
        Ok(Connection {
            stream,
            id: 0,
            created_at: now,
            last_used_at: now,
        })
    }

    async fn connect_tcp(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream> {
        let authority = endpoint.authority();
        let addrs = tokio::net::lookup_host(&authority)
            .await
            .map_err(|e| RpcError::Transport(format!("unable to resolve {}: {}", authority, e)))?;

        // Try each resolved address until one accepts.
        let mut last_err = None;
        for addr in addrs {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("connect to {} timed out", addr)),
            }
        }

        Err(RpcError::Transport(format!(
            "unable to connect to {}: {}",
            authority,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Cheap liveness probe for an idle connection.
    ///
    /// An idle keep-alive peer must have nothing to say: readable bytes mean
    /// either EOF (peer closed) or protocol garbage / a TLS close_notify, and
    /// in every case the connection must not be handed to a caller.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.tcp().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Write one HTTP/1.1 POST. Header pairs are emitted in order; the
    /// request line and blank separator are framed here.
    pub async fn send_request(
        &mut self,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
        io_timeout: Duration,
    ) -> Result<()> {
        let mut request = Vec::with_capacity(body.len() + 256);
        request.extend_from_slice(format!("POST {} HTTP/1.1\r\n", path).as_bytes());
        for (name, value) in headers {
            request.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        request.extend_from_slice(body);

        timeout(io_timeout, async {
            self.stream.write_all(&request).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| RpcError::Transport("timed out writing request".to_string()))?
        .map_err(|e| map_io_error(e, "writing request"))?;

        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Read one full HTTP response (status line, headers, body).
    pub async fn read_response(&mut self, io_timeout: Duration) -> Result<HttpResponse> {
        let response = timeout(io_timeout, self.read_response_inner())
            .await
            .map_err(|_| RpcError::Transport("timed out reading response".to_string()))??;
        self.last_used_at = Instant::now();
        Ok(response)
    }

    async fn read_response_inner(&mut self) -> Result<HttpResponse> {
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        let header_end = loop {
            if let Some(pos) = find_double_crlf(&buf) {
                break pos;
            }
            if buf.len() > MAX_HEADER_BYTES {
                return Err(RpcError::Protocol("response header block too large".to_string()));
            }
            let n = self
                .stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| map_io_error(e, "reading response headers"))?;
            if n == 0 {
                return Err(RpcError::Transport(
                    "connection closed before response headers".to_string(),
                ));
            }
        };

        let (status, http10, headers) = parse_head(&buf[..header_end])?;
        let mut body: Vec<u8> = buf[header_end + 4..].to_vec();

        let chunked = header_lookup(&headers, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if chunked {
            body = self.read_chunked(body).await?;
        } else if let Some(length) = header_lookup(&headers, "content-length") {
            let length: usize = length.trim().parse().map_err(|_| {
                RpcError::Protocol(format!("invalid Content-Length: {}", length))
            })?;
            if length > MAX_BODY_BYTES {
                return Err(RpcError::Protocol(format!(
                    "response body too large: {} bytes",
                    length
                )));
            }
            while body.len() < length {
                let n = self
                    .stream
                    .read_buf(&mut body)
                    .await
                    .map_err(|e| map_io_error(e, "reading response body"))?;
                if n == 0 {
                    return Err(RpcError::Transport(
                        "connection closed mid-body".to_string(),
                    ));
                }
            }
            body.truncate(length);
        } else {
            let close_delimited = http10
                || header_lookup(&headers, "connection")
                    .map(|v| v.eq_ignore_ascii_case("close"))
                    .unwrap_or(false);
            if close_delimited {
                loop {
                    if body.len() > MAX_BODY_BYTES {
                        return Err(RpcError::Protocol("response body too large".to_string()));
                    }
                    let n = self
                        .stream
                        .read_buf(&mut body)
                        .await
                        .map_err(|e| map_io_error(e, "reading response body"))?;
                    if n == 0 {
                        break;
                    }
                }
            }
            // Otherwise there is no body (e.g. 204 keep-alive).
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn read_chunked(&mut self, mut pending: Vec<u8>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line(&mut pending).await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| RpcError::Protocol(format!("invalid chunk size: {}", line)))?;

            if size == 0 {
                // Discard trailers up to the blank line.
                loop {
                    let trailer = self.read_line(&mut pending).await?;
                    if trailer.is_empty() {
                        return Ok(body);
                    }
                }
            }

            if body.len() + size > MAX_BODY_BYTES {
                return Err(RpcError::Protocol("response body too large".to_string()));
            }

            while pending.len() < size + 2 {
                let n = self
                    .stream
                    .read_buf(&mut pending)
                    .await
                    .map_err(|e| map_io_error(e, "reading chunked body"))?;
                if n == 0 {
                    return Err(RpcError::Transport(
                        "connection closed mid-body".to_string(),
                    ));
                }
            }
            body.extend_from_slice(&pending[..size]);
            pending.drain(..size + 2);
        }
    }

    async fn read_line(&mut self, pending: &mut Vec<u8>) -> Result<String> {
        loop {
            if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
                pending.drain(..pos + 2);
                return Ok(line);
            }
            if pending.len() > MAX_HEADER_BYTES {
                return Err(RpcError::Protocol("chunk header line too long".to_string()));
            }
            let n = self
                .stream
                .read_buf(pending)
                .await
                .map_err(|e| map_io_error(e, "reading chunked body"))?;
            if n == 0 {
                return Err(RpcError::Transport(
                    "connection closed mid-body".to_string(),
                ));
            }
        }
    }

    /// Close the underlying socket. Dropping the connection has the same
    /// effect; this exists for call sites that want to be explicit.
    pub fn close(self) {}
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_head(bytes: &[u8]) -> Result<(u16, bool, Vec<(String, String)>)> {
    let head = std::str::from_utf8(bytes)
        .map_err(|_| RpcError::Protocol("response head is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| RpcError::Protocol("empty response head".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| RpcError::Protocol(format!("bad status line: {}", status_line)))?;
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| RpcError::Protocol(format!("bad status line: {}", status_line)))?;
    let http10 = version == "HTTP/1.0";

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RpcError::Protocol(format!("malformed header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok((status, http10, headers))
}

fn classify_handshake_error(err: std::io::Error, endpoint: &Endpoint) -> RpcError {
    let cert_failure = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false);
    if cert_failure {
        RpcError::TlsVerification(format!(
            "certificate presented by {} rejected: {}",
            endpoint.authority(),
            err
        ))
    } else {
        RpcError::Transport(format!(
            "TLS handshake with {} failed: {}",
            endpoint.authority(),
            err
        ))
    }
}

fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RpcError::Transport(format!("{}: timed out", context))
        }
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => {
            RpcError::Transport(format!("{}: connection lost", context))
        }
        _ => RpcError::Io(err),
    }
}
