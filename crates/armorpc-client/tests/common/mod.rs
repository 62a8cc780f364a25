//! Shared test server harness.
//!
//! Spins up real HTTP/1.1 servers (hyper) on ephemeral ports, optionally
//! behind TLS, and counts accepted connections so tests can assert on
//! pooling behavior.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub type HandlerResponse = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;
pub type Handler = Arc<dyn Fn(Parts, Bytes) -> HandlerResponse + Send + Sync>;

pub struct TestServer {
    pub addr: String,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Parts, Bytes) -> HandlerResponse + Send + Sync + 'static,
    {
        Self::start_inner(Arc::new(handler), None).await
    }

    pub async fn start_tls<F>(config: rustls::ServerConfig, handler: F) -> Self
    where
        F: Fn(Parts, Bytes) -> HandlerResponse + Send + Sync + 'static,
    {
        Self::start_inner(Arc::new(handler), Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn start_inner(handler: Handler, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            let Ok((stream, _)) = result else { continue };
                            connections.fetch_add(1, Ordering::SeqCst);
                            let handler = handler.clone();
                            let requests = requests.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let handler = handler.clone();
                                    let requests = requests.clone();
                                    async move {
                                        requests.fetch_add(1, Ordering::SeqCst);
                                        let (parts, body) = req.into_parts();
                                        let body = body.collect().await.unwrap().to_bytes();
                                        Ok::<_, hyper::Error>(handler(parts, body).await)
                                    }
                                });
                                match acceptor {
                                    Some(acceptor) => {
                                        let Ok(tls) = acceptor.accept(stream).await else {
                                            return;
                                        };
                                        let _ = http1::Builder::new()
                                            .serve_connection(TokioIo::new(tls), service)
                                            .await;
                                    }
                                    None => {
                                        let _ = http1::Builder::new()
                                            .serve_connection(TokioIo::new(stream), service)
                                            .await;
                                    }
                                }
                            });
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
        }

        TestServer {
            addr,
            connections,
            requests,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn tls_url(&self) -> String {
        format!("https://{}", self.addr)
    }

    /// Connections the server has accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn json_response(value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&value).unwrap())))
        .unwrap()
}

/// Echoes the request params back as the result, under the request's id.
pub fn echo_handler(_parts: Parts, body: Bytes) -> HandlerResponse {
    Box::pin(async move {
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json_response(serde_json::json!({
            "id": request["id"],
            "result": request["params"],
        }))
    })
}
