//! HTTP reverse proxy: resolve, admit, forward. One instance serves both
//! the plain and the TLS listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use torii_core::balance::BalancerRegistry;
use torii_core::transport::{header_timeout, ProxyBody, TransportPool};
use torii_core::{ConfigSnapshot, GatewayError};

use crate::full;
use crate::policy::{client_ip, PolicyChain, RequestContext};

pub struct HttpProxyServer {
    snapshot: Arc<ConfigSnapshot>,
    chain: PolicyChain,
    balancers: Arc<BalancerRegistry>,
    transports: Arc<TransportPool>,
    shutdown: watch::Receiver<bool>,
}

impl HttpProxyServer {
    pub fn new(
        snapshot: Arc<ConfigSnapshot>,
        chain: PolicyChain,
        balancers: Arc<BalancerRegistry>,
        transports: Arc<TransportPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            snapshot,
            chain,
            balancers,
            transports,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "http proxy listening");
        self.serve(listener, None).await
    }

    pub async fn run_tls(
        self: Arc<Self>,
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "https proxy listening");
        self.serve(listener, Some(TlsAcceptor::from(tls))).await
    }

    /// Accept loop over an already-bound listener; exits when the shutdown
    /// signal flips. In-flight connections run to completion.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "http accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream, remote, acceptor).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("http proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_conn(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(req, remote).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let served = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    builder
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                }
                Err(err) => {
                    debug!(%err, client = %remote, "tls handshake failed");
                    return;
                }
            },
            None => {
                builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await
            }
        };
        if let Err(err) = served {
            debug!(%err, client = %remote, "connection closed with error");
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        if path == "/ping" {
            return json_response(StatusCode::OK, json!({"message": "pong"}));
        }

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.host())
            .unwrap_or("");

        let detail = match self.snapshot.http_access_mode(host, &path) {
            Ok(detail) => detail,
            Err(err) => return reject(&err),
        };

        let mut ctx = RequestContext::new(detail, client_ip(&parts.headers, remote));
        ctx.headers = parts.headers;
        ctx.path = path;

        if let Err(err) = self.chain.admit(&mut ctx) {
            return reject(&err);
        }

        match self
            .forward(parts.method, parts.uri.query(), ctx, body)
            .await
        {
            Ok(response) => response,
            Err(err) => reject(&err),
        }
    }

    /// Single-attempt upstream exchange; a retry policy would wrap this.
    async fn forward(
        &self,
        method: Method,
        query: Option<&str>,
        ctx: RequestContext,
        body: Incoming,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let balancer = self.balancers.get(&ctx.service)?;
        let endpoint = balancer.get(&ctx.client_ip)?;

        let path = if ctx.path.is_empty() { "/" } else { ctx.path.as_str() };
        let target = match query {
            Some(q) => format!("http://{}{}?{}", endpoint, path, q),
            None => format!("http://{}{}", endpoint, path),
        };
        let uri: Uri = target
            .parse()
            .map_err(|_| GatewayError::Upstream(format!("bad upstream uri {}", target)))?;

        let mut upstream_req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.boxed())
            .map_err(|err| GatewayError::Upstream(format!("build upstream request: {}", err)))?;

        *upstream_req.headers_mut() = ctx.headers;
        let headers = upstream_req.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(HOST);
        if let Ok(host_value) = HeaderValue::from_str(&endpoint) {
            headers.insert(HOST, host_value);
        }
        if let Ok(ip_value) = HeaderValue::from_str(&ctx.client_ip) {
            headers.append(HeaderName::from_static("x-forwarded-for"), ip_value.clone());
            headers
                .entry(HeaderName::from_static("x-real-ip"))
                .or_insert(ip_value);
        }

        let client = self.transports.client(&ctx.service);
        let pending = client.request(upstream_req);
        let response = match header_timeout(&ctx.service) {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                GatewayError::Upstream(format!("upstream {} header timeout", endpoint))
            })?,
            None => pending.await,
        };
        let response = response
            .map_err(|err| GatewayError::Upstream(format!("upstream {}: {}", endpoint, err)))?;

        debug!(
            trace_id = %ctx.trace_id,
            service = %ctx.service.info.service_name,
            upstream = %endpoint,
            status = %response.status(),
            "proxied"
        );
        Ok(response.map(|b| b.boxed()))
    }
}

/// Connection-scoped headers must not travel to the upstream; the client
/// body is re-framed by the upstream connection.
fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    const HOP_BY_HOP: [&str; 9] = [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Policy rejections answer with the gateway JSON envelope.
fn reject(err: &GatewayError) -> Response<ProxyBody> {
    json_response(
        err.http_status(),
        json!({"errno": err.errno(), "errmsg": err.to_string(), "data": null}),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
