//! gRPC proxy. One HTTP/2 listener per GRPC-typed service: the policy
//! chain runs as an interceptor over the request metadata, then the stream
//! is forwarded transparently: request and response bodies flow
//! concurrently in both directions and trailers (`grpc-status`) pass
//! through untouched.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use torii_core::balance::BalancerRegistry;
use torii_core::model::ServiceDetail;
use torii_core::transport::{header_timeout, ProxyBody, TransportPool};
use torii_core::GatewayError;

use crate::full;
use crate::policy::{PolicyChain, RequestContext};

/// Metadata key the original gateway used to hand the matched app to inner
/// interceptors; the upstream must never see it.
const APP_METADATA_KEY: &str = "app";

pub struct GrpcProxyServer {
    detail: Arc<ServiceDetail>,
    chain: PolicyChain,
    balancers: Arc<BalancerRegistry>,
    transports: Arc<TransportPool>,
    shutdown: watch::Receiver<bool>,
}

impl GrpcProxyServer {
    pub fn new(
        detail: Arc<ServiceDetail>,
        chain: PolicyChain,
        balancers: Arc<BalancerRegistry>,
        transports: Arc<TransportPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            detail,
            chain,
            balancers,
            transports,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.detail.grpc_rule.port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, service = %self.detail.info.service_name, "grpc proxy listening");
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "grpc accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream, remote).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!(service = %self.detail.info.service_name, "grpc proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(req, remote).await) }
        });

        let served = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await;
        if let Err(err) = served {
            debug!(%err, client = %remote, "grpc connection closed with error");
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let mut ctx = RequestContext::new(
            self.detail.clone(),
            peer_ip(&remote.to_string()).to_string(),
        );
        ctx.headers = parts.headers;
        ctx.path = parts.uri.path().to_string();

        if let Err(err) = self.chain.admit(&mut ctx) {
            return reject_grpc(&err);
        }

        match self.forward(parts.uri, ctx, body).await {
            Ok(response) => response,
            Err(err) => reject_grpc(&err),
        }
    }

    async fn forward(
        &self,
        uri: Uri,
        mut ctx: RequestContext,
        body: Incoming,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let balancer = self.balancers.get(&self.detail)?;
        let endpoint = balancer.get(&ctx.client_ip)?;

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target: Uri = format!("http://{}{}", endpoint, path_and_query)
            .parse()
            .map_err(|_| GatewayError::Upstream(format!("bad upstream uri for {}", endpoint)))?;

        // The transformed metadata travels upstream, minus what the
        // upstream must not see.
        ctx.headers.remove(APP_METADATA_KEY);
        ctx.headers.remove(HOST);

        let mut upstream_req = Request::builder()
            .method(http::Method::POST)
            .uri(target)
            .body(body.boxed())
            .map_err(|err| GatewayError::Upstream(format!("build upstream request: {}", err)))?;
        *upstream_req.headers_mut() = ctx.headers;

        let client = self.transports.client(&self.detail);
        let pending = client.request(upstream_req);
        let response = match header_timeout(&self.detail) {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                GatewayError::Upstream(format!("upstream {} header timeout", endpoint))
            })?,
            None => pending.await,
        };
        let response = response
            .map_err(|err| GatewayError::Upstream(format!("upstream {}: {}", endpoint, err)))?;

        debug!(
            trace_id = %ctx.trace_id,
            service = %self.detail.info.service_name,
            upstream = %endpoint,
            "grpc stream forwarded"
        );
        Ok(response.map(|b| b.boxed()))
    }
}

/// Peer IP from a `host:port` string: everything before the last colon.
pub fn peer_ip(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(pos) => &addr[..pos],
        None => addr,
    }
}

/// Rejections become trailers-only gRPC responses: HTTP 200 with the
/// status pair in the headers and an empty body.
fn reject_grpc(err: &GatewayError) -> Response<ProxyBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert(
        "grpc-status",
        HeaderValue::from_str(&err.grpc_status().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("2")),
    );
    if let Ok(message) = HeaderValue::from_str(&percent_encode_message(&err.to_string())) {
        headers.insert("grpc-message", message);
    }
    response
}

/// grpc-message is percent-encoded UTF-8 per the gRPC HTTP/2 spec.
fn percent_encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &byte in message.as_bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
