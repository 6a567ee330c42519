use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::model::ServiceDetail;

/// Body type flowing through the proxies in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub type UpstreamClient = Client<HttpConnector, ProxyBody>;

/// Shared upstream clients, one per service, created on first use.
///
/// Each client owns a connection pool configured from the service's
/// `LoadBalance` timeouts, so repeated requests to the same service reuse
/// connections. The gRPC pool speaks HTTP/2 only.
pub struct TransportPool {
    http2_only: bool,
    clients: DashMap<String, UpstreamClient>,
}

impl TransportPool {
    pub fn http() -> Self {
        Self {
            http2_only: false,
            clients: DashMap::new(),
        }
    }

    pub fn grpc() -> Self {
        Self {
            http2_only: true,
            clients: DashMap::new(),
        }
    }

    pub fn client(&self, detail: &ServiceDetail) -> UpstreamClient {
        let entry = self
            .clients
            .entry(detail.info.service_name.clone())
            .or_insert_with(|| build_client(detail, self.http2_only));
        entry.value().clone()
    }

    /// Drop every pooled client; next request rebuilds from the snapshot.
    pub fn invalidate_all(&self) {
        self.clients.clear();
    }
}

fn build_client(detail: &ServiceDetail, http2_only: bool) -> UpstreamClient {
    let lb = &detail.load_balance;

    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(connect_timeout(detail));

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_timer(TokioTimer::new());
    if lb.upstream_idle_timeout > 0 {
        builder.pool_idle_timeout(Duration::from_secs(lb.upstream_idle_timeout));
    }
    if lb.upstream_max_idle > 0 {
        builder.pool_max_idle_per_host(lb.upstream_max_idle);
    }
    if http2_only {
        builder.http2_only(true);
    }
    builder.build(connector)
}

/// Upstream dial bound for a service; `None` when unconfigured.
pub fn connect_timeout(detail: &ServiceDetail) -> Option<Duration> {
    match detail.load_balance.upstream_connect_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

/// Response-header wait bound for a service; `None` when unconfigured.
pub fn header_timeout(detail: &ServiceDetail) -> Option<Duration> {
    match detail.load_balance.upstream_header_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}
