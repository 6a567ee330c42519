//! TCP proxy. One accept loop per TCP-typed service; each connection runs
//! the access-control subset of the policy chain, dials one upstream and
//! pumps bytes both ways until either side closes.
//!
//! Connection states: accepted, resolved, admitted, forwarding, closed.
//! Rejections close the client socket without writing; raw TCP has no
//! protocol message to send.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use torii_core::balance::BalancerRegistry;
use torii_core::model::ServiceDetail;
use torii_core::transport::connect_timeout;
use torii_core::GatewayError;

use crate::policy::{PolicyChain, RequestContext};

pub struct TcpProxyServer {
    detail: Arc<ServiceDetail>,
    chain: PolicyChain,
    balancers: Arc<BalancerRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl TcpProxyServer {
    pub fn new(
        detail: Arc<ServiceDetail>,
        chain: PolicyChain,
        balancers: Arc<BalancerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            detail,
            chain,
            balancers,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.detail.tcp_rule.port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, service = %self.detail.info.service_name, "tcp proxy listening");
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
                            warn!(%err, "tcp accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let conn = tokio::spawn(async move {
                        server.handle_conn(stream, remote).await;
                    });
                    // contain handler panics; the socket drops with the task
                    let peer = remote;
                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            if err.is_panic() {
                                error!(client = %peer, %err, "tcp handler panicked");
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!(service = %self.detail.info.service_name, "tcp proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_conn(&self, mut client: TcpStream, remote: SocketAddr) {
        let mut ctx = RequestContext::new(self.detail.clone(), remote.ip().to_string());
        if let Err(err) = self.chain.admit(&mut ctx) {
            debug!(client = %remote, %err, "tcp connection rejected");
            return;
        }

        let endpoint = match self
            .balancers
            .get(&self.detail)
            .and_then(|balancer| balancer.get(&ctx.client_ip))
        {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(service = %self.detail.info.service_name, %err, "no upstream for tcp connection");
                return;
            }
        };

        let mut upstream = match self.dial(&endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(upstream = %endpoint, %err, "tcp upstream dial failed");
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, to_client)) => debug!(
                trace_id = %ctx.trace_id,
                client = %remote,
                upstream = %endpoint,
                to_upstream,
                to_client,
                "tcp connection closed"
            ),
            Err(err) => debug!(client = %remote, upstream = %endpoint, %err, "tcp copy ended"),
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<TcpStream, GatewayError> {
        let pending = TcpStream::connect(endpoint);
        let connected = match connect_timeout(&self.detail) {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| GatewayError::Upstream(format!("dial {} timed out", endpoint)))?,
            None => pending.await,
        };
        connected.map_err(|err| GatewayError::Upstream(format!("dial {}: {}", endpoint, err)))
    }
}
