use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use torii_config::{load_config, FileStore};
use torii_core::balance::BalancerRegistry;
use torii_core::flow::{FlowCounterRegistry, FlowLimiterRegistry};
use torii_core::transport::TransportPool;
use torii_core::ConfigSnapshot;
use torii_gateway::grpc::GrpcProxyServer;
use torii_gateway::http::HttpProxyServer;
use torii_gateway::policy::PolicyChain;
use torii_gateway::tcp::TcpProxyServer;
use torii_gateway::tls;

#[derive(Parser, Debug)]
#[command(version, about = "torii — data-plane API gateway")]
struct Args {
    /// Path to config file (yaml/json/toml)
    #[arg(short, long, default_value = "./gateway.yaml")]
    config: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = load_config(&args.config)?;
    torii_tracing::init(&file.log)?;
    info!(config = %args.config, "torii starting");

    let snapshot = Arc::new(ConfigSnapshot::new(Arc::new(FileStore::new(&args.config))));
    snapshot.load_once().context("initial config load")?;

    let counters = Arc::new(FlowCounterRegistry::new());
    let limiters = Arc::new(FlowLimiterRegistry::new());
    let balancers = Arc::new(BalancerRegistry::new());
    let http_transports = Arc::new(TransportPool::http());
    let grpc_transports = Arc::new(TransportPool::grpc());
    let _ticker = counters.spawn_ticker();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = Arc::new(HttpProxyServer::new(
        snapshot.clone(),
        PolicyChain::http(snapshot.clone(), counters.clone(), limiters.clone()),
        balancers.clone(),
        http_transports.clone(),
        shutdown_rx.clone(),
    ));

    let plain_addr: SocketAddr = format!("{}:{}", file.listen.bind, file.listen.http_port)
        .parse()
        .context("bad http listen address")?;
    {
        let server = http_server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.run(plain_addr).await {
                error!(%err, "http listener failed");
            }
        });
    }

    if let Some(https) = &file.listen.https {
        let tls_config = tls::server_config(&https.cert_file, &https.key_file)
            .context("load tls certificate")?;
        let tls_addr: SocketAddr = format!("{}:{}", file.listen.bind, https.port)
            .parse()
            .context("bad https listen address")?;
        let server = http_server.clone();
        tokio::spawn(async move {
            if let Err(err) = server.run_tls(tls_addr, tls_config).await {
                error!(%err, "https listener failed");
            }
        });
    }

    for detail in snapshot.tcp_services() {
        let server = Arc::new(TcpProxyServer::new(
            detail,
            PolicyChain::tcp(counters.clone(), limiters.clone()),
            balancers.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(%err, "tcp listener failed");
            }
        });
    }

    for detail in snapshot.grpc_services() {
        let server = Arc::new(GrpcProxyServer::new(
            detail,
            PolicyChain::grpc(snapshot.clone(), counters.clone(), limiters.clone()),
            balancers.clone(),
            grpc_transports.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(%err, "grpc listener failed");
            }
        });
    }

    #[cfg(unix)]
    {
        let snapshot = snapshot.clone();
        let balancers = balancers.clone();
        let http_transports = http_transports.clone();
        let grpc_transports = grpc_transports.clone();
        tokio::spawn(async move {
            let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "sighup handler unavailable");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                match snapshot.reload() {
                    Ok(()) => {
                        balancers.invalidate_all();
                        http_transports.invalidate_all();
                        grpc_transports.invalidate_all();
                        info!("config reloaded");
                    }
                    Err(err) => warn!(%err, "config reload failed, keeping previous snapshot"),
                }
            }
        });
    }

    signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    // accept loops observe the signal; in-flight connections finish under
    // their own deadlines
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
