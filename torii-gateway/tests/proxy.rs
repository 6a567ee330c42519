//! Socket-level end-to-end coverage: every listener is bound on an
//! ephemeral port and exercised with real clients.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use torii_core::balance::BalancerRegistry;
use torii_core::flow::{FlowCounterRegistry, FlowLimiterRegistry};
use torii_core::jwt;
use torii_core::model::{
    AccessControl, App, GrpcRule, HttpRule, LoadBalance, LoadType, RoundType, RuleType,
    ServiceDetail, ServiceInfo, TcpRule,
};
use torii_core::transport::TransportPool;
use torii_core::{ConfigSnapshot, ConfigStore};
use torii_gateway::grpc::GrpcProxyServer;
use torii_gateway::http::HttpProxyServer;
use torii_gateway::policy::PolicyChain;
use torii_gateway::tcp::TcpProxyServer;

struct MemStore {
    services: Vec<ServiceDetail>,
    apps: Vec<App>,
}

impl ConfigStore for MemStore {
    fn load_services(&self) -> anyhow::Result<Vec<ServiceDetail>> {
        Ok(self.services.clone())
    }

    fn load_apps(&self) -> anyhow::Result<Vec<App>> {
        Ok(self.apps.clone())
    }
}

fn snapshot(services: Vec<ServiceDetail>, apps: Vec<App>) -> Arc<ConfigSnapshot> {
    let snap = ConfigSnapshot::new(Arc::new(MemStore { services, apps }));
    snap.load_once().unwrap();
    Arc::new(snap)
}

fn http_service(
    name: &str,
    rule: &str,
    strip: u8,
    round_type: RoundType,
    endpoints: &[(SocketAddr, i64)],
    access_control: AccessControl,
) -> ServiceDetail {
    let ip_list = endpoints
        .iter()
        .map(|(addr, _)| addr.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let weight_list = endpoints
        .iter()
        .map(|(_, weight)| weight.to_string())
        .collect::<Vec<_>>()
        .join(",");
    ServiceDetail {
        info: ServiceInfo {
            load_type: LoadType::Http,
            service_name: name.into(),
            ..Default::default()
        },
        http_rule: HttpRule {
            rule_type: RuleType::PrefixUrl,
            rule: rule.into(),
            need_strip_uri: strip,
            ..Default::default()
        },
        access_control,
        load_balance: LoadBalance {
            round_type,
            ip_list,
            weight_list,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Gateway {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_http_gateway(services: Vec<ServiceDetail>, apps: Vec<App>) -> Gateway {
    let snap = snapshot(services, apps);
    let counters = Arc::new(FlowCounterRegistry::new());
    let limiters = Arc::new(FlowLimiterRegistry::new());
    let chain = PolicyChain::http(snap.clone(), counters, limiters);
    let (tx, rx) = watch::channel(false);
    let server = Arc::new(HttpProxyServer::new(
        snap,
        chain,
        Arc::new(BalancerRegistry::new()),
        Arc::new(TransportPool::http()),
        rx,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener, None));
    Gateway {
        addr,
        _shutdown: tx,
    }
}

/// Plain upstream answering `<marker>|<path>` so tests can tell which
/// endpoint served and what path it saw.
async fn spawn_echo_upstream(marker: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let body = format!("{}|{}", marker, req.uri().path());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Upstream that records the request headers it receives.
async fn spawn_recording_upstream(seen: Arc<Mutex<Vec<HeaderMap>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(req.headers().clone());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn ping_answers_without_a_service() {
    let gateway = spawn_http_gateway(vec![], vec![]).await;
    let body = reqwest::get(format!("http://{}/ping", gateway.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("pong"));
}

#[tokio::test]
async fn unmatched_request_gets_json_404() {
    let gateway = spawn_http_gateway(vec![], vec![]).await;
    let response = reqwest::get(format!("http://{}/nowhere", gateway.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errno"], 1001);
    assert_eq!(body["data"], serde_json::Value::Null);
}

#[tokio::test]
async fn prefix_route_strips_and_splits_by_weight() {
    let a = spawn_echo_upstream("a").await;
    let b = spawn_echo_upstream("b").await;
    let service = http_service(
        "test_http_string",
        "/test_http_string",
        1,
        RoundType::WeightedRoundRobin,
        &[(a, 40), (b, 60)],
        AccessControl::default(),
    );
    let gateway = spawn_http_gateway(vec![service], vec![]).await;

    let client = reqwest::Client::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..100 {
        let body = client
            .get(format!("http://{}/test_http_string/abc", gateway.addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let (marker, path) = body.split_once('|').unwrap();
        assert_eq!(path, "/abc");
        *counts.entry(marker.to_string()).or_default() += 1;
    }
    assert_eq!(counts["a"], 40);
    assert_eq!(counts["b"], 60);
}

#[tokio::test]
async fn blacklisted_ip_is_rejected_with_403() {
    let upstream = spawn_echo_upstream("u").await;
    let app = App {
        app_id: "app_id_b".into(),
        secret: "6a1ab5b8b7f9e2b0a1d0c9e8f7a6b5c4".into(),
        ..Default::default()
    };
    let service = http_service(
        "black_svc",
        "/black_svc",
        0,
        RoundType::RoundRobin,
        &[(upstream, 1)],
        AccessControl {
            open_auth: 1,
            black_list: "1.2.3.4".into(),
            ..Default::default()
        },
    );
    let gateway = spawn_http_gateway(vec![service], vec![app.clone()]).await;
    let token = jwt::issue(&app.app_id, &app.secret, 3600).unwrap();
    let client = reqwest::Client::new();

    // the blacklist fires before authentication, token or not
    let rejected = client
        .get(format!("http://{}/black_svc/x", gateway.addr))
        .header("x-forwarded-for", "1.2.3.4")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 403);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert!(body["errmsg"].as_str().unwrap().contains("in black ip list"));

    let admitted = client
        .get(format!("http://{}/black_svc/x", gateway.addr))
        .header("x-forwarded-for", "5.6.7.8")
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(admitted.status(), 200);

    // without a token the open-auth service rejects at jwt auth instead
    let anonymous = client
        .get(format!("http://{}/black_svc/x", gateway.addr))
        .header("x-forwarded-for", "5.6.7.8")
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);
}

#[tokio::test]
async fn service_qps_limit_returns_429() {
    let upstream = spawn_echo_upstream("u").await;
    let service = http_service(
        "limited",
        "/limited",
        0,
        RoundType::RoundRobin,
        &[(upstream, 1)],
        AccessControl {
            service_flow_limit: 2,
            ..Default::default()
        },
    );
    let gateway = spawn_http_gateway(vec![service], vec![]).await;
    let client = reqwest::Client::new();

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..10 {
        let response = client
            .get(format!("http://{}/limited/x", gateway.addr))
            .send()
            .await
            .unwrap();
        match response.status().as_u16() {
            200 => ok += 1,
            429 => {
                limited += 1;
                let body: serde_json::Value = response.json().await.unwrap();
                assert!(body["errmsg"]
                    .as_str()
                    .unwrap()
                    .contains("service flow limit 2"));
            }
            other => panic!("unexpected status {}", other),
        }
    }
    // burst is 6; a little refill may sneak in while requests round-trip
    assert!(ok >= 6, "ok {}", ok);
    assert!(limited >= 1, "limited {}", limited);
}

#[tokio::test]
async fn app_daily_quota_cuts_off_the_fourth_request() {
    let upstream = spawn_echo_upstream("u").await;
    let app = App {
        app_id: "app_id_a".into(),
        secret: "449441a5a10d6e07d9c837d08f49ff2f".into(),
        qpd: 3,
        ..Default::default()
    };
    let service = http_service(
        "quota_svc",
        "/quota_svc",
        0,
        RoundType::RoundRobin,
        &[(upstream, 1)],
        AccessControl {
            open_auth: 1,
            ..Default::default()
        },
    );
    let gateway = spawn_http_gateway(vec![service], vec![app.clone()]).await;
    let token = jwt::issue(&app.app_id, &app.secret, 3600).unwrap();
    let client = reqwest::Client::new();

    for attempt in 1..=4 {
        let response = client
            .get(format!("http://{}/quota_svc/x", gateway.addr))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        if attempt <= 3 {
            assert_eq!(response.status(), 200, "attempt {}", attempt);
        } else {
            assert_eq!(response.status(), 429);
            let body: serde_json::Value = response.json().await.unwrap();
            assert!(body["errmsg"].as_str().unwrap().contains("租户日请求量限流"));
        }
    }
}

#[tokio::test]
async fn grpc_proxy_transforms_metadata_and_hides_app() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let upstream = spawn_recording_upstream(seen.clone()).await;

    let detail = Arc::new(ServiceDetail {
        info: ServiceInfo {
            load_type: LoadType::Grpc,
            service_name: "grpc_echo".into(),
            ..Default::default()
        },
        grpc_rule: GrpcRule {
            port: 0,
            header_transfor: "add x-user 1,del x-debug".into(),
        },
        load_balance: LoadBalance {
            round_type: RoundType::RoundRobin,
            ip_list: upstream.to_string(),
            ..Default::default()
        },
        ..Default::default()
    });

    let snap = snapshot(vec![detail.as_ref().clone()], vec![]);
    let counters = Arc::new(FlowCounterRegistry::new());
    let limiters = Arc::new(FlowLimiterRegistry::new());
    let chain = PolicyChain::grpc(snap, counters, limiters);
    let (tx, rx) = watch::channel(false);
    let server = Arc::new(GrpcProxyServer::new(
        detail,
        chain,
        Arc::new(BalancerRegistry::new()),
        Arc::new(TransportPool::grpc()),
        rx,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let client = reqwest::Client::builder()
        .http2_prior_knowledge()
        .build()
        .unwrap();
    let response = client
        .post(format!("http://{}/echo.Echo/Say", addr))
        .header("content-type", "application/grpc")
        .header("x-debug", "1")
        .header("app", "should-not-leak")
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let headers = seen.lock().unwrap();
    let forwarded = headers.first().expect("upstream saw the call");
    assert_eq!(forwarded.get("x-user").unwrap(), "1");
    assert!(forwarded.get("x-debug").is_none());
    assert!(forwarded.get("app").is_none());
    drop(headers);
    let _ = tx;
}

#[tokio::test]
async fn tcp_proxy_forwards_bytes_both_ways() {
    const SIZE: usize = 1024 * 1024;
    let to_upstream: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let to_client: Vec<u8> = (0..SIZE).map(|i| (i % 241) as u8).collect();

    // upstream: expect the client payload, then answer with its own
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let expected = to_upstream.clone();
    let reply = to_client.clone();
    tokio::spawn(async move {
        let (mut stream, _) = upstream_listener.accept().await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        stream.write_all(&reply).await.unwrap();
    });

    let detail = Arc::new(ServiceDetail {
        info: ServiceInfo {
            load_type: LoadType::Tcp,
            service_name: "tcp_echo".into(),
            ..Default::default()
        },
        tcp_rule: TcpRule { port: 0 },
        load_balance: LoadBalance {
            round_type: RoundType::RoundRobin,
            ip_list: upstream_addr.to_string(),
            ..Default::default()
        },
        ..Default::default()
    });

    let counters = Arc::new(FlowCounterRegistry::new());
    let limiters = Arc::new(FlowLimiterRegistry::new());
    let chain = PolicyChain::tcp(counters, limiters);
    let (tx, rx) = watch::channel(false);
    let server = Arc::new(TcpProxyServer::new(
        detail,
        chain,
        Arc::new(BalancerRegistry::new()),
        rx,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&to_upstream).await.unwrap();
    let mut received = vec![0u8; SIZE];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, to_client);
    let _ = tx;
}
