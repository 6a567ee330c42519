//! The admission pipeline. Every inbound request is reduced to a
//! `RequestContext`, then run through a fixed, protocol-specific chain of
//! policies. A policy admits, rejects (aborting the chain), or mutates the
//! request state.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::HeaderMap;
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use torii_core::flow::{
    self, FlowCounterRegistry, FlowLimiterRegistry, FLOW_TOTAL,
};
use torii_core::jwt;
use torii_core::model::{csv_items, App, RuleType, ServiceDetail};
use torii_core::{ConfigSnapshot, GatewayError};

/// Which header-transform rule set a chain applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformScope {
    Http,
    Grpc,
}

/// Per-request state threaded through the chain. The service snapshot is
/// pinned for the whole request; policies fill in the rest.
pub struct RequestContext {
    pub trace_id: Uuid,
    pub client_ip: String,
    pub service: Arc<ServiceDetail>,
    pub app: Option<Arc<App>>,
    /// Request headers (HTTP) or metadata (gRPC); mutated by transforms.
    pub headers: HeaderMap,
    /// Request path; mutated by rewrite and strip. Empty for TCP.
    pub path: String,
}

impl RequestContext {
    pub fn new(service: Arc<ServiceDetail>, client_ip: String) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            client_ip,
            service,
            app: None,
            headers: HeaderMap::new(),
            path: String::new(),
        }
    }
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError>;
}

/// With open auth and a non-empty whitelist, the client IP must be listed.
struct WhiteList;

impl Policy for WhiteList {
    fn name(&self) -> &'static str {
        "white_list"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let ac = &ctx.service.access_control;
        if ac.open_auth != 1 {
            return Ok(());
        }
        let allowed = csv_items(&ac.white_list);
        if !allowed.is_empty() && !allowed.contains(&ctx.client_ip.as_str()) {
            return Err(GatewayError::AccessDenied(format!(
                "{} not in white ip list",
                ctx.client_ip
            )));
        }
        Ok(())
    }
}

/// Blacklist applies only when no whitelist is configured.
struct BlackList;

impl Policy for BlackList {
    fn name(&self) -> &'static str {
        "black_list"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let ac = &ctx.service.access_control;
        if ac.open_auth != 1 || !csv_items(&ac.white_list).is_empty() {
            return Ok(());
        }
        if csv_items(&ac.black_list).contains(&ctx.client_ip.as_str()) {
            return Err(GatewayError::AccessDenied(format!(
                "{} in black ip list",
                ctx.client_ip
            )));
        }
        Ok(())
    }
}

/// Counts every admitted-so-far request globally and per service.
struct FlowCount {
    counters: Arc<FlowCounterRegistry>,
}

impl Policy for FlowCount {
    fn name(&self) -> &'static str {
        "flow_count"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        self.counters.counter(FLOW_TOTAL).increase();
        self.counters
            .counter(&flow::service_key(&ctx.service.info.service_name))
            .increase();
        Ok(())
    }
}

/// Service-level and per-client-IP QPS limits.
struct FlowLimit {
    limiters: Arc<FlowLimiterRegistry>,
}

impl Policy for FlowLimit {
    fn name(&self) -> &'static str {
        "flow_limit"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let ac = &ctx.service.access_control;
        let name = &ctx.service.info.service_name;

        if ac.service_flow_limit != 0 {
            let limiter = self
                .limiters
                .limiter(&flow::service_key(name), ac.service_flow_limit as f64);
            if !limiter.allow() {
                return Err(GatewayError::RateLimited(format!(
                    "service flow limit {}",
                    ac.service_flow_limit
                )));
            }
        }

        if ac.client_ip_flow_limit > 0 {
            let limiter = self.limiters.limiter(
                &flow::service_client_key(name, &ctx.client_ip),
                ac.client_ip_flow_limit as f64,
            );
            if !limiter.allow() {
                return Err(GatewayError::RateLimited(format!(
                    "{} flow limit {}",
                    ctx.client_ip, ac.client_ip_flow_limit
                )));
            }
        }
        Ok(())
    }
}

/// Resolves a Bearer token to an app: the unverified issuer names the app,
/// whose secret must then verify the signature. Services with open auth
/// reject requests that end up without an app.
struct JwtAuth {
    snapshot: Arc<ConfigSnapshot>,
}

impl Policy for JwtAuth {
    fn name(&self) -> &'static str {
        "jwt_auth"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let token = ctx
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(jwt::bearer_token)
            .unwrap_or("");

        if !token.is_empty() {
            let issuer = jwt::peek_issuer(token)?;
            if let Some(app) = self.snapshot.app(&issuer) {
                jwt::verify(token, &app.secret)?;
                ctx.app = Some(app);
            }
        }

        if ctx.service.access_control.open_auth == 1 && ctx.app.is_none() {
            return Err(GatewayError::AuthFailed("not match valid app".into()));
        }
        Ok(())
    }
}

/// Tenant flow accounting plus the daily quota gate.
struct JwtFlowCount {
    counters: Arc<FlowCounterRegistry>,
}

impl Policy for JwtFlowCount {
    fn name(&self) -> &'static str {
        "jwt_flow_count"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(app) = &ctx.app else {
            return Ok(());
        };
        let counter = self.counters.counter(&flow::app_key(&app.app_id));
        counter.increase();
        let current = counter.total_count();
        if app.qpd > 0 && current > app.qpd {
            return Err(GatewayError::QuotaExceeded(format!(
                "租户日请求量限流 limit:{} current:{}",
                app.qpd, current
            )));
        }
        Ok(())
    }
}

/// Tenant QPS limit, keyed by app and client IP.
struct JwtFlowLimit {
    limiters: Arc<FlowLimiterRegistry>,
}

impl Policy for JwtFlowLimit {
    fn name(&self) -> &'static str {
        "jwt_flow_limit"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(app) = &ctx.app else {
            return Ok(());
        };
        if app.qps > 0 {
            let limiter = self.limiters.limiter(
                &flow::app_client_key(&app.app_id, &ctx.client_ip),
                app.qps as f64,
            );
            if !limiter.allow() {
                return Err(GatewayError::RateLimited(format!(
                    "{} flow limit {}",
                    ctx.client_ip, app.qps
                )));
            }
        }
        Ok(())
    }
}

/// Applies the service's `header_transfor` rules: `add`/`edit` set,
/// `del` removes. Malformed entries are skipped.
struct HeaderTransform {
    scope: TransformScope,
}

impl Policy for HeaderTransform {
    fn name(&self) -> &'static str {
        "header_transform"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let rules = match self.scope {
            TransformScope::Http => &ctx.service.http_rule.header_transfor,
            TransformScope::Grpc => &ctx.service.grpc_rule.header_transfor,
        };
        transform_headers(rules, &mut ctx.headers);
        Ok(())
    }
}

pub(crate) fn transform_headers(rules: &str, headers: &mut HeaderMap) {
    for item in rules.split(',') {
        let tokens: Vec<&str> = item.trim().split(' ').collect();
        if tokens.len() < 2 || tokens.len() > 3 {
            continue; // malformed, skip
        }
        let op = tokens[0];
        if (op == "add" || op == "edit") && tokens.len() == 3 {
            match (
                HeaderName::from_bytes(tokens[1].as_bytes()),
                HeaderValue::from_str(tokens[2]),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(rule = item, "skipping unusable header rule"),
            }
        } else if op == "del" {
            if let Ok(name) = HeaderName::from_bytes(tokens[1].as_bytes()) {
                headers.remove(name);
            }
        }
    }
}

/// Applies `url_rewrite` regex rules to the path, in order.
struct UrlRewrite;

impl Policy for UrlRewrite {
    fn name(&self) -> &'static str {
        "url_rewrite"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        ctx.path = rewrite_path(&ctx.service.http_rule.url_rewrite, &ctx.path);
        Ok(())
    }
}

pub(crate) fn rewrite_path(rules: &str, path: &str) -> String {
    let mut path = path.to_string();
    for item in rules.split(',') {
        let tokens: Vec<&str> = item.trim().split(' ').collect();
        if tokens.len() != 2 {
            continue;
        }
        let Ok(re) = Regex::new(tokens[0]) else {
            continue; // invalid regex, skip
        };
        path = re.replace_all(&path, tokens[1]).into_owned();
    }
    path
}

/// Removes the matched prefix from the path when the rule asks for it.
struct StripUri;

impl Policy for StripUri {
    fn name(&self) -> &'static str {
        "strip_uri"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let rule = &ctx.service.http_rule;
        if rule.rule_type == RuleType::PrefixUrl && rule.need_strip_uri == 1 {
            ctx.path = ctx.path.replacen(&rule.rule, "", 1);
        }
        Ok(())
    }
}

/// Fixed ordered pipeline, one instance per protocol listener.
pub struct PolicyChain {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicyChain {
    pub fn http(
        snapshot: Arc<ConfigSnapshot>,
        counters: Arc<FlowCounterRegistry>,
        limiters: Arc<FlowLimiterRegistry>,
    ) -> Self {
        Self {
            policies: vec![
                Box::new(WhiteList),
                Box::new(BlackList),
                Box::new(FlowCount { counters: counters.clone() }),
                Box::new(FlowLimit { limiters: limiters.clone() }),
                Box::new(JwtAuth { snapshot }),
                Box::new(JwtFlowCount { counters }),
                Box::new(JwtFlowLimit { limiters }),
                Box::new(HeaderTransform { scope: TransformScope::Http }),
                Box::new(UrlRewrite),
                Box::new(StripUri),
            ],
        }
    }

    pub fn grpc(
        snapshot: Arc<ConfigSnapshot>,
        counters: Arc<FlowCounterRegistry>,
        limiters: Arc<FlowLimiterRegistry>,
    ) -> Self {
        Self {
            policies: vec![
                Box::new(WhiteList),
                Box::new(BlackList),
                Box::new(FlowCount { counters: counters.clone() }),
                Box::new(FlowLimit { limiters: limiters.clone() }),
                Box::new(JwtAuth { snapshot }),
                Box::new(JwtFlowCount { counters }),
                Box::new(JwtFlowLimit { limiters }),
                Box::new(HeaderTransform { scope: TransformScope::Grpc }),
            ],
        }
    }

    /// Raw TCP carries no credentials: access control and service-level
    /// limits only.
    pub fn tcp(
        counters: Arc<FlowCounterRegistry>,
        limiters: Arc<FlowLimiterRegistry>,
    ) -> Self {
        Self {
            policies: vec![
                Box::new(WhiteList),
                Box::new(BlackList),
                Box::new(FlowCount { counters }),
                Box::new(FlowLimit { limiters }),
            ],
        }
    }

    /// Run every policy in order; the first rejection wins.
    pub fn admit(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        for policy in &self.policies {
            if let Err(err) = policy.apply(ctx) {
                debug!(
                    policy = policy.name(),
                    trace_id = %ctx.trace_id,
                    service = %ctx.service.info.service_name,
                    client_ip = %ctx.client_ip,
                    %err,
                    "request rejected"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Client IP as the access policies see it: forwarded headers first, then
/// the socket peer.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return real.to_string();
    }
    remote.ip().to_string()
}
