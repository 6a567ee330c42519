//! Per-key flow accounting and rate limiting.
//!
//! Keys follow the original gateway scheme: `flow_total` for the whole
//! process, `flow_service_<name>` per service (plus `_<ip>` for client
//! limiters) and `flow_app_<app_id>` per tenant.

pub mod counter;
pub mod limiter;

pub use counter::{Counter, FlowCounterRegistry};
pub use limiter::{FlowLimiterRegistry, Limiter};

pub const FLOW_TOTAL: &str = "flow_total";
pub const FLOW_SERVICE_PREFIX: &str = "flow_service_";
pub const FLOW_APP_PREFIX: &str = "flow_app_";

/// Limiter key for one service.
pub fn service_key(service_name: &str) -> String {
    format!("{}{}", FLOW_SERVICE_PREFIX, service_name)
}

/// Limiter key for one client IP within a service.
pub fn service_client_key(service_name: &str, client_ip: &str) -> String {
    format!("{}{}_{}", FLOW_SERVICE_PREFIX, service_name, client_ip)
}

/// Counter key for one tenant.
pub fn app_key(app_id: &str) -> String {
    format!("{}{}", FLOW_APP_PREFIX, app_id)
}

/// Limiter key for one tenant's client IP.
pub fn app_client_key(app_id: &str, client_ip: &str) -> String {
    format!("{}{}_{}", FLOW_APP_PREFIX, app_id, client_ip)
}
