use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::model::{App, LoadType, RuleType, ServiceDetail};

/// Boundary to the control plane. Implementations re-read whatever backs
/// them (file, database) on every call; the snapshot decides when to ask.
pub trait ConfigStore: Send + Sync {
    fn load_services(&self) -> anyhow::Result<Vec<ServiceDetail>>;
    fn load_apps(&self) -> anyhow::Result<Vec<App>>;
}

type ServiceMap = HashMap<String, Arc<ServiceDetail>>;
type AppMap = HashMap<String, Arc<App>>;

/// Process-wide read-mostly cache of service and app records.
///
/// Writers rebuild a whole map and swap the `Arc` under the write lock;
/// readers clone the `Arc` once and use it lock-free for the rest of the
/// request.
pub struct ConfigSnapshot {
    store: Arc<dyn ConfigStore>,
    services: RwLock<Arc<ServiceMap>>,
    apps: RwLock<Arc<AppMap>>,
}

impl ConfigSnapshot {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            services: RwLock::new(Arc::new(HashMap::new())),
            apps: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Initial scan at startup.
    pub fn load_once(&self) -> anyhow::Result<()> {
        self.reload()
    }

    /// Re-read the store and atomically publish fresh maps.
    pub fn reload(&self) -> anyhow::Result<()> {
        let mut services: ServiceMap = HashMap::new();
        for detail in self.store.load_services()? {
            let name = detail.info.service_name.clone();
            if services.insert(name.clone(), Arc::new(detail)).is_some() {
                warn!(service = %name, "duplicate service_name, last definition wins");
            }
        }

        let mut apps: AppMap = HashMap::new();
        for app in self.store.load_apps()? {
            let id = app.app_id.clone();
            if apps.insert(id.clone(), Arc::new(app)).is_some() {
                warn!(app_id = %id, "duplicate app_id, last definition wins");
            }
        }

        info!(services = services.len(), apps = apps.len(), "config snapshot published");
        *self.services.write() = Arc::new(services);
        *self.apps.write() = Arc::new(apps);
        Ok(())
    }

    pub fn services(&self) -> Arc<ServiceMap> {
        self.services.read().clone()
    }

    pub fn apps(&self) -> Arc<AppMap> {
        self.apps.read().clone()
    }

    pub fn app(&self, app_id: &str) -> Option<Arc<App>> {
        self.apps.read().get(app_id).cloned()
    }

    /// Resolve an inbound HTTP request to a service.
    ///
    /// Domain rules are matched against the request `Host` verbatim and win
    /// over prefix rules; among prefix matches the longest rule wins, ties
    /// broken by service name so resolution is deterministic.
    pub fn http_access_mode(
        &self,
        host: &str,
        path: &str,
    ) -> Result<Arc<ServiceDetail>, GatewayError> {
        let services = self.services();
        let mut prefix_match: Option<&Arc<ServiceDetail>> = None;

        for detail in services.values() {
            if detail.info.load_type != LoadType::Http {
                continue;
            }
            match detail.http_rule.rule_type {
                RuleType::Domain => {
                    if detail.http_rule.rule == host {
                        return Ok(detail.clone());
                    }
                }
                RuleType::PrefixUrl => {
                    if !detail.http_rule.rule.is_empty()
                        && path.starts_with(&detail.http_rule.rule)
                    {
                        let better = match prefix_match {
                            None => true,
                            Some(cur) => {
                                let (cl, nl) =
                                    (cur.http_rule.rule.len(), detail.http_rule.rule.len());
                                nl > cl
                                    || (nl == cl
                                        && detail.info.service_name < cur.info.service_name)
                            }
                        };
                        if better {
                            prefix_match = Some(detail);
                        }
                    }
                }
            }
        }

        prefix_match
            .cloned()
            .ok_or_else(|| GatewayError::ServiceNotFound("not matched service".into()))
    }

    fn service_by_port(&self, load_type: LoadType, port: u16) -> Option<Arc<ServiceDetail>> {
        self.services()
            .values()
            .find(|d| {
                d.info.load_type == load_type
                    && match load_type {
                        LoadType::Tcp => d.tcp_rule.port == port,
                        LoadType::Grpc => d.grpc_rule.port == port,
                        LoadType::Http => false,
                    }
            })
            .cloned()
    }

    pub fn tcp_service(&self, port: u16) -> Option<Arc<ServiceDetail>> {
        self.service_by_port(LoadType::Tcp, port)
    }

    pub fn grpc_service(&self, port: u16) -> Option<Arc<ServiceDetail>> {
        self.service_by_port(LoadType::Grpc, port)
    }

    fn services_of(&self, load_type: LoadType) -> Vec<Arc<ServiceDetail>> {
        self.services()
            .values()
            .filter(|d| d.info.load_type == load_type)
            .cloned()
            .collect()
    }

    /// TCP-typed services, one listener each.
    pub fn tcp_services(&self) -> Vec<Arc<ServiceDetail>> {
        self.services_of(LoadType::Tcp)
    }

    /// GRPC-typed services, one listener each.
    pub fn grpc_services(&self) -> Vec<Arc<ServiceDetail>> {
        self.services_of(LoadType::Grpc)
    }
}
