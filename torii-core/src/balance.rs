use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::error::GatewayError;
use crate::model::{csv_items, RoundType, ServiceDetail};

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: String,
    pub weight: i64,
}

/// Smooth WRR working set; indices match `LoadBalancer::endpoints`.
#[derive(Debug)]
struct WrrState {
    current: Vec<i64>,
    effective: Vec<i64>,
}

/// Endpoint picker for one service. Forbidden endpoints are dropped at
/// build time; strategy state (RR cursor, WRR weights) lives behind
/// atomics/a lock so `get` takes `&self`.
#[derive(Debug)]
pub struct LoadBalancer {
    service_name: String,
    strategy: RoundType,
    endpoints: Vec<Endpoint>,
    rr_cursor: AtomicUsize,
    wrr: Mutex<WrrState>,
}

impl LoadBalancer {
    pub fn from_service(detail: &ServiceDetail) -> Result<Self, GatewayError> {
        let lb = &detail.load_balance;
        let ips = csv_items(&lb.ip_list);
        let weights = csv_items(&lb.weight_list);
        if !weights.is_empty() && weights.len() != ips.len() {
            return Err(GatewayError::Config(format!(
                "service {}: ip_list has {} entries but weight_list has {}",
                detail.info.service_name,
                ips.len(),
                weights.len()
            )));
        }

        let forbidden: HashSet<&str> = csv_items(&lb.forbid_list).into_iter().collect();
        let mut endpoints = Vec::with_capacity(ips.len());
        for (i, addr) in ips.iter().enumerate() {
            if forbidden.contains(addr) {
                continue;
            }
            let weight = match weights.get(i) {
                Some(w) => w.parse::<i64>().map_err(|_| {
                    GatewayError::Config(format!(
                        "service {}: bad weight {:?}",
                        detail.info.service_name, w
                    ))
                })?,
                None => 1,
            };
            endpoints.push(Endpoint {
                addr: (*addr).to_string(),
                weight: weight.max(1),
            });
        }

        let effective: Vec<i64> = endpoints.iter().map(|e| e.weight).collect();
        let current = vec![0; endpoints.len()];
        Ok(Self {
            service_name: detail.info.service_name.clone(),
            strategy: lb.round_type,
            endpoints,
            rr_cursor: AtomicUsize::new(0),
            wrr: Mutex::new(WrrState { current, effective }),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Pick one endpoint address. `key` is the client IP and only matters
    /// for IP_HASH.
    pub fn get(&self, key: &str) -> Result<String, GatewayError> {
        if self.endpoints.is_empty() {
            return Err(GatewayError::NoUpstream(format!(
                "service {} has no live upstream",
                self.service_name
            )));
        }
        let idx = match self.strategy {
            RoundType::Random => rand::rng().random_range(0..self.endpoints.len()),
            RoundType::RoundRobin => {
                self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len()
            }
            RoundType::WeightedRoundRobin => self.next_weighted(),
            RoundType::IpHash => {
                fxhash::hash64(key.as_bytes()) as usize % self.endpoints.len()
            }
        };
        Ok(self.endpoints[idx].addr.clone())
    }

    /// Smooth weighted round robin: every slot gains its effective weight,
    /// the max wins and pays back the total.
    fn next_weighted(&self) -> usize {
        let mut guard = self.wrr.lock();
        let state = &mut *guard;
        let total: i64 = state.effective.iter().sum();
        let mut best = 0;
        for i in 0..state.current.len() {
            state.current[i] += state.effective[i];
            if state.current[i] > state.current[best] {
                best = i;
            }
        }
        state.current[best] -= total;
        best
    }
}

/// Per-service balancers, lazily built from the current snapshot and
/// dropped wholesale when the snapshot changes.
#[derive(Default)]
pub struct BalancerRegistry {
    balancers: DashMap<String, Arc<LoadBalancer>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, detail: &ServiceDetail) -> Result<Arc<LoadBalancer>, GatewayError> {
        let entry = self
            .balancers
            .entry(detail.info.service_name.clone())
            .or_try_insert_with(|| LoadBalancer::from_service(detail).map(Arc::new))?;
        Ok(entry.value().clone())
    }

    /// Forget every balancer; next request rebuilds from the new snapshot.
    pub fn invalidate_all(&self) {
        self.balancers.clear();
    }
}
