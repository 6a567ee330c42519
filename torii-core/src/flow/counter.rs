use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use dashmap::DashMap;
use tokio::task::JoinHandle;

const HOUR_SLOTS: usize = 24;

/// Wall-clock hour index since the calendar epoch, in the process timezone.
fn hour_id(t: DateTime<Local>) -> i64 {
    t.num_days_from_ce() as i64 * 24 + t.hour() as i64
}

struct HourSlot {
    /// Which wall-clock hour the slot currently holds.
    hour: AtomicI64,
    count: AtomicI64,
}

/// Request counter for one key.
///
/// `increase` is called from any request task; the hour slots are written
/// only by the registry ticker, so a slot's `(hour, count)` pair never has
/// two concurrent writers.
pub struct Counter {
    total_count: AtomicI64,
    sec_bucket: AtomicI64,
    qps: AtomicI64,
    slots: [HourSlot; HOUR_SLOTS],
}

impl Counter {
    fn new() -> Self {
        Self {
            total_count: AtomicI64::new(0),
            sec_bucket: AtomicI64::new(0),
            qps: AtomicI64::new(0),
            slots: std::array::from_fn(|_| HourSlot {
                hour: AtomicI64::new(-1),
                count: AtomicI64::new(0),
            }),
        }
    }

    /// Count one request. Never fails.
    pub fn increase(&self) {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sec_bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_count(&self) -> i64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Rate observed over the last completed second.
    pub fn qps(&self) -> i64 {
        self.qps.load(Ordering::Relaxed)
    }

    /// Drain the current second into the QPS gauge and the hour slot for
    /// `now`. Invoked at 1 Hz by the registry ticker.
    fn roll(&self, now: DateTime<Local>) {
        let delta = self.sec_bucket.swap(0, Ordering::AcqRel);
        self.qps.store(delta, Ordering::Release);

        let hour = hour_id(now);
        let slot = &self.slots[(hour % HOUR_SLOTS as i64) as usize];
        if slot.hour.swap(hour, Ordering::AcqRel) != hour {
            slot.count.store(0, Ordering::Release);
        }
        slot.count.fetch_add(delta, Ordering::AcqRel);
    }

    /// Requests rolled into the hour containing `t`, zero once the slot has
    /// been reused for a later day.
    pub fn hour_data(&self, t: DateTime<Local>) -> i64 {
        let hour = hour_id(t);
        let slot = &self.slots[(hour % HOUR_SLOTS as i64) as usize];
        if slot.hour.load(Ordering::Acquire) == hour {
            slot.count.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Requests rolled into the day containing `t` (sum of its hour slots).
    pub fn day_data(&self, t: DateTime<Local>) -> i64 {
        let day = hour_id(t) / HOUR_SLOTS as i64;
        self.slots
            .iter()
            .filter(|slot| slot.hour.load(Ordering::Acquire) / HOUR_SLOTS as i64 == day)
            .map(|slot| slot.count.load(Ordering::Acquire))
            .sum()
    }
}

/// Lazily-created counters keyed by flow key; creation is at-most-one-winner.
#[derive(Default)]
pub struct FlowCounterRegistry {
    counters: DashMap<String, Arc<Counter>>,
}

impl FlowCounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the counter for `key`.
    pub fn counter(&self, key: &str) -> Arc<Counter> {
        let entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Counter::new()));
        entry.value().clone()
    }

    fn tick_all(&self, now: DateTime<Local>) {
        for entry in self.counters.iter() {
            entry.value().roll(now);
        }
    }

    /// Single 1 Hz ticker rolling every counter. Spawn once per process.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.tick_all(Local::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_count_equals_increase_calls() {
        let registry = FlowCounterRegistry::new();
        let counter = registry.counter("flow_total");
        for _ in 0..1000 {
            counter.increase();
        }
        assert_eq!(counter.total_count(), 1000);
    }

    #[test]
    fn concurrent_increase_is_lossless() {
        let registry = Arc::new(FlowCounterRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let counter = registry.counter("flow_service_x");
                for _ in 0..500 {
                    counter.increase();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.counter("flow_service_x").total_count(), 4000);
    }

    #[test]
    fn roll_publishes_qps_and_hour_data() {
        let registry = FlowCounterRegistry::new();
        let counter = registry.counter("svc");
        let now = Local::now();

        for _ in 0..7 {
            counter.increase();
        }
        counter.roll(now);
        assert_eq!(counter.qps(), 7);
        assert_eq!(counter.hour_data(now), 7);
        assert_eq!(counter.day_data(now), 7);

        // an empty second zeroes the gauge but keeps the hour rollup
        counter.roll(now);
        assert_eq!(counter.qps(), 0);
        assert_eq!(counter.hour_data(now), 7);
    }

    #[test]
    fn same_key_returns_same_counter() {
        let registry = FlowCounterRegistry::new();
        let a = registry.counter("k");
        let b = registry.counter("k");
        a.increase();
        assert_eq!(b.total_count(), 1);
    }
}
