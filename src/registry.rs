//! Controller-side worker registry and health monitoring.
//!
//! Workers register with their capabilities and capacity, then heartbeat on
//! the interval the controller recommends. A worker that misses three
//! heartbeat intervals is marked UNHEALTHY; after six it is evicted.
//! Duplicate worker ids are rejected while the prior record is healthy —
//! an UNHEALTHY or EVICTED record may be replaced, which is how a restarted
//! worker rejoins under its old identity.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::VajraError;

/// Recommended heartbeat cadence handed to workers at registration.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Recommended metrics reporting cadence.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Missed intervals before a worker is marked UNHEALTHY.
const UNHEALTHY_AFTER_INTERVALS: u32 = 3;

/// Missed intervals before a worker is evicted outright.
const EVICT_AFTER_INTERVALS: u32 = 6;

/// Lifecycle of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Registered,
    Running,
    Unhealthy,
    Evicted,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Registered => "REGISTERED",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Unhealthy => "UNHEALTHY",
            WorkerStatus::Evicted => "EVICTED",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerStatus::Registered | WorkerStatus::Running)
    }
}

/// Everything the controller knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    /// Dialable address of the worker's gRPC service.
    pub address: String,
    pub capabilities: HashSet<String>,
    pub max_capacity: u32,
    pub current_load: u32,
    pub last_heartbeat: Instant,
    pub status: WorkerStatus,
}

impl WorkerRecord {
    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_load)
    }
}

/// What a worker is told at registration.
#[derive(Debug, Clone)]
pub struct RegistrationAccept {
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
}

/// Thread-safe worker table. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<String, WorkerRecord>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a worker. Rejected while a healthy record holds the same id.
    pub fn register(
        &self,
        worker_id: &str,
        hostname: &str,
        address: &str,
        capabilities: HashSet<String>,
        max_capacity: u32,
    ) -> Result<RegistrationAccept, VajraError> {
        let mut workers = self.workers.lock().unwrap();

        if let Some(existing) = workers.get(worker_id) {
            if existing.status.is_healthy() {
                return Err(VajraError::RegistrationRejected(format!(
                    "worker id '{}' is already registered and healthy",
                    worker_id
                )));
            }
        }

        workers.insert(
            worker_id.to_string(),
            WorkerRecord {
                worker_id: worker_id.to_string(),
                hostname: hostname.to_string(),
                address: address.to_string(),
                capabilities,
                max_capacity,
                current_load: 0,
                last_heartbeat: Instant::now(),
                status: WorkerStatus::Registered,
            },
        );

        info!(
            worker_id = worker_id,
            address = address,
            max_capacity = max_capacity,
            "Worker registered"
        );
        crate::prom::REGISTERED_WORKERS
            .set(workers.values().filter(|r| r.status.is_healthy()).count() as f64);

        Ok(RegistrationAccept {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            metrics_interval: METRICS_INTERVAL,
        })
    }

    /// Record a heartbeat; refreshes liveness and load. An UNHEALTHY worker
    /// that heartbeats again recovers; an evicted one must re-register.
    pub fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<(), VajraError> {
        let mut workers = self.workers.lock().unwrap();
        let record = workers
            .get_mut(worker_id)
            .filter(|r| r.status != WorkerStatus::Evicted)
            .ok_or_else(|| VajraError::NotFound(format!("worker '{}'", worker_id)))?;

        record.last_heartbeat = Instant::now();
        record.current_load = current_load;
        if record.status == WorkerStatus::Unhealthy {
            info!(worker_id = worker_id, "Worker recovered");
            record.status = if current_load > 0 {
                WorkerStatus::Running
            } else {
                WorkerStatus::Registered
            };
        } else if current_load > 0 {
            record.status = WorkerStatus::Running;
        } else if record.status == WorkerStatus::Running {
            record.status = WorkerStatus::Registered;
        }
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.lock().unwrap().get(worker_id).cloned()
    }

    pub fn list(&self) -> Vec<WorkerRecord> {
        let workers = self.workers.lock().unwrap();
        let mut records: Vec<WorkerRecord> = workers.values().cloned().collect();
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        records
    }

    /// Workers currently eligible for assignments.
    pub fn healthy_workers(&self) -> Vec<WorkerRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.status.is_healthy())
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status.is_healthy())
            .count()
    }

    /// Sweep for missed heartbeats. Returns the ids that transitioned to
    /// UNHEALTHY and those evicted in this pass.
    pub fn check_health(&self) -> (Vec<String>, Vec<String>) {
        let now = Instant::now();
        let unhealthy_after = HEARTBEAT_INTERVAL * UNHEALTHY_AFTER_INTERVALS;
        let evict_after = HEARTBEAT_INTERVAL * EVICT_AFTER_INTERVALS;

        let mut went_unhealthy = Vec::new();
        let mut evicted = Vec::new();

        let mut workers = self.workers.lock().unwrap();
        for record in workers.values_mut() {
            if record.status == WorkerStatus::Evicted {
                continue;
            }
            let silence = now.saturating_duration_since(record.last_heartbeat);
            if silence >= evict_after {
                warn!(
                    worker_id = %record.worker_id,
                    silence_secs = silence.as_secs(),
                    "Evicting worker after prolonged silence"
                );
                record.status = WorkerStatus::Evicted;
                evicted.push(record.worker_id.clone());
            } else if silence >= unhealthy_after && record.status.is_healthy() {
                warn!(
                    worker_id = %record.worker_id,
                    silence_secs = silence.as_secs(),
                    "Marking worker unhealthy"
                );
                record.status = WorkerStatus::Unhealthy;
                went_unhealthy.push(record.worker_id.clone());
            }
        }

        crate::prom::REGISTERED_WORKERS
            .set(workers.values().filter(|r| r.status.is_healthy()).count() as f64);

        (went_unhealthy, evicted)
    }

    /// Background sweep loop; one second resolution.
    pub fn start_monitor(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.check_health();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(types: &[&str]) -> HashSet<String> {
        types.iter().map(|s| s.to_string()).collect()
    }

    fn register(registry: &WorkerRegistry, id: &str) -> Result<RegistrationAccept, VajraError> {
        registry.register(id, "host-1", "10.0.0.1:7001", caps(&["sleep", "http_get"]), 100)
    }

    #[test]
    fn registration_returns_recommended_intervals() {
        let registry = WorkerRegistry::new();
        let accept = register(&registry, "w1").unwrap();
        assert_eq!(accept.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(accept.metrics_interval, Duration::from_secs(5));
        assert_eq!(registry.healthy_count(), 1);
    }

    #[test]
    fn duplicate_registration_rejected_while_healthy() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();
        let err = register(&registry, "w1").unwrap_err();
        assert!(matches!(err, VajraError::RegistrationRejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_record_can_be_replaced() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();

        // Silence past three intervals marks the worker unhealthy.
        tokio::time::advance(Duration::from_secs(16)).await;
        let (unhealthy, evicted) = registry.check_health();
        assert_eq!(unhealthy, vec!["w1"]);
        assert!(evicted.is_empty());

        // Now re-registration succeeds.
        register(&registry, "w1").unwrap();
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn prolonged_silence_evicts() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let (_, evicted) = registry.check_health();
        assert_eq!(evicted, vec!["w1"]);
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Evicted);
        assert_eq!(registry.healthy_count(), 0);

        // Evicted ids are free for re-registration.
        register(&registry, "w1").unwrap();
        assert_eq!(registry.healthy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_worker_healthy() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(5)).await;
            registry.heartbeat("w1", 10).unwrap();
            let (unhealthy, evicted) = registry.check_health();
            assert!(unhealthy.is_empty());
            assert!(evicted.is_empty());
        }

        let record = registry.get("w1").unwrap();
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.current_load, 10);
        assert_eq!(record.available_capacity(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_recovers_unhealthy_worker() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        registry.check_health();
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Unhealthy);

        registry.heartbeat("w1", 0).unwrap();
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Registered);
    }

    #[test]
    fn heartbeat_from_unknown_worker_errors() {
        let registry = WorkerRegistry::new();
        let err = registry.heartbeat("ghost", 0).unwrap_err();
        assert!(matches!(err, VajraError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_worker_heartbeat_rejected() {
        let registry = WorkerRegistry::new();
        register(&registry, "w1").unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        registry.check_health();

        assert!(registry.heartbeat("w1", 0).is_err());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let registry = WorkerRegistry::new();
        register(&registry, "w2").unwrap();
        register(&registry, "w1").unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|r| r.worker_id).collect();
        assert_eq!(ids, vec!["w1", "w2"]);
    }
}
