//! Assignment planning: splitting one test across the worker fleet.
//!
//! Eligible workers are those whose capabilities cover every required task
//! type. Concurrency and target TPS are distributed proportionally to each
//! worker's available capacity using Hamilton (largest-remainder)
//! apportionment, so the per-worker sums equal the requested totals
//! exactly for concurrency and within one unit for TPS.

use std::collections::HashSet;

use tracing::debug;

use crate::config::{TestConfig, TestMode};
use crate::error::VajraError;
use crate::registry::WorkerRecord;

/// One worker's share of a test, before it is wrapped into a wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedShare {
    pub worker_id: String,
    pub address: String,
    pub max_concurrency: u32,
    pub target_tps: f64,
}

/// Hamilton (largest-remainder) apportionment of `total` across `weights`.
///
/// Floors each proportional quota, then hands the leftover units to the
/// entries with the largest fractional parts; ties resolve by index order.
pub fn apportion(total: u64, weights: &[u64]) -> Vec<u64> {
    let weight_sum: u64 = weights.iter().sum();
    if weight_sum == 0 || weights.is_empty() {
        return vec![0; weights.len()];
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut fractions: Vec<(usize, f64)> = Vec::with_capacity(weights.len());
    let mut allocated: u64 = 0;

    for (index, weight) in weights.iter().enumerate() {
        let quota = total as f64 * *weight as f64 / weight_sum as f64;
        let base = quota.floor() as u64;
        shares.push(base);
        allocated += base;
        fractions.push((index, quota - base as f64));
    }

    let mut remainder = total - allocated;
    fractions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (index, _) in fractions {
        if remainder == 0 {
            break;
        }
        shares[index] += 1;
        remainder -= 1;
    }

    shares
}

/// Compute per-worker shares for one test config.
///
/// Fails with `CapacityExceeded` when no capable worker exists or the
/// fleet's available capacity cannot hold the requested concurrency.
pub fn plan_assignments(
    config: &TestConfig,
    required_types: &HashSet<String>,
    workers: &[WorkerRecord],
) -> Result<Vec<PlannedShare>, VajraError> {
    let eligible: Vec<&WorkerRecord> = workers
        .iter()
        .filter(|w| w.status.is_healthy())
        .filter(|w| required_types.iter().all(|t| w.capabilities.contains(t)))
        .collect();

    if eligible.is_empty() {
        return Err(VajraError::CapacityExceeded(format!(
            "no healthy worker supports task types {:?}",
            required_types
        )));
    }

    let capacities: Vec<u64> = eligible
        .iter()
        .map(|w| w.available_capacity() as u64)
        .collect();
    let total_capacity: u64 = capacities.iter().sum();

    if total_capacity < config.max_concurrency as u64 {
        return Err(VajraError::CapacityExceeded(format!(
            "fleet capacity {} cannot hold requested concurrency {}",
            total_capacity, config.max_concurrency
        )));
    }

    let concurrency_shares = apportion(config.max_concurrency as u64, &capacities);

    let tps_shares = match (config.mode, config.max_tps_limit) {
        (TestMode::RateLimited, Some(tps)) => {
            apportion(tps.floor() as u64, &capacities)
        }
        _ => vec![0; capacities.len()],
    };

    let shares: Vec<PlannedShare> = eligible
        .iter()
        .zip(concurrency_shares.iter().zip(tps_shares.iter()))
        // A worker rounded down to zero concurrency has nothing to run.
        .filter(|(_, (concurrency, _))| **concurrency > 0)
        .map(|(worker, (concurrency, tps))| PlannedShare {
            worker_id: worker.worker_id.clone(),
            address: worker.address.clone(),
            max_concurrency: *concurrency as u32,
            target_tps: *tps as f64,
        })
        .collect();

    debug!(
        workers = shares.len(),
        concurrency = config.max_concurrency,
        "Planned assignment shares"
    );

    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampStrategy, TestConfig, TestMode};
    use crate::registry::WorkerStatus;
    use std::collections::HashMap;
    use tokio::time::Instant;

    fn worker(id: &str, capacity: u32, load: u32, types: &[&str]) -> WorkerRecord {
        WorkerRecord {
            worker_id: id.to_string(),
            hostname: format!("{}-host", id),
            address: format!("10.0.0.{}:7001", id.len()),
            capabilities: types.iter().map(|s| s.to_string()).collect(),
            max_capacity: capacity,
            current_load: load,
            last_heartbeat: Instant::now(),
            status: WorkerStatus::Registered,
        }
    }

    fn config(concurrency: u32, tps: Option<f64>) -> TestConfig {
        TestConfig {
            mode: if tps.is_some() {
                TestMode::RateLimited
            } else {
                TestMode::ConcurrencyBased
            },
            starting_concurrency: 1,
            max_concurrency: concurrency,
            ramp_strategy: RampStrategy::Linear {
                duration_seconds: 0,
            },
            max_tps_limit: tps,
            test_duration_seconds: 60,
            sustain_duration_seconds: 0,
            warmup_seconds: 0,
            task_type: "sleep".to_string(),
            task_parameters: HashMap::new(),
        }
    }

    fn required() -> HashSet<String> {
        let mut set = HashSet::new();
        set.insert("sleep".to_string());
        set
    }

    #[test]
    fn apportion_sums_to_total() {
        let shares = apportion(100, &[30, 30, 40]);
        assert_eq!(shares.iter().sum::<u64>(), 100);
        assert_eq!(shares, vec![30, 30, 40]);
    }

    #[test]
    fn apportion_hands_remainders_to_largest_fractions() {
        // Quotas: 33.33.. each → one leftover unit goes to the earliest
        // index on the tie.
        let shares = apportion(100, &[1, 1, 1]);
        assert_eq!(shares.iter().sum::<u64>(), 100);
        assert_eq!(shares, vec![34, 33, 33]);
    }

    #[test]
    fn apportion_uneven_capacities() {
        // Quotas for 10 over [7,2,1]: 7.0, 2.0, 1.0 exactly.
        assert_eq!(apportion(10, &[7, 2, 1]), vec![7, 2, 1]);

        // Quotas for 10 over [5,4,2]: 4.54, 3.63, 1.81 → base 4,3,1, two
        // remainders by fraction: idx2 (.81), idx1 (.63).
        assert_eq!(apportion(10, &[5, 4, 2]), vec![4, 4, 2]);
    }

    #[test]
    fn apportion_zero_weights() {
        assert_eq!(apportion(10, &[0, 0]), vec![0, 0]);
        assert_eq!(apportion(0, &[3, 2]), vec![0, 0]);
    }

    #[test]
    fn plan_distributes_proportionally_to_available_capacity() {
        let workers = vec![
            worker("w1", 100, 0, &["sleep"]),
            worker("w2", 100, 50, &["sleep"]),
            worker("w3", 50, 0, &["sleep"]),
        ];
        // Available: 100, 50, 50 → shares of 100: 50, 25, 25.
        let shares = plan_assignments(&config(100, None), &required(), &workers).unwrap();

        let total: u32 = shares.iter().map(|s| s.max_concurrency).sum();
        assert_eq!(total, 100);
        assert_eq!(shares[0].max_concurrency, 50);
        assert_eq!(shares[1].max_concurrency, 25);
        assert_eq!(shares[2].max_concurrency, 25);
    }

    #[test]
    fn plan_distributes_tps_with_same_method() {
        let workers = vec![
            worker("w1", 200, 0, &["sleep"]),
            worker("w2", 100, 0, &["sleep"]),
        ];
        let shares = plan_assignments(&config(30, Some(300.0)), &required(), &workers).unwrap();

        let tps_total: f64 = shares.iter().map(|s| s.target_tps).sum();
        assert!((tps_total - 300.0).abs() <= shares.len() as f64);
        assert!((shares[0].target_tps - 200.0).abs() < 1.0);
        assert!((shares[1].target_tps - 100.0).abs() < 1.0);
    }

    #[test]
    fn capability_filter_excludes_incapable_workers() {
        let workers = vec![
            worker("w1", 100, 0, &["sleep"]),
            worker("w2", 100, 0, &["http_get"]),
        ];
        let shares = plan_assignments(&config(50, None), &required(), &workers).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker_id, "w1");
        assert_eq!(shares[0].max_concurrency, 50);
    }

    #[test]
    fn no_capable_worker_is_capacity_error() {
        let workers = vec![worker("w1", 100, 0, &["http_get"])];
        let err = plan_assignments(&config(10, None), &required(), &workers).unwrap_err();
        assert!(matches!(err, VajraError::CapacityExceeded(_)));
    }

    #[test]
    fn saturated_fleet_is_capacity_error() {
        let workers = vec![worker("w1", 100, 95, &["sleep"])];
        let err = plan_assignments(&config(50, None), &required(), &workers).unwrap_err();
        assert!(matches!(err, VajraError::CapacityExceeded(_)));
    }

    #[test]
    fn unhealthy_workers_are_ignored() {
        let mut sick = worker("w1", 100, 0, &["sleep"]);
        sick.status = WorkerStatus::Unhealthy;
        let workers = vec![sick, worker("w2", 100, 0, &["sleep"])];

        let shares = plan_assignments(&config(50, None), &required(), &workers).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker_id, "w2");
    }

    #[test]
    fn zero_share_workers_are_dropped() {
        // w2's capacity is so small its quota rounds to zero.
        let workers = vec![
            worker("w1", 10_000, 0, &["sleep"]),
            worker("w2", 1, 0, &["sleep"]),
        ];
        let shares = plan_assignments(&config(2, None), &required(), &workers).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker_id, "w1");
        assert_eq!(shares[0].max_concurrency, 2);
    }

    #[test]
    fn single_worker_gets_everything() {
        let workers = vec![worker("w1", 1000, 0, &["sleep"])];
        let shares = plan_assignments(&config(500, Some(100.0)), &required(), &workers).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].max_concurrency, 500);
        assert!((shares[0].target_tps - 100.0).abs() < f64::EPSILON);
    }
}
