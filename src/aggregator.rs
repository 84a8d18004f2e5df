//! Rolling counters and bounded recent history.
//!
//! One long-lived instance is shared by every request. Counters are lock-free
//! atomics; the two rings sit behind their own short mutexes. Distinct
//! devices are estimated in fixed memory so churning ids cannot grow it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::config::AggregatorConfig;
use crate::detect::{Reason, Severity, Verdict};
use crate::ingest::{Reading, WindowState};
use crate::ledger::{Digest, Record};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total_readings: u64,
    pub total_anomalies: u64,
    pub distinct_devices: u64,
    pub records_appended: u64,
    pub scorer_degraded: u64,
    pub rejected_readings: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// One decided reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    pub power_usage: f64,
    pub is_anomaly: bool,
    pub score: Option<f64>,
    pub reason: Reason,
    pub severity: Severity,
    pub state: WindowState,
}

/// One anomaly that reached the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub recommendation: String,
    pub severity: Severity,
    pub record_index: u64,
    pub record_hash: Digest,
    pub created_at: DateTime<Utc>,
}

pub struct Aggregator {
    total_readings: AtomicU64,
    total_anomalies: AtomicU64,
    records_appended: AtomicU64,
    scorer_degraded: AtomicU64,
    rejected_readings: AtomicU64,
    devices: Mutex<DeviceCardinality>,
    distinct_peak: AtomicU64,
    history: Mutex<VecDeque<HistoryEntry>>,
    alerts: Mutex<VecDeque<Alert>>,
    history_capacity: usize,
    alerts_capacity: usize,
    started_at: DateTime<Utc>,
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            total_readings: AtomicU64::new(0),
            total_anomalies: AtomicU64::new(0),
            records_appended: AtomicU64::new(0),
            scorer_degraded: AtomicU64::new(0),
            rejected_readings: AtomicU64::new(0),
            devices: Mutex::new(DeviceCardinality::new(DEVICE_PRECISION)),
            distinct_peak: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            alerts: Mutex::new(VecDeque::with_capacity(config.alerts_capacity)),
            history_capacity: config.history_capacity.max(1),
            alerts_capacity: config.alerts_capacity.max(1),
            started_at: Utc::now(),
        }
    }

    /// Account for one decided reading.
    pub fn record_decision(&self, reading: &Reading, verdict: &Verdict) {
        self.total_readings.fetch_add(1, Ordering::Relaxed);
        if verdict.is_anomaly {
            self.total_anomalies.fetch_add(1, Ordering::Relaxed);
        }
        if verdict.is_degraded() {
            self.scorer_degraded.fetch_add(1, Ordering::Relaxed);
        }
        self.devices.lock().insert(&reading.device_id);

        let entry = HistoryEntry {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            temperature: reading.temperature,
            vibration: reading.vibration,
            power_usage: reading.power_usage,
            is_anomaly: verdict.is_anomaly,
            score: verdict.score,
            reason: verdict.reason,
            severity: verdict.severity,
            state: verdict.state,
        };
        push_bounded(&mut self.history.lock(), entry, self.history_capacity);
    }

    /// Account for an appended ledger record.
    pub fn record_append(&self, verdict: &Verdict, record: &Record) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
        let alert = Alert {
            device_id: record.device_id.clone(),
            recommendation: verdict.recommendation.clone(),
            severity: verdict.severity,
            record_index: record.index,
            record_hash: record.hash,
            created_at: record.created_at,
        };
        push_bounded(&mut self.alerts.lock(), alert, self.alerts_capacity);
    }

    pub fn record_rejected(&self) {
        self.rejected_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            total_readings: self.total_readings.load(Ordering::Relaxed),
            total_anomalies: self.total_anomalies.load(Ordering::Relaxed),
            distinct_devices: self.distinct_devices(),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            scorer_degraded: self.scorer_degraded.load(Ordering::Relaxed),
            rejected_readings: self.rejected_readings.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Never decreases, even where the estimate itself wobbles.
    fn distinct_devices(&self) -> u64 {
        let estimate = self.devices.lock().count();
        self.distinct_peak.fetch_max(estimate, Ordering::Relaxed).max(estimate)
    }

    /// Up to `k` most recent decisions, newest first.
    pub fn recent_history(&self, k: usize) -> Vec<HistoryEntry> {
        self.history.lock().iter().rev().take(k).cloned().collect()
    }

    /// Up to `k` most recent alerts, newest first.
    pub fn recent_alerts(&self, k: usize) -> Vec<Alert> {
        self.alerts.lock().iter().rev().take(k).cloned().collect()
    }
}

/// 2^14 one-byte registers.
const DEVICE_PRECISION: u8 = 14;

/// HyperLogLog estimate of how many distinct device ids were seen.
struct DeviceCardinality {
    precision: u8,
    registers: Vec<u8>,
}

impl DeviceCardinality {
    fn new(precision: u8) -> Self {
        let precision = precision.clamp(4, 18);
        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    fn insert(&mut self, device_id: &str) {
        let digest = Sha256::digest(device_id.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(first);

        let idx = (hash as usize) & (self.registers.len() - 1);
        let rest = hash >> self.precision;
        let rho = if rest == 0 {
            64 - self.precision
        } else {
            rest.leading_zeros() as u8 - self.precision + 1
        };
        self.registers[idx] = self.registers[idx].max(rho);
    }

    fn count(&self) -> u64 {
        let m = self.registers.len() as f64;
        let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
        let raw = 0.7213 / (1.0 + 1.079 / m) * m * m / sum;

        // Linear counting while registers are still sparse.
        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                return (m * (m / zeros as f64).ln()).round() as u64;
            }
        }
        raw.round() as u64
    }

    fn memory_bytes(&self) -> usize {
        self.registers.len()
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    fn verdict(device: &str, is_anomaly: bool, degraded: bool) -> Verdict {
        Verdict {
            device_id: device.into(),
            is_anomaly,
            score: if degraded { None } else { Some(0.01) },
            threshold: 0.05,
            state: WindowState::Active,
            reason: if is_anomaly { Reason::RuleTemp } else { Reason::None },
            model_unavailable: degraded,
            recommendation: "test".into(),
            severity: if is_anomaly { Severity::Critical } else { Severity::Info },
            buffer_size: 30,
            window_len: 30,
        }
    }

    fn small() -> Aggregator {
        Aggregator::new(&AggregatorConfig {
            history_capacity: 3,
            alerts_capacity: 2,
        })
    }

    #[test]
    fn test_counters() {
        let agg = small();
        agg.record_decision(&Reading::new("A", 20.0, 0.1, 0.0), &verdict("A", false, false));
        agg.record_decision(&Reading::new("A", 150.0, 0.1, 0.0), &verdict("A", true, true));
        agg.record_decision(&Reading::new("B", 20.0, 0.1, 0.0), &verdict("B", false, false));
        agg.record_rejected();

        let c = agg.counters();
        assert_eq!(c.total_readings, 3);
        assert_eq!(c.total_anomalies, 1);
        assert_eq!(c.distinct_devices, 2);
        assert_eq!(c.scorer_degraded, 1);
        assert_eq!(c.rejected_readings, 1);
        assert_eq!(c.records_appended, 0);
    }

    #[test]
    fn test_repeat_devices_count_once() {
        let agg = small();
        for _ in 0..500 {
            for id in ["A", "B", "C"] {
                agg.record_decision(&Reading::new(id, 20.0, 0.1, 0.0), &verdict(id, false, false));
            }
        }
        assert_eq!(agg.counters().distinct_devices, 3);
    }

    #[test]
    fn test_churny_device_ids_keep_fixed_memory() {
        let agg = small();
        let before = agg.devices.lock().memory_bytes();
        let mut last = 0;
        for i in 0..50_000 {
            let id = format!("churn-{i}");
            agg.record_decision(&Reading::new(id.as_str(), 20.0, 0.1, 0.0), &verdict(&id, false, false));
            if i % 5_000 == 0 {
                let seen = agg.counters().distinct_devices;
                assert!(seen >= last);
                last = seen;
            }
        }
        assert_eq!(agg.devices.lock().memory_bytes(), before);

        let seen = agg.counters().distinct_devices;
        assert!((45_000..=55_000).contains(&seen), "estimated {seen}");
        assert!(agg.recent_history(usize::MAX).len() <= 3);
    }

    #[test]
    fn test_history_ring_drops_oldest() {
        let agg = small();
        for t in [10.0, 20.0, 30.0, 40.0] {
            agg.record_decision(&Reading::new("A", t, 0.1, 0.0), &verdict("A", false, false));
        }
        let temps: Vec<f64> = agg.recent_history(10).iter().map(|h| h.temperature).collect();
        assert_eq!(temps, vec![40.0, 30.0, 20.0]);
        assert_eq!(agg.recent_history(1).len(), 1);
    }

    #[test]
    fn test_alerts_ring() {
        let agg = small();
        let ledger = Ledger::new(10);
        for i in 0..3 {
            let v = verdict("A", true, false);
            let r = ledger.append("A", &serde_json::json!({ "i": i })).unwrap();
            agg.record_append(&v, &r);
        }
        let alerts = agg.recent_alerts(10);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].record_index, 2);
        assert_eq!(alerts[1].record_index, 1);
        assert_eq!(agg.counters().records_appended, 3);
    }
}
