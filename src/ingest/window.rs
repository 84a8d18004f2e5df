//! Per-device sliding windows.
//!
//! Each device owns an independently locked slot in a shared map. The map
//! lock is only held for lookup, creation and eviction; sample pushes take
//! the device's own mutex, so unrelated devices never wait on each other.
//! Lock order is always map → slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WindowConfig;
use crate::error::ValidationError;
use crate::ingest::{FeatureSet, MinMaxScaler, NormalizedSample, Reading};

/// Whether a window has enough samples to be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    ColdStart,
    Active,
}

/// Value copy of one device's window at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub device_id: String,
    pub samples: Vec<NormalizedSample>,
    /// Window length `N`.
    pub capacity: usize,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn state(&self) -> WindowState {
        if self.is_full() {
            WindowState::Active
        } else {
            WindowState::ColdStart
        }
    }

    /// Row-major `[N][F]` sequence for the scorer.
    pub fn sequence(&self) -> Vec<Vec<f64>> {
        self.samples.iter().map(|s| s.values().to_vec()).collect()
    }
}

struct DeviceWindow {
    samples: VecDeque<NormalizedSample>,
    /// Set under this lock when the slot leaves the map; writers holding a
    /// stale `Arc` must look the device up again.
    evicted: bool,
    activated: bool,
}

struct WindowSlot {
    window: Mutex<DeviceWindow>,
    /// Logical clock value of the last push (LRU order).
    touched: AtomicU64,
    /// Milliseconds since the manager epoch of the last push (idle TTL).
    last_seen_ms: AtomicU64,
}

/// Owns every device window and the shared scaler.
pub struct WindowManager {
    length: usize,
    features: FeatureSet,
    max_devices: usize,
    scaler: Arc<MinMaxScaler>,
    slots: RwLock<HashMap<String, Arc<WindowSlot>>>,
    clock: AtomicU64,
    epoch: Instant,
    evictions: AtomicU64,
}

impl WindowManager {
    pub fn new(config: &WindowConfig, scaler: Arc<MinMaxScaler>) -> Self {
        Self {
            length: config.length.max(1),
            features: config.features,
            max_devices: config.max_devices.max(1),
            scaler,
            slots: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            evictions: AtomicU64::new(0),
        }
    }

    /// Window length `N`.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Feature count `F`.
    pub fn feature_count(&self) -> usize {
        self.features.count()
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// Validate, scale and push one reading into its device window.
    ///
    /// Returns a value snapshot and whether the window is full. Invalid
    /// readings are rejected before any state is touched.
    pub fn ingest(&self, reading: &Reading) -> Result<(WindowSnapshot, bool), ValidationError> {
        reading.validate()?;
        let sample = self.scaler.transform(&reading.features(self.features))?;

        loop {
            let slot = self.slot_for(&reading.device_id);
            let mut window = slot.window.lock();
            if window.evicted {
                continue;
            }

            if window.samples.len() == self.length {
                window.samples.pop_front();
            }
            window.samples.push_back(sample);

            slot.touched
                .store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
            slot.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);

            let ready = window.samples.len() == self.length;
            if ready && !window.activated {
                window.activated = true;
                debug!(device_id = %reading.device_id, length = self.length, "window active");
            }

            let snapshot = WindowSnapshot {
                device_id: reading.device_id.clone(),
                samples: window.samples.iter().cloned().collect(),
                capacity: self.length,
            };
            return Ok((snapshot, ready));
        }
    }

    /// Current sample count for a device, if it is tracked.
    pub fn window_len(&self, device_id: &str) -> Option<usize> {
        let slot = self.slots.read().get(device_id).cloned()?;
        let len = slot.window.lock().samples.len();
        Some(len)
    }

    pub fn device_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Total windows dropped by either eviction policy.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop every device that has not pushed a sample within `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let mut slots = self.slots.write();
        let idle: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| now.saturating_sub(slot.last_seen_ms.load(Ordering::Relaxed)) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            if let Some(slot) = slots.remove(id) {
                slot.window.lock().evicted = true;
            }
        }
        if !idle.is_empty() {
            self.evictions.fetch_add(idle.len() as u64, Ordering::Relaxed);
            info!(evicted = idle.len(), remaining = slots.len(), "evicted idle device windows");
        }
        idle.len()
    }

    fn slot_for(&self, device_id: &str) -> Arc<WindowSlot> {
        if let Some(slot) = self.slots.read().get(device_id) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(device_id) {
            return Arc::clone(slot);
        }

        if slots.len() >= self.max_devices {
            let victim = slots
                .iter()
                .min_by_key(|(_, slot)| slot.touched.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone());
            if let Some(victim) = victim {
                if let Some(slot) = slots.remove(&victim) {
                    slot.window.lock().evicted = true;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(device_id = %victim, max_devices = self.max_devices, "evicted least recently seen window");
                }
            }
        }

        let slot = Arc::new(WindowSlot {
            window: Mutex::new(DeviceWindow {
                samples: VecDeque::with_capacity(self.length),
                evicted: false,
                activated: false,
            }),
            touched: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed) + 1),
            last_seen_ms: AtomicU64::new(self.now_ms()),
        });
        slots.insert(device_id.to_string(), Arc::clone(&slot));
        debug!(device_id, devices = slots.len(), "created device window");
        slot
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(length: usize, max_devices: usize) -> WindowManager {
        let config = WindowConfig {
            length,
            max_devices,
            ..WindowConfig::default()
        };
        let scaler = MinMaxScaler::default_for(FeatureSet::TemperatureVibration);
        WindowManager::new(&config, Arc::new(scaler))
    }

    fn reading(device: &str, temperature: f64) -> Reading {
        Reading::new(device, temperature, 0.5, 30.0)
    }

    #[test]
    fn test_cold_start_then_active() {
        let wm = manager(5, 10);
        for i in 0..4 {
            let (snap, ready) = wm.ingest(&reading("D1", 25.0)).unwrap();
            assert!(!ready);
            assert_eq!(snap.len(), i + 1);
            assert_eq!(snap.state(), WindowState::ColdStart);
        }
        let (snap, ready) = wm.ingest(&reading("D1", 25.0)).unwrap();
        assert!(ready);
        assert_eq!(snap.state(), WindowState::Active);
    }

    #[test]
    fn test_window_never_exceeds_length_and_never_reverts() {
        let wm = manager(3, 10);
        let mut seen_active = false;
        for i in 0..20 {
            let (snap, ready) = wm.ingest(&reading("D1", 20.0 + i as f64)).unwrap();
            assert!(snap.len() <= 3);
            if seen_active {
                assert!(ready, "window reverted to cold start");
            }
            seen_active |= ready;
        }
        assert_eq!(wm.window_len("D1"), Some(3));
    }

    #[test]
    fn test_fifo_evicts_oldest() {
        let wm = manager(3, 10);
        for t in [20.0, 30.0, 40.0, 50.0] {
            wm.ingest(&reading("D1", t)).unwrap();
        }
        let (snap, _) = wm.ingest(&reading("D1", 60.0)).unwrap();
        let temps: Vec<f64> = snap.samples.iter().map(|s| s.values()[0]).collect();
        // 40, 50, 60 scaled against [20, 60].
        assert_eq!(temps, vec![0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let wm = manager(3, 10);
        let (first, _) = wm.ingest(&reading("D1", 20.0)).unwrap();
        wm.ingest(&reading("D1", 60.0)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.samples[0].values()[0], 0.0);
    }

    #[test]
    fn test_devices_are_independent() {
        let wm = manager(2, 10);
        wm.ingest(&reading("A", 25.0)).unwrap();
        wm.ingest(&reading("A", 25.0)).unwrap();
        let (snap, ready) = wm.ingest(&reading("B", 25.0)).unwrap();
        assert!(!ready);
        assert_eq!(snap.len(), 1);
        assert_eq!(wm.device_count(), 2);
    }

    #[test]
    fn test_invalid_reading_is_not_buffered() {
        let wm = manager(3, 10);
        wm.ingest(&reading("D1", 25.0)).unwrap();
        let bad = Reading::new("D1", f64::NAN, 0.5, 30.0);
        assert!(wm.ingest(&bad).is_err());
        assert_eq!(wm.window_len("D1"), Some(1));

        let unknown_bad = Reading::new("D2", 25.0, f64::INFINITY, 0.0);
        assert!(wm.ingest(&unknown_bad).is_err());
        assert_eq!(wm.window_len("D2"), None);
    }

    #[test]
    fn test_lru_eviction_bounds_device_count() {
        let wm = manager(3, 2);
        wm.ingest(&reading("D1", 25.0)).unwrap();
        wm.ingest(&reading("D2", 25.0)).unwrap();
        // Touch D1 so D2 becomes least recently seen.
        wm.ingest(&reading("D1", 25.0)).unwrap();
        wm.ingest(&reading("D3", 25.0)).unwrap();

        assert_eq!(wm.device_count(), 2);
        assert_eq!(wm.window_len("D1"), Some(2));
        assert_eq!(wm.window_len("D2"), None);
        assert_eq!(wm.window_len("D3"), Some(1));
        assert_eq!(wm.evictions(), 1);
    }

    #[test]
    fn test_churny_device_ids_stay_bounded() {
        let wm = manager(3, 16);
        for i in 0..1_000 {
            wm.ingest(&reading(&format!("churn-{i}"), 25.0)).unwrap();
        }
        assert_eq!(wm.device_count(), 16);
        assert_eq!(wm.evictions(), 1_000 - 16);
    }

    #[test]
    fn test_evicted_device_restarts_cold() {
        let wm = manager(2, 1);
        wm.ingest(&reading("D1", 25.0)).unwrap();
        wm.ingest(&reading("D1", 25.0)).unwrap();
        wm.ingest(&reading("D2", 25.0)).unwrap();
        let (snap, ready) = wm.ingest(&reading("D1", 25.0)).unwrap();
        assert!(!ready);
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_idle_eviction() {
        let wm = manager(3, 10);
        wm.ingest(&reading("stale", 25.0)).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        wm.ingest(&reading("fresh", 25.0)).unwrap();

        let evicted = wm.evict_idle(Duration::from_millis(40));
        assert_eq!(evicted, 1);
        assert_eq!(wm.window_len("stale"), None);
        assert_eq!(wm.window_len("fresh"), Some(1));
    }

    #[test]
    fn test_concurrent_ingest_same_device_loses_nothing() {
        let wm = Arc::new(manager(1_000, 10));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let wm = Arc::clone(&wm);
                s.spawn(move || {
                    for _ in 0..50 {
                        wm.ingest(&reading("shared", 25.0)).unwrap();
                    }
                });
            }
        });
        assert_eq!(wm.window_len("shared"), Some(400));
    }
}
