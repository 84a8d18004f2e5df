//! Synthetic device fleet for demos and soak tests.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ingest::Reading;

/// A generated reading and whether an anomaly was injected into it.
#[derive(Debug, Clone)]
pub struct SimulatedReading {
    pub reading: Reading,
    pub injected: bool,
}

/// Round-robin fleet of `Device-NNN` sensors.
pub struct Fleet {
    devices: Vec<String>,
    anomaly_rate: f64,
    next: usize,
    rng: StdRng,
}

impl Fleet {
    /// `anomaly_rate` must be a probability in `[0, 1]`.
    pub fn new(device_count: usize, anomaly_rate: f64, seed: Option<u64>) -> Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&anomaly_rate),
            "anomaly rate must be between 0 and 1, got {anomaly_rate}"
        );
        let devices = (1..=device_count.max(1))
            .map(|i| format!("Device-{i:03}"))
            .collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            devices,
            anomaly_rate,
            next: 0,
            rng,
        })
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn next_reading(&mut self) -> SimulatedReading {
        let device_id = self.devices[self.next].clone();
        self.next = (self.next + 1) % self.devices.len();

        let injected = self.rng.gen_bool(self.anomaly_rate);
        let (temperature, vibration, power_usage) = if injected {
            (
                self.rng.gen_range(95.0..120.0),
                self.rng.gen_range(5.0..15.0),
                self.rng.gen_range(100.0..150.0),
            )
        } else {
            (
                self.rng.gen_range(20.0..60.0),
                self.rng.gen_range(0.1..2.0),
                self.rng.gen_range(10.0..50.0),
            )
        };

        SimulatedReading {
            reading: Reading::new(device_id, round2(temperature), round2(vibration), round2(power_usage)),
            injected,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
