//! Simulated anemometer: bounded random walk plus a slow periodic swell.

use crate::types::WindSample;
use crate::wind::{WindError, WindSensor};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Gaussian step sizes of the random walk.
const SPEED_SIGMA: f64 = 0.15;
const DIRECTION_SIGMA: f64 = 1.5;

pub struct SimulatedWindSensor {
    rng: StdRng,
    speed: f64,
    direction: f64,
}

impl SimulatedWindSensor {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            speed: 5.0,
            direction: 90.0,
        }
    }

    fn gauss(&mut self, sigma: f64) -> f64 {
        let z: f64 = StandardNormal.sample(&mut self.rng);
        z * sigma
    }
}

impl WindSensor for SimulatedWindSensor {
    fn connect(&mut self) -> bool {
        // No physical device behind the simulation.
        false
    }

    fn read(&mut self) -> Result<WindSample, WindError> {
        let now = Utc::now();
        let t = now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0;

        self.speed += self.gauss(SPEED_SIGMA);
        self.speed += 0.05 * (t / 15.0).sin();
        self.speed = self.speed.clamp(0.0, 35.0);

        self.direction += self.gauss(DIRECTION_SIGMA);
        self.direction += 1.0 * (t / 60.0).sin();
        self.direction = self.direction.rem_euclid(360.0);

        Ok(WindSample {
            ts: now,
            speed_mps: self.speed,
            direction_deg: self.direction,
        })
    }

    fn close(&mut self) {}
}
