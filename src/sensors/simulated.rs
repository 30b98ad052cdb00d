//! Synthetic sensors for running the poller without hardware.

use {
    crate::sensors::{Reading, Sensor, SensorDevice},
    anyhow::{anyhow, bail, Result},
    log::{debug, warn},
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::{
        str::FromStr,
        thread,
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Minimal noise, never fails.
    Stable,
    /// Realistic noise and drift.
    Noisy,
    /// Fails 15% of reads.
    Unreliable,
    /// High readings with heavy noise.
    Extreme,
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(Profile::Stable),
            "noisy" => Ok(Profile::Noisy),
            "unreliable" => Ok(Profile::Unreliable),
            "extreme" => Ok(Profile::Extreme),
            other => bail!("Unknown simulation profile {:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Levels {
    co2: f64,
    temperature: f64,
    humidity: f64,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    base: Levels,
    current: Levels,
    noise: f64,
    drift: f64,
    fail_probability: f64,
    simulate_delay: bool,
    last_read: Instant,
    reads: u64,
    rng: StdRng,
}

impl SimulatedDevice {
    pub fn new(profile: Profile, voc: bool) -> Self {
        Self::build(profile, voc, StdRng::from_entropy())
    }

    /// Deterministic device for tests.
    pub fn seeded(profile: Profile, voc: bool, seed: u64) -> Self {
        Self::build(profile, voc, StdRng::seed_from_u64(seed))
    }

    fn build(profile: Profile, voc: bool, rng: StdRng) -> Self {
        let (noise, drift, fail_probability, simulate_delay) = match profile {
            Profile::Stable => (0.5, 0.05, 0.0, false),
            Profile::Noisy => (5.0, 0.3, 0.0, true),
            Profile::Unreliable => (3.0, 0.2, 0.15, true),
            Profile::Extreme => (10.0, 0.5, 0.0, true),
        };
        let base = match profile {
            Profile::Extreme => Levels {
                co2: 2500.0,
                temperature: 35.0,
                humidity: 85.0,
            },
            _ => Levels {
                co2: if voc { 450.0 } else { 400.0 },
                temperature: 22.0,
                humidity: 50.0,
            },
        };

        Self {
            base,
            current: base,
            noise,
            drift,
            fail_probability,
            simulate_delay,
            last_read: Instant::now(),
            reads: 0,
            rng,
        }
    }

    /// Pins the sensor to the given values; `None` leaves a value as is.
    pub fn set_values(
        &mut self,
        co2: Option<f64>,
        temperature: Option<f64>,
        humidity: Option<f64>,
    ) {
        if let Some(co2) = co2 {
            self.base.co2 = co2;
            self.current.co2 = co2;
        }
        if let Some(temperature) = temperature {
            self.base.temperature = temperature;
            self.current.temperature = temperature;
        }
        if let Some(humidity) = humidity {
            self.base.humidity = humidity;
            self.current.humidity = humidity;
        }
    }

    /// Forces every following read to fail, or to succeed again.
    pub fn fail(&mut self, fail: bool) {
        self.fail_probability = if fail { 1.0 } else { 0.0 };
    }

    pub fn read_count(&self) -> u64 {
        self.reads
    }

    fn wander(&mut self) {
        let elapsed = self.last_read.elapsed().as_secs_f64();
        self.last_read = Instant::now();
        let factor = self.drift * elapsed;

        self.current.co2 += self.rng.gen_range(-1.0..=1.0) * factor;
        self.current.temperature += self.rng.gen_range(-0.1..=0.1) * factor;
        self.current.humidity += self.rng.gen_range(-0.5..=0.5) * factor;

        // Pull gently back toward the base levels.
        self.current.co2 += (self.base.co2 - self.current.co2) * 0.01;
        self.current.temperature += (self.base.temperature - self.current.temperature) * 0.01;
        self.current.humidity += (self.base.humidity - self.current.humidity) * 0.01;
    }

    fn noisy(&mut self, value: f64, amount: f64) -> f64 {
        if amount <= 0.0 {
            return value;
        }
        value + self.rng.gen_range(-amount..=amount)
    }
}

impl<B> SensorDevice<B> for SimulatedDevice {
    fn read_once(&mut self, sensor: &Sensor, _bus: &mut B) -> Result<Reading> {
        self.reads += 1;

        if self.fail_probability > 0.0 && self.rng.gen_bool(self.fail_probability.min(1.0)) {
            warn!("{} simulating failure on read #{}", sensor, self.reads);
            return Err(anyhow!("Simulated read failure on {}", sensor));
        }

        if self.simulate_delay {
            thread::sleep(Duration::from_millis(self.rng.gen_range(10..=50)));
        }

        self.wander();
        let Levels {
            co2,
            temperature,
            humidity,
        } = self.current;
        let co2 = self.noisy(co2, self.noise).clamp(300.0, 5000.0);
        let temperature = self.noisy(temperature, self.noise * 0.1).clamp(-10.0, 50.0);
        let humidity = self.noisy(humidity, self.noise * 0.5).clamp(0.0, 100.0);

        let reading = Reading {
            co2: round2(co2),
            temperature: round2(temperature),
            humidity: round2(humidity),
        };
        debug!("{} simulated {:?}", sensor, reading);
        Ok(reading)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(device: &mut SimulatedDevice, sensor: &Sensor) -> Result<Reading> {
        SensorDevice::<()>::read_once(device, sensor, &mut ())
    }

    #[test]
    fn stable_readings_stay_near_base() {
        let sensor = Sensor::new(2, true);
        let mut device = SimulatedDevice::seeded(Profile::Stable, true, 7);

        for _ in 0..20 {
            let reading = read(&mut device, &sensor).unwrap();
            assert!((reading.co2 - 450.0).abs() < 5.0, "co2 {}", reading.co2);
            assert!((reading.temperature - 22.0).abs() < 1.0);
            assert!((reading.humidity - 50.0).abs() < 2.0);
        }
        assert_eq!(device.read_count(), 20);
    }

    #[test]
    fn forced_failure_and_recovery() {
        let sensor = Sensor::new(3, false);
        let mut device = SimulatedDevice::seeded(Profile::Stable, false, 1);

        device.fail(true);
        assert!(read(&mut device, &sensor).is_err());
        device.fail(false);
        assert!(read(&mut device, &sensor).is_ok());
    }

    #[test]
    fn pinned_values_are_reported() {
        let sensor = Sensor::new(3, false);
        let mut device = SimulatedDevice::seeded(Profile::Stable, false, 3);
        device.set_values(Some(1200.0), None, Some(65.0));

        let reading = read(&mut device, &sensor).unwrap();
        assert!((reading.co2 - 1200.0).abs() < 2.0);
        assert!((reading.humidity - 65.0).abs() < 1.0);
    }

    #[test]
    fn extreme_values_are_clamped() {
        let sensor = Sensor::new(4, false);
        let mut device = SimulatedDevice::seeded(Profile::Extreme, false, 11);
        device.set_values(Some(6000.0), Some(60.0), Some(120.0));

        let reading = read(&mut device, &sensor).unwrap();
        assert!(reading.co2 <= 5000.0);
        assert!(reading.temperature <= 50.0);
        assert_eq!(reading.humidity, 100.0);
    }

    #[test]
    fn profile_names_parse() {
        assert_eq!("Unreliable".parse::<Profile>().unwrap(), Profile::Unreliable);
        assert!("flaky".parse::<Profile>().is_err());
    }
}
