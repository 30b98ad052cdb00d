use {
    crate::{
        error::{Error, Result},
        message::{DataSink, Message},
        retry::RetryingReader,
        sensors::PolledSensor,
        signal::StopSignal,
    },
    log::{debug, warn},
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::time::Duration,
};

/// Random pause range between two sensors of the same cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    pub const NONE: Jitter = Jitter {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            return Err(Error::Config(format!(
                "jitter minimum {:?} exceeds maximum {:?}",
                min, max
            )));
        }
        Ok(Jitter { min, max })
    }

    pub fn from_secs_f64(min: f64, max: f64) -> Result<Self> {
        let secs = |value: f64| {
            Duration::try_from_secs_f64(value)
                .map_err(|_| Error::Config(format!("invalid jitter bound {}", value)))
        };
        Jitter::new(secs(min)?, secs(max)?)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let secs = rng.gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        // f64 rounding can land just outside the bounds near `Duration::MAX`.
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max)
            .clamp(self.min, self.max)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter {
            min: Duration::from_millis(20),
            max: Duration::from_millis(80),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    Completed,
    /// Stop was requested before every sensor was read.
    Stopped,
}

/// One sweep over every sensor, in construction order.
pub struct PollCycle<B> {
    sensors: Vec<PolledSensor<B>>,
    reader: RetryingReader,
    jitter: Jitter,
    sink: DataSink,
    rng: StdRng,
}

impl<B> PollCycle<B> {
    pub fn new(
        sensors: Vec<PolledSensor<B>>,
        reader: RetryingReader,
        jitter: Jitter,
        sink: DataSink,
    ) -> Self {
        Self {
            sensors,
            reader,
            jitter,
            sink,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn sensors(&self) -> &[PolledSensor<B>] {
        &self.sensors
    }

    /// Clears the poison a panicking device left on any of the buses.
    pub fn reset_buses(&self) {
        for target in &self.sensors {
            if target.bus.reset() {
                warn!("{} left bus {} poisoned", target.sensor, target.bus.name());
            }
        }
    }

    /// Reads each sensor once and pushes one message per sensor.
    ///
    /// A failing sensor only costs its own retry budget; the stop signal is
    /// checked after every read and interrupts the jitter pause.
    pub async fn run(&mut self, stop: &mut StopSignal) -> CycleEnd {
        let count = self.sensors.len();

        for (index, target) in self.sensors.iter_mut().enumerate() {
            let measurement = self.reader.read(target).await;
            self.sink.push(Message::LiveSensorData(measurement));

            if stop.is_set() {
                debug!("Stop requested after {}", target.sensor);
                return CycleEnd::Stopped;
            }

            if index + 1 < count {
                let pause = self.jitter.sample(&mut self.rng);
                if !pause.is_zero() && stop.sleep(pause).await {
                    return CycleEnd::Stopped;
                }
            }
        }

        CycleEnd::Completed
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            bus::BusManager,
            sensors::{Reading, Sensor},
            signal::StopHandle,
        },
        anyhow::anyhow,
        rand::rngs::mock::StepRng,
        std::{sync::Arc, time::Instant},
    };

    fn sensor(bus: &Arc<BusManager>, address: u8, healthy: bool) -> PolledSensor<()> {
        let device = move |sensor: &Sensor, _: &mut ()| -> anyhow::Result<Reading> {
            if !healthy {
                return Err(anyhow!("{} not answering", sensor));
            }
            Ok(Reading {
                co2: 400.0 + f64::from(sensor.address),
                temperature: 20.0,
                humidity: 45.0,
            })
        };
        PolledSensor::new(Sensor::new(address, false), Arc::clone(bus), device)
    }

    fn cycle(sensors: Vec<PolledSensor<()>>, jitter: Jitter) -> (PollCycle<()>, DataSink) {
        let sink = DataSink::new();
        let cycle = PollCycle::new(sensors, RetryingReader::default(), jitter, sink.clone());
        (cycle, sink)
    }

    #[test]
    fn jitter_rejects_inverted_range() {
        assert!(Jitter::new(Duration::from_millis(80), Duration::from_millis(20)).is_err());
        assert!(Jitter::from_secs_f64(-0.1, 0.2).is_err());
        assert_eq!(Jitter::from_secs_f64(0.02, 0.08).unwrap(), Jitter::default());
    }

    #[test]
    fn jitter_samples_within_bounds() {
        let jitter = Jitter::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let pause = jitter.sample(&mut rng);
            assert!(pause >= jitter.min() && pause <= jitter.max());
        }
        assert_eq!(Jitter::NONE.sample(&mut StepRng::new(0, 1)), Duration::ZERO);
    }

    #[test]
    fn jitter_near_duration_max_stays_in_bounds() {
        let jitter = Jitter::new(Duration::MAX / 2, Duration::MAX).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let pause = jitter.sample(&mut rng);
            assert!(pause >= jitter.min() && pause <= jitter.max());
        }
        let pinned = Jitter::new(Duration::MAX, Duration::MAX).unwrap();
        assert_eq!(pinned.sample(&mut rng), Duration::MAX);
    }

    #[tokio::test]
    async fn failure_is_isolated_and_order_preserved() {
        let bus = Arc::new(BusManager::new("rs485", ()));
        let (mut cycle, sink) = cycle(
            vec![sensor(&bus, 7, false), sensor(&bus, 3, true), sensor(&bus, 5, true)],
            Jitter::NONE,
        );
        let stop = StopHandle::new();

        assert_eq!(cycle.run(&mut stop.signal()).await, CycleEnd::Completed);

        let measurements: Vec<_> = sink
            .drain()
            .into_iter()
            .map(|Message::LiveSensorData(m)| m)
            .collect();
        let ids: Vec<u32> = measurements.iter().map(|m| m.sensor_id).collect();
        assert_eq!(ids, vec![7, 3, 5]);
        assert!(measurements[0].is_failed());
        assert_eq!(measurements[1].reading.unwrap().co2, 403.0);
        assert_eq!(measurements[2].reading.unwrap().co2, 405.0);
    }

    #[tokio::test]
    async fn no_pause_after_last_sensor() {
        let bus = Arc::new(BusManager::new("rs485", ()));
        let pause = Duration::from_millis(150);
        let jitter = Jitter::new(pause, pause).unwrap();
        let (mut cycle, sink) = cycle(vec![sensor(&bus, 2, true)], jitter);
        let stop = StopHandle::new();

        let started = Instant::now();
        cycle.run(&mut stop.signal()).await;

        assert!(started.elapsed() < pause);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn pauses_between_sensors() {
        let bus = Arc::new(BusManager::new("rs485", ()));
        let pause = Duration::from_millis(40);
        let (mut cycle, _) = cycle(
            vec![sensor(&bus, 2, true), sensor(&bus, 3, true), sensor(&bus, 4, true)],
            Jitter::new(pause, pause).unwrap(),
        );
        let stop = StopHandle::new();

        let started = Instant::now();
        cycle.run(&mut stop.signal()).await;

        assert!(started.elapsed() >= pause * 2);
    }

    #[tokio::test]
    async fn stop_ends_cycle_after_current_sensor() {
        let bus = Arc::new(BusManager::new("rs485", ()));
        let (mut cycle, sink) = cycle(
            vec![sensor(&bus, 2, true), sensor(&bus, 3, true)],
            Jitter::NONE,
        );
        let stop = StopHandle::new();
        stop.set();

        assert_eq!(cycle.run(&mut stop.signal()).await, CycleEnd::Stopped);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn stop_interrupts_jitter_pause() {
        let bus = Arc::new(BusManager::new("rs485", ()));
        let pause = Duration::from_secs(5);
        let (mut cycle, sink) = cycle(
            vec![sensor(&bus, 2, true), sensor(&bus, 3, true)],
            Jitter::new(pause, pause).unwrap(),
        );
        let stop = StopHandle::new();
        let mut signal = stop.signal();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.set();
        };
        let started = Instant::now();
        let (end, _) = tokio::join!(cycle.run(&mut signal), stopper);

        assert_eq!(end, CycleEnd::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn empty_sensor_set_completes() {
        let (mut cycle, sink) = cycle(Vec::new(), Jitter::default());
        let stop = StopHandle::new();

        assert_eq!(cycle.run(&mut stop.signal()).await, CycleEnd::Completed);
        assert!(sink.is_empty());
    }
}
