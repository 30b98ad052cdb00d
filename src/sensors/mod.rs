use {
    crate::bus::BusManager,
    anyhow::Result,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{fmt, sync::Arc},
    thiserror::Error,
};

pub mod simulated;
pub mod tongdy;

/// Something that can take one reading from a sensor over a bus transport.
///
/// An `Err` is a terminal outcome for that attempt; retrying is up to the
/// caller.
pub trait SensorDevice<B>: Send {
    fn read_once(&mut self, sensor: &Sensor, bus: &mut B) -> Result<Reading>;
}

impl<B, F> SensorDevice<B> for F
where
    F: FnMut(&Sensor, &mut B) -> Result<Reading> + Send,
{
    fn read_once(&mut self, sensor: &Sensor, bus: &mut B) -> Result<Reading> {
        self(sensor, bus)
    }
}

/// Identity of one sensor on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sensor {
    pub id: u32,
    pub address: u8,
    /// Chemical (VOC) variant, which uses a different register layout.
    pub voc: bool,
}

impl Sensor {
    /// A sensor identified by its bus address.
    pub fn new(address: u8, voc: bool) -> Self {
        Self {
            id: u32::from(address),
            address,
            voc,
        }
    }

    /// Sensors found on a bus when none are configured explicitly.
    pub fn default_set() -> Vec<Sensor> {
        vec![Sensor::new(2, true), Sensor::new(3, false)]
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor {} (address {}", self.id, self.address)?;
        if self.voc {
            write!(f, ", voc")?;
        }
        write!(f, ")")
    }
}

/// One complete set of values from a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// ppm
    pub co2: f64,
    /// °C
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
}

/// The result of polling one sensor in one cycle.
///
/// `reading` is `None` when every attempt failed, so the three values are
/// always either all present or all absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "MeasurementRecord", try_from = "MeasurementRecord")]
pub struct Measurement {
    pub sensor_id: u32,
    pub reading: Option<Reading>,
    pub captured_at: DateTime<Utc>,
}

impl Measurement {
    pub fn success(sensor_id: u32, reading: Reading) -> Self {
        Self {
            sensor_id,
            reading: Some(reading),
            captured_at: Utc::now(),
        }
    }

    pub fn failed(sensor_id: u32) -> Self {
        Self {
            sensor_id,
            reading: None,
            captured_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.reading.is_none()
    }
}

#[derive(Debug, Error)]
#[error("measurement for sensor {0} has only some of co2, temperature and humidity")]
pub struct PartialReading(pub u32);

/// Flat wire form of a [`Measurement`].
#[derive(Serialize, Deserialize)]
struct MeasurementRecord {
    sensor_id: u32,
    co2: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    timestamp: DateTime<Utc>,
}

impl From<Measurement> for MeasurementRecord {
    fn from(m: Measurement) -> Self {
        MeasurementRecord {
            sensor_id: m.sensor_id,
            co2: m.reading.map(|r| r.co2),
            temperature: m.reading.map(|r| r.temperature),
            humidity: m.reading.map(|r| r.humidity),
            timestamp: m.captured_at,
        }
    }
}

impl TryFrom<MeasurementRecord> for Measurement {
    type Error = PartialReading;

    fn try_from(record: MeasurementRecord) -> Result<Self, Self::Error> {
        let reading = match (record.co2, record.temperature, record.humidity) {
            (Some(co2), Some(temperature), Some(humidity)) => Some(Reading {
                co2,
                temperature,
                humidity,
            }),
            (None, None, None) => None,
            _ => return Err(PartialReading(record.sensor_id)),
        };

        Ok(Measurement {
            sensor_id: record.sensor_id,
            reading,
            captured_at: record.timestamp,
        })
    }
}

/// A sensor bound to the bus it sits on and the device that reads it.
pub struct PolledSensor<B> {
    pub sensor: Sensor,
    pub bus: Arc<BusManager<B>>,
    pub device: Box<dyn SensorDevice<B>>,
}

impl<B> PolledSensor<B> {
    pub fn new(
        sensor: Sensor,
        bus: Arc<BusManager<B>>,
        device: impl SensorDevice<B> + 'static,
    ) -> Self {
        Self {
            sensor,
            bus,
            device: Box::new(device),
        }
    }
}

impl<B> fmt::Debug for PolledSensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolledSensor")
            .field("sensor", &self.sensor)
            .field("bus", &self.bus.name())
            .finish_non_exhaustive()
    }
}
