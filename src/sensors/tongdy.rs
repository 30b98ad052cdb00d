use {
    crate::{
        modbus::{registers_to_f32, RtuClient},
        sensors::{Reading, Sensor, SensorDevice},
    },
    anyhow::{anyhow, Context, Result},
    embedded_hal::serial::{Read, Write},
    log::debug,
    std::{fmt::Debug, time::Duration},
};

/// Default wait for a Tongdy sensor to answer one request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Input register of each value; every value spans two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub co2: u16,
    pub temperature: u16,
    pub humidity: u16,
}

impl RegisterMap {
    /// VOC sensors insert a VOC value ahead of temperature.
    pub fn for_sensor(sensor: &Sensor) -> Self {
        if sensor.voc {
            RegisterMap {
                co2: 0,
                temperature: 4,
                humidity: 6,
            }
        } else {
            RegisterMap {
                co2: 0,
                temperature: 2,
                humidity: 4,
            }
        }
    }
}

/// Tongdy CO2/temperature/humidity transmitter on an RS-485 Modbus RTU line.
#[derive(Debug, Clone)]
pub struct TongdyDevice {
    timeout: Duration,
}

impl TongdyDevice {
    pub fn new() -> Self {
        Self::with_timeout(RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TongdyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> SensorDevice<S> for TongdyDevice
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: Debug,
{
    fn read_once(&mut self, sensor: &Sensor, port: &mut S) -> Result<Reading> {
        let registers = RegisterMap::for_sensor(sensor);
        let mut client = RtuClient::new(port, self.timeout);

        let mut read_float = |register: u16, name: &str| -> Result<f64> {
            let words = client
                .read_input_registers(sensor.address, register, 2)
                .with_context(|| format!("Failed to read {} from {}", name, sensor))?;
            match words[..] {
                [hi, lo] => Ok(round2(registers_to_f32([hi, lo]))),
                _ => Err(anyhow!("{} returned {} registers for {}", sensor, words.len(), name)),
            }
        };

        let co2 = read_float(registers.co2, "co2")?;
        let temperature = read_float(registers.temperature, "temperature")?;
        let humidity = read_float(registers.humidity, "humidity")?;

        debug!(
            "{}: CO2 {} ppm, temperature {} °C, humidity {} %",
            sensor, co2, temperature, humidity
        );

        Ok(Reading {
            co2,
            temperature,
            humidity,
        })
    }
}

fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}
