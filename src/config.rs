use {
    crate::{
        cycle::Jitter,
        error::{Error, Result},
        retry::RetryPolicy,
        sensors::{simulated::Profile, Sensor},
    },
    anyhow::{anyhow, Context},
    std::{env, time::Duration},
};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD: u32 = 19200;
/// Quiet time kept on the RS-485 line between transactions.
pub const RS485_TURNAROUND: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time from the start of one cycle to the start of the next.
    pub polling_interval: Duration,
    pub polling_jitter: Jitter,
    pub retry: RetryPolicy,
    /// How long `stop()` waits for the worker before giving up.
    pub stop_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            polling_jitter: Jitter::default(),
            retry: RetryPolicy::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry budget must allow at least one attempt".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    /// Tongdy transmitters on the serial port.
    Hardware,
    Simulated(Profile),
}

/// Everything the runner needs, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub poller: PollerConfig,
    pub port: String,
    pub baud: u32,
    pub mode: SensorMode,
    pub sensors: Vec<Sensor>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut poller = PollerConfig::default();
        if let Some(v) = get("POLLING_INTERVAL") {
            poller.polling_interval = parse_secs(&v).context("POLLING_INTERVAL")?;
        }
        if let Some(v) = get("POLLING_JITTER") {
            poller.polling_jitter = parse_jitter(&v).context("POLLING_JITTER")?;
        }
        if let Some(v) = get("RETRY_ATTEMPTS") {
            poller.retry.attempts = v.trim().parse().context("RETRY_ATTEMPTS")?;
        }
        if let Some(v) = get("RETRY_DELAY") {
            poller.retry.delay = parse_secs(&v).context("RETRY_DELAY")?;
        }
        if let Some(v) = get("STOP_TIMEOUT") {
            poller.stop_timeout = parse_secs(&v).context("STOP_TIMEOUT")?;
        }
        poller.validate()?;

        let mode = match get("SENSOR_MODE") {
            None => SensorMode::Hardware,
            Some(v) if v.trim().eq_ignore_ascii_case("hardware") => SensorMode::Hardware,
            Some(v) => SensorMode::Simulated(v.trim().parse().context("SENSOR_MODE")?),
        };

        let sensors = match get("SENSORS") {
            Some(v) => parse_sensors(&v).context("SENSORS")?,
            None => Sensor::default_set(),
        };

        Ok(Settings {
            poller,
            port: get("MODBUS_PORT").unwrap_or_else(|| DEFAULT_PORT.to_string()),
            baud: match get("MODBUS_BAUD") {
                Some(v) => v.trim().parse().context("MODBUS_BAUD")?,
                None => DEFAULT_BAUD,
            },
            mode,
            sensors,
        })
    }
}

fn parse_secs(value: &str) -> anyhow::Result<Duration> {
    let secs: f64 = value.trim().parse()?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} is not a valid number of seconds", secs))
}

/// `"min,max"` in seconds.
fn parse_jitter(value: &str) -> anyhow::Result<Jitter> {
    let (min, max) = value
        .split_once(',')
        .ok_or_else(|| anyhow!("expected \"min,max\", got {:?}", value))?;
    Ok(Jitter::new(parse_secs(min)?, parse_secs(max)?)?)
}

/// Comma separated addresses, each optionally suffixed with `:voc`.
fn parse_sensors(value: &str) -> anyhow::Result<Vec<Sensor>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (address, voc) = match entry.split_once(':') {
                Some((address, kind)) if kind.eq_ignore_ascii_case("voc") => (address, true),
                Some((_, kind)) => return Err(anyhow!("unknown sensor kind {:?}", kind)),
                None => (entry, false),
            };
            let address = address
                .trim()
                .parse()
                .with_context(|| format!("bad sensor address {:?}", address))?;
            Ok(Sensor::new(address, voc))
        })
        .collect()
}
