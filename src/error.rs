use {std::time::Duration, thiserror::Error};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error returned by a sensor device for one attempt.
pub type DeviceError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The bus lock could not be taken, usually because a previous holder
    /// panicked mid-transaction and left the transport in an unknown state.
    #[error("bus {bus} unavailable: {reason}")]
    BusUnavailable { bus: String, reason: String },

    /// A single read attempt failed.
    #[error("sensor {sensor_id} read failed on attempt {attempt}: {source}")]
    DeviceRead {
        sensor_id: u32,
        attempt: u32,
        #[source]
        source: DeviceError,
    },

    /// Every attempt in the retry budget failed.
    #[error("sensor {sensor_id} returned no data after {attempts} attempts")]
    SensorExhausted { sensor_id: u32, attempts: u32 },

    #[error("failed to create poller worker: {0}")]
    ThreadLifecycle(#[source] std::io::Error),

    #[error("poller worker did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}
