use {
    crate::{
        error::{Error, Result},
        sensors::{Measurement, PolledSensor, Reading},
    },
    log::{debug, error, warn},
    std::time::Duration,
    tokio::time,
};

pub const DEFAULT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per sensor per cycle, at least one.
    pub attempts: u32,
    /// Pause between failed attempts. The bus is free during the pause.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: DEFAULT_ATTEMPTS,
            delay: Duration::ZERO,
        }
    }
}

/// Reads a sensor under a [`RetryPolicy`], yielding a null measurement once
/// the budget is spent.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingReader {
    policy: RetryPolicy,
}

impl RetryingReader {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn read<B>(&self, target: &mut PolledSensor<B>) -> Measurement {
        let sensor_id = target.sensor.id;
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match attempt_once(target, attempt) {
                Ok(reading) => {
                    debug!("{} read on attempt {}", target.sensor, attempt);
                    return Measurement::success(sensor_id, reading);
                }
                Err(e) => warn!("{}", e),
            }

            if attempt < attempts && !self.policy.delay.is_zero() {
                time::sleep(self.policy.delay).await;
            }
        }

        error!(
            "{}",
            Error::SensorExhausted {
                sensor_id,
                attempts
            }
        );
        Measurement::failed(sensor_id)
    }
}

/// One bus transaction: the lock lives exactly as long as this call.
fn attempt_once<B>(target: &mut PolledSensor<B>, attempt: u32) -> Result<Reading> {
    let mut bus = target.bus.acquire()?;
    target
        .device
        .read_once(&target.sensor, &mut *bus)
        .map_err(|e| Error::DeviceRead {
            sensor_id: target.sensor.id,
            attempt,
            source: e.into(),
        })
}
