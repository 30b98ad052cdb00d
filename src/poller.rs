//! Lifecycle of the background polling worker.
//!
//! A [`SensorPoller`] owns one worker thread at a time. The worker drives a
//! single-threaded tokio runtime that runs [`PollCycle`]s back to back,
//! sleeping out the rest of each polling interval. Both the interval sleep and
//! the jitter pauses wake as soon as [`SensorPoller::stop`] raises the stop
//! signal, so stopping takes roughly one bus transaction rather than one
//! interval.

use {
    crate::{
        config::PollerConfig,
        cycle::{CycleEnd, PollCycle},
        error::{Error, Result},
        message::DataSink,
        retry::RetryingReader,
        sensors::{PolledSensor, Sensor},
        signal::{deadline_after, StopHandle, StopSignal},
    },
    log::{debug, error, info, warn},
    std::{
        panic::{self, AssertUnwindSafe},
        sync::{mpsc, Arc, Mutex},
        thread::{self, JoinHandle},
        time::Duration,
    },
    tokio::{runtime, time::Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Running,
    Stopping,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread finishes.
    exited: mpsc::Receiver<()>,
}

pub struct SensorPoller<B = ()> {
    config: PollerConfig,
    sensors: Vec<Sensor>,
    cycle: Arc<Mutex<PollCycle<B>>>,
    sink: DataSink,
    stop: StopHandle,
    state: PollerState,
    worker: Option<Worker>,
}

impl<B: Send + 'static> SensorPoller<B> {
    /// Creates a stopped poller writing to a fresh [`DataSink`].
    pub fn new(config: PollerConfig, sensors: Vec<PolledSensor<B>>) -> Result<Self> {
        Self::with_sink(config, sensors, DataSink::new())
    }

    pub fn with_sink(
        config: PollerConfig,
        sensors: Vec<PolledSensor<B>>,
        sink: DataSink,
    ) -> Result<Self> {
        config.validate()?;

        let identities = sensors.iter().map(|s| s.sensor).collect();
        let cycle = PollCycle::new(
            sensors,
            RetryingReader::new(config.retry),
            config.polling_jitter,
            sink.clone(),
        );

        Ok(Self {
            config,
            sensors: identities,
            cycle: Arc::new(Mutex::new(cycle)),
            sink,
            stop: StopHandle::new(),
            state: PollerState::Stopped,
            worker: None,
        })
    }

    /// Starts polling. Returns `false` if the poller is already running or
    /// still waiting for a previous worker to stop.
    pub fn start(&mut self) -> Result<bool> {
        self.reap();
        match self.state {
            PollerState::Running => {
                info!("SensorPoller already running, ignoring start");
                return Ok(false);
            }
            PollerState::Stopping => {
                warn!("SensorPoller is still stopping, ignoring start");
                return Ok(false);
            }
            PollerState::Stopped => {}
        }

        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(Error::ThreadLifecycle)?;

        self.stop.clear();
        let mut signal = self.stop.signal();
        let cycle = Arc::clone(&self.cycle);
        let interval = self.config.polling_interval;
        let (exit_notice, exited) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("sensor-poller".to_string())
            .spawn(move || {
                let _exit_notice = exit_notice;
                // A panicking worker is caught below, so the lock can only be
                // poisoned by an earlier worker that died outside the loop.
                let mut cycle = cycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(run_worker(&mut *cycle, &mut signal, interval))
                }));
                if outcome.is_err() {
                    error!("SensorPoller worker panicked, polling has stopped");
                    cycle.reset_buses();
                }
            })
            .map_err(|e| {
                error!("Failed to start SensorPoller: {}", e);
                Error::ThreadLifecycle(e)
            })?;

        self.worker = Some(Worker { handle, exited });
        self.state = PollerState::Running;
        info!(
            "SensorPoller started with {} sensors every {:?}",
            self.sensors.len(),
            interval
        );
        Ok(true)
    }

    /// Stops polling, waiting at most the configured stop timeout for the
    /// worker to finish. Returns `false` if the poller was already stopped.
    ///
    /// On [`Error::StopTimeout`] the poller stays in
    /// [`PollerState::Stopping`] and `stop` may be called again.
    pub fn stop(&mut self) -> Result<bool> {
        self.reap();
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                info!("SensorPoller already stopped, ignoring stop");
                self.state = PollerState::Stopped;
                return Ok(false);
            }
        };

        self.stop.set();
        self.state = PollerState::Stopping;

        match worker.exited.recv_timeout(self.config.stop_timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                error!(
                    "SensorPoller worker did not stop within {:?}",
                    self.config.stop_timeout
                );
                self.worker = Some(worker);
                Err(Error::StopTimeout(self.config.stop_timeout))
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("SensorPoller worker exited abnormally");
                }
                self.state = PollerState::Stopped;
                info!("SensorPoller stopped");
                Ok(true)
            }
        }
    }

    /// True while the worker is alive and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Running && !self.stop.is_set()
    }

    /// A worker that exited on its own reads as [`PollerState::Stopped`].
    pub fn state(&self) -> PollerState {
        match self.state {
            PollerState::Running if !self.worker_alive() => PollerState::Stopped,
            state => state,
        }
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn sink(&self) -> &DataSink {
        &self.sink
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.handle.is_finished())
    }

    /// Joins a worker that died without being asked to stop.
    fn reap(&mut self) {
        if self.state != PollerState::Running || self.worker_alive() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.handle.join().is_err() {
                warn!("SensorPoller worker exited abnormally");
            }
        }
        self.state = PollerState::Stopped;
        warn!("SensorPoller worker exited on its own, poller is stopped");
    }
}

impl<B> Drop for SensorPoller<B> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.stop.set();
            match worker.exited.recv_timeout(self.config.stop_timeout) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!("SensorPoller dropped while worker still busy, detaching it")
                }
                _ => {
                    let _ = worker.handle.join();
                }
            }
        }
    }
}

async fn run_worker<B>(cycle: &mut PollCycle<B>, signal: &mut StopSignal, interval: Duration) {
    debug!("SensorPoller worker running");
    let mut next_poll = Instant::now();

    while !signal.is_set() {
        if cycle.run(signal).await == CycleEnd::Stopped {
            break;
        }

        next_poll = deadline_after(next_poll, interval);
        let now = Instant::now();
        if next_poll < now {
            // Fell behind: restart the schedule instead of bursting.
            next_poll = now;
        }
        if signal.sleep_until(next_poll).await {
            break;
        }
    }

    debug!("SensorPoller worker exiting");
}
