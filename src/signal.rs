//! Cooperative stop signal between the poller and its worker.

use {
    std::time::Duration,
    tokio::{
        sync::watch,
        time::{self, Instant},
    },
};

/// Sleeps longer than this never end on their own.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

/// `from + duration`, saturated to a far-future deadline instead of
/// overflowing the clock.
pub(crate) fn deadline_after(from: Instant, duration: Duration) -> Instant {
    from.checked_add(duration.min(FAR_FUTURE)).unwrap_or(from)
}

/// Control side of the signal.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Worker side of the signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Also true once the control side is gone.
    pub fn is_set(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Sleeps for `duration`; returns `true` if woken by a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.sleep_until(deadline_after(Instant::now(), duration)).await
    }

    /// Sleeps until `deadline`; returns `true` if woken by a stop request.
    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        if self.is_set() {
            return true;
        }
        let stopped = tokio::select! {
            _ = time::sleep_until(deadline) => false,
            _ = self.rx.wait_for(|stop| *stop) => true,
        };
        stopped || self.is_set()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Instant as StdInstant};

    #[tokio::test]
    async fn sleep_runs_to_deadline_without_stop() {
        let handle = StopHandle::new();
        let mut signal = handle.signal();

        let started = StdInstant::now();
        assert!(!signal.sleep(Duration::from_millis(30)).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn stop_wakes_a_long_sleep() {
        let handle = StopHandle::new();
        let mut signal = handle.signal();

        let stopper = async {
            time::sleep(Duration::from_millis(20)).await;
            handle.set();
        };
        let started = StdInstant::now();
        let (stopped, _) = tokio::join!(signal.sleep(Duration::from_secs(60)), stopper);

        assert!(stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_set_signal_returns_immediately() {
        let handle = StopHandle::new();
        let mut signal = handle.signal();
        handle.set();

        assert!(signal.is_set());
        assert!(signal.sleep(Duration::from_secs(60)).await);

        handle.clear();
        assert!(!signal.is_set());
        assert!(!handle.is_set());
    }

    #[tokio::test]
    async fn unbounded_sleep_is_still_woken_by_stop() {
        let handle = StopHandle::new();
        let mut signal = handle.signal();

        let stopper = async {
            time::sleep(Duration::from_millis(20)).await;
            handle.set();
        };
        let (stopped, _) = tokio::join!(signal.sleep(Duration::MAX), stopper);
        assert!(stopped);
    }

    #[test]
    fn deadline_saturates_instead_of_overflowing() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::MAX);
        assert!(deadline >= now + Duration::from_secs(365 * 86_400));
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[test]
    fn dropped_handle_reads_as_stop() {
        let handle = StopHandle::new();
        let signal = handle.signal();
        drop(handle);
        assert!(signal.is_set());
    }
}
