//! Mutual exclusion for a shared half-duplex bus.
//!
//! A [`BusManager`] owns the bus transport. The only way to reach the
//! transport is through the [`BusGuard`] returned by [`BusManager::acquire`],
//! so a transaction cannot run without holding the lock and cannot forget to
//! release it. Sensors that sit on the same physical bus must share one
//! manager, typically through an `Arc`.

use {
    crate::error::{Error, Result},
    log::{trace, warn},
    std::{
        fmt,
        ops::{Deref, DerefMut},
        sync::{Mutex, MutexGuard},
        thread,
        time::{Duration, Instant},
    },
};

pub struct BusManager<B = ()> {
    name: String,
    turnaround: Duration,
    state: Mutex<BusState<B>>,
}

struct BusState<B> {
    transport: B,
    last_release: Option<Instant>,
}

impl<B> BusManager<B> {
    pub fn new(name: impl Into<String>, transport: B) -> Self {
        Self::with_turnaround(name, transport, Duration::ZERO)
    }

    /// Creates a manager that keeps the line quiet for at least `turnaround`
    /// between the end of one transaction and the start of the next.
    pub fn with_turnaround(name: impl Into<String>, transport: B, turnaround: Duration) -> Self {
        Self {
            name: name.into(),
            turnaround,
            state: Mutex::new(BusState {
                transport,
                last_release: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the bus is free and returns a guard for one transaction.
    pub fn acquire(&self) -> Result<BusGuard<'_, B>> {
        let state = self.state.lock().map_err(|_| Error::BusUnavailable {
            bus: self.name.clone(),
            reason: "a previous transaction panicked".to_string(),
        })?;

        // The quiet time belongs to this transaction, so it is waited out
        // with the lock held.
        if let Some(released) = state.last_release {
            let wait = self.turnaround.saturating_sub(released.elapsed());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        trace!("bus {} acquired", self.name);
        Ok(BusGuard {
            name: &self.name,
            state,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.is_poisoned()
    }

    /// Makes the bus usable again after a holder panicked mid-transaction.
    /// Returns `true` if it was poisoned.
    pub fn reset(&self) -> bool {
        if !self.state.is_poisoned() {
            return false;
        }
        self.state.clear_poison();
        warn!("bus {} reset after a panicked transaction", self.name);
        true
    }
}

impl<B> fmt::Debug for BusManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusManager")
            .field("name", &self.name)
            .field("turnaround", &self.turnaround)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the bus transport for the lifetime of the guard.
pub struct BusGuard<'a, B> {
    name: &'a str,
    state: MutexGuard<'a, BusState<B>>,
}

impl<B> Deref for BusGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.state.transport
    }
}

impl<B> DerefMut for BusGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.state.transport
    }
}

impl<B> Drop for BusGuard<'_, B> {
    fn drop(&mut self) {
        self.state.last_release = Some(Instant::now());
        trace!("bus {} released", self.name);
    }
}
