//! Clock abstraction so lease and rate-limit logic can run against virtual
//! time in tests.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

pub trait TimeProvider: Send + Sync + fmt::Debug + 'static {
    fn utc_now(&self) -> DateTime<Utc>;

    /// Sleep for a duration. The virtual provider advances its clock instead
    /// of waiting.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Convert a configured duration, saturating instead of failing on values
/// chrono cannot represent.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Production provider backed by the system clock and the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests. Clones share the same instant.
#[derive(Clone)]
pub struct VirtualTimeProvider {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl fmt::Debug for VirtualTimeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTimeProvider")
            .field("now", &self.utc_now())
            .finish()
    }
}

impl VirtualTimeProvider {
    pub fn new_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = to_chrono(duration);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.checked_add_signed(step).unwrap_or(*now);
    }

    pub fn set_utc(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl TimeProvider for VirtualTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
