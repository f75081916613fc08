//! Serialization of capture-device opens
//!
//! Some drivers misbehave when two devices are opened at the same time. Every
//! worker of an application shares one coordinator and holds its guard for the
//! whole backend trial sequence.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

const RETRY: Duration = Duration::from_millis(20);

/// Shared mutual-exclusion section for hardware opens
#[derive(Debug, Clone, Default)]
pub struct OpenCoordinator {
    lock: Arc<Mutex<()>>,
}

impl OpenCoordinator {
    /// New coordinator; clone it into every worker
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other open is in flight
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Wait for the open section, giving up once `cancelled` returns true
    ///
    /// `cancelled` is polled between attempts, so a stopped worker never
    /// stays parked behind another worker's open.
    pub fn acquire_unless(&self, cancelled: impl Fn() -> bool) -> Option<MutexGuard<'_, ()>> {
        loop {
            if cancelled() {
                return None;
            }
            if let Some(guard) = self.lock.try_lock_for(RETRY) {
                return Some(guard);
            }
        }
    }

    /// Whether an open is in flight right now
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancelled_waiter_gives_up() {
        let coordinator = OpenCoordinator::new();
        let held = coordinator.acquire();
        assert!(coordinator.is_busy());

        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            thread::spawn(move || coordinator.acquire_unless(|| cancel.load(Ordering::SeqCst)).is_some())
        };
        thread::sleep(Duration::from_millis(60));
        let cancelled_at = Instant::now();
        cancel.store(true, Ordering::SeqCst);

        assert!(!waiter.join().unwrap());
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
        drop(held);
        assert!(coordinator.acquire_unless(|| false).is_some());
    }
}
