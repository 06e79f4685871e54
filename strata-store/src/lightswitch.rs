//! Readers/writer coordination over a single-permit "room".
//!
//! Shared holders enter through a [`Lightswitch`]: the first one in takes
//! the room, the last one out gives it back. An exclusive holder takes the
//! room directly and so waits for every shared holder to leave.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

/// Counts shared holders of a room.
#[derive(Debug, Default)]
pub struct Lightswitch {
    count: Mutex<usize>,
    /// Serializes entries so only one caller ever waits on the room.
    turnstile: AsyncMutex<()>,
}

impl Lightswitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shared holders currently inside.
    pub fn holders(&self) -> usize {
        *self.count.lock()
    }

    /// Enter the room shared, taking it first if nobody is inside.
    pub async fn enter(
        self: &Arc<Self>,
        room: &Arc<Semaphore>,
    ) -> Result<LightswitchGuard, AcquireError> {
        let _turn = self.turnstile.lock().await;
        {
            let mut count = self.count.lock();
            if *count > 0 {
                *count += 1;
                return Ok(self.guard(room));
            }
        }
        // Leaving does not need the turnstile, so the room is taken before
        // the count goes up and released after it reaches zero.
        room.acquire().await?.forget();
        *self.count.lock() += 1;
        Ok(self.guard(room))
    }

    fn guard(self: &Arc<Self>, room: &Arc<Semaphore>) -> LightswitchGuard {
        LightswitchGuard {
            switch: Arc::clone(self),
            room: Arc::clone(room),
        }
    }

    fn leave(&self, room: &Semaphore) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            room.add_permits(1);
        }
    }
}

/// Shared hold on a room. Leaves on drop, including when the owning future
/// is cancelled.
#[derive(Debug)]
pub struct LightswitchGuard {
    switch: Arc<Lightswitch>,
    room: Arc<Semaphore>,
}

impl Drop for LightswitchGuard {
    fn drop(&mut self) {
        self.switch.leave(&self.room);
    }
}

/// A room together with the lightswitch guarding shared entry to it.
#[derive(Debug)]
pub struct Gate {
    room: Arc<Semaphore>,
    lightswitch: Arc<Lightswitch>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            room: Arc::new(Semaphore::new(1)),
            lightswitch: Arc::new(Lightswitch::new()),
        }
    }

    pub async fn shared(&self) -> Result<LightswitchGuard, AcquireError> {
        self.lightswitch.enter(&self.room).await
    }

    pub async fn exclusive(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.room).acquire_owned().await
    }

    pub fn shared_holders(&self) -> usize {
        self.lightswitch.holders()
    }

    /// True when nobody, shared or exclusive, is inside.
    pub fn is_idle(&self) -> bool {
        self.room.available_permits() == 1
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shared_holders_enter_together() {
        let gate = Gate::new();
        let first = gate.shared().await.unwrap();
        let second = gate.shared().await.unwrap();
        assert_eq!(gate.shared_holders(), 2);
        assert!(!gate.is_idle());

        drop(first);
        assert!(!gate.is_idle());
        drop(second);
        assert!(gate.is_idle());
        assert_eq!(gate.shared_holders(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_last_shared_holder() {
        let gate = Arc::new(Gate::new());
        let reader = gate.shared().await.unwrap();

        let writer = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _permit = gate.exclusive().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        drop(reader);
        timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should enter once readers leave")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_waits_for_exclusive_holder() {
        let gate = Arc::new(Gate::new());
        let permit = gate.exclusive().await.unwrap();

        let reader = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _guard = gate.shared().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        drop(permit);
        timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should enter once the writer leaves")
            .unwrap();
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn test_cancelled_shared_entry_does_not_leak_room() {
        let gate = Arc::new(Gate::new());
        let permit = gate.exclusive().await.unwrap();

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _guard = gate.shared().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pending.abort();
        let _ = pending.await;
        drop(permit);

        let _again = timeout(Duration::from_secs(1), gate.exclusive())
            .await
            .expect("room must be free after a cancelled entry")
            .unwrap();
        assert_eq!(gate.shared_holders(), 0);
    }
}
