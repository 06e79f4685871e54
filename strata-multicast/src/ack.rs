//! Delivery acknowledgement between downstreams and the upstream producer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks how many downstreams have taken a dispatched value.
///
/// The producer waits until `acked >= required` and every blocking token
/// is gone. `required` starts out unreachable and is lowered by the manager
/// once it knows how many downstreams the value went to.
#[derive(Debug)]
pub(crate) struct DeliveryAck {
    acked: AtomicUsize,
    required: AtomicUsize,
    /// Tokens handed to subscribers whose queue this value filled.
    blocking: AtomicUsize,
    released: AtomicBool,
    notify: Notify,
}

impl DeliveryAck {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            acked: AtomicUsize::new(0),
            required: AtomicUsize::new(usize::MAX),
            blocking: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub(crate) fn token(self: &Arc<Self>) -> AckToken {
        AckToken {
            ack: Arc::clone(self),
            blocking: false,
        }
    }

    /// A token the producer waits on no matter how many others acked.
    pub(crate) fn blocking_token(self: &Arc<Self>) -> AckToken {
        self.blocking.fetch_add(1, Ordering::SeqCst);
        AckToken {
            ack: Arc::clone(self),
            blocking: true,
        }
    }

    /// Lower the number of acknowledgements needed. Never raises it.
    pub(crate) fn require(&self, count: usize) {
        self.required.fetch_min(count, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Release the producer regardless of acknowledgements.
    pub(crate) fn complete(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn record(&self, blocking: bool) {
        if blocking {
            self.blocking.fetch_sub(1, Ordering::SeqCst);
        }
        self.acked.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_complete(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return true;
        }
        self.blocking.load(Ordering::SeqCst) == 0
            && self.acked.load(Ordering::SeqCst) >= self.required.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

/// One downstream's claim on a delivery. Acknowledges when dropped, so a
/// subscriber that goes away with values still queued never stalls the
/// producer.
#[derive(Debug)]
pub(crate) struct AckToken {
    ack: Arc<DeliveryAck>,
    blocking: bool,
}

impl Drop for AckToken {
    fn drop(&mut self) {
        self.ack.record(self.blocking);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_once_required_tokens_drop() {
        let ack = DeliveryAck::new();
        let first = ack.token();
        let second = ack.token();
        ack.require(2);
        assert!(!ack.is_complete());

        let waiter = {
            let ack = ack.clone();
            tokio::spawn(async move { ack.wait().await })
        };
        drop(first);
        assert!(!ack.is_complete());
        drop(second);
        waiter.await.unwrap();
        assert!(ack.is_complete());
    }

    #[test]
    fn test_unreached_requirement_is_incomplete() {
        let ack = DeliveryAck::new();
        drop(ack.token());
        assert!(!ack.is_complete());
        ack.complete();
        assert!(ack.is_complete());
    }

    #[test]
    fn test_blocking_token_holds_producer_past_min_acks() {
        let ack = DeliveryAck::new();
        let fast = ack.token();
        let stalled = ack.blocking_token();
        ack.require(1);
        drop(fast);
        assert!(!ack.is_complete());
        drop(stalled);
        assert!(ack.is_complete());
    }

    #[test]
    fn test_require_never_raises() {
        let ack = DeliveryAck::new();
        ack.require(1);
        ack.require(5);
        drop(ack.token());
        assert!(ack.is_complete());
    }
}
