//! Public handle over a channel manager.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use strata_core::{ConcurrencyError, ConfigError, MulticastConfig, StrataResult};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::manager::{post, ChannelManager, Command, Delivery};
use crate::producer::UpstreamFactory;

/// Shares one upstream among any number of downstreams.
///
/// The upstream starts when the first regular downstream subscribes and,
/// unless `keep_upstream_alive` is set, is cancelled when the last one
/// leaves. Dropping the multicaster closes every downstream.
pub struct Multicaster<T: Send + 'static> {
    commands: mpsc::Sender<Command<T>>,
    next_downstream: AtomicU64,
    config: MulticastConfig,
}

impl<T> Multicaster<T>
where
    T: Clone + Send + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn new(config: MulticastConfig, upstream: UpstreamFactory<T>) -> StrataResult<Self> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| ConcurrencyError::NoRuntime {
            task: "channel manager".to_string(),
        })?;
        let commands = ChannelManager::spawn(&handle, config.clone(), upstream);
        Ok(Self {
            commands,
            next_downstream: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    /// Subscribe a new downstream.
    ///
    /// A `piggyback_only` downstream never starts the upstream; it only
    /// sees values produced for other subscribers. It requires
    /// `piggybacking_downstream`.
    pub async fn new_downstream(&self, piggyback_only: bool) -> StrataResult<Downstream<T>> {
        if piggyback_only && !self.config.piggybacking_downstream {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "piggyback_only".to_string(),
                option_b: "piggybacking_downstream = false".to_string(),
            }
            .into());
        }

        let id = self.next_downstream.fetch_add(1, Ordering::Relaxed);
        let (sender, deliveries) = mpsc::channel(self.config.downstream_limit() + 1);
        self.commands
            .send(Command::AddDownstream {
                id,
                sender,
                piggyback_only,
            })
            .await
            .map_err(|_| ConcurrencyError::ManagerClosed)?;

        Ok(Downstream {
            id,
            deliveries,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Stop the upstream and end every downstream.
    pub fn close(&self) {
        post(&self.commands, Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl<T: Send + 'static> Drop for Multicaster<T> {
    fn drop(&mut self) {
        post(&self.commands, Command::Close);
    }
}

/// One subscriber's view of the upstream.
///
/// Yields values in upstream order. An upstream error is yielded once and
/// ends the stream. Taking a value acknowledges it; dropping the
/// downstream unsubscribes. A downstream that stops polling holds at most
/// [`MulticastConfig::downstream_limit`] values, after which the upstream
/// waits for it.
pub struct Downstream<T: Send + 'static> {
    id: u64,
    deliveries: mpsc::Receiver<Delivery<T>>,
    commands: mpsc::Sender<Command<T>>,
    finished: bool,
}

impl<T: Send + 'static> Downstream<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: Send + 'static> Stream for Downstream<T> {
    type Item = StrataResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.deliveries.poll_recv(cx) {
            Poll::Ready(Some(Delivery::Value(value, token))) => {
                drop(token);
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(Delivery::Error(error))) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> Drop for Downstream<T> {
    fn drop(&mut self) {
        post(&self.commands, Command::RemoveDownstream { id: self.id });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Duration;
    use strata_core::{FetchError, StrataError};
    use tokio::sync::Notify;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn gated_upstream(gate: Arc<Notify>, calls: Arc<AtomicUsize>) -> UpstreamFactory<i32> {
        Arc::new(move || {
            let gate = gate.clone();
            calls.fetch_add(1, Ordering::SeqCst);
            async_stream::stream! {
                gate.notified().await;
                for i in 1..=3 {
                    yield StrataResult::Ok(i);
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_does_not_affect_others() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let multicaster =
            Multicaster::new(MulticastConfig::default(), gated_upstream(gate.clone(), calls.clone()))
                .unwrap();

        let mut subscribers = Vec::new();
        for _ in 0..20 {
            subscribers.push(multicaster.new_downstream(false).await.unwrap());
        }
        let cancelled = multicaster.new_downstream(false).await.unwrap();
        drop(cancelled);
        gate.notify_one();

        let results = join_all(subscribers.into_iter().map(|d| d.collect::<Vec<_>>())).await;
        for received in results {
            assert_eq!(received, vec![Ok(1), Ok(2), Ok(3)]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_subscriber_leaving_cancels_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let upstream: UpstreamFactory<u64> = Arc::new(move || {
            let guard = SetOnDrop(flag.clone());
            async_stream::stream! {
                let _guard = guard;
                let mut i = 0u64;
                loop {
                    i += 1;
                    yield StrataResult::Ok(i);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            .boxed()
        });
        let multicaster = Multicaster::new(MulticastConfig::default(), upstream).unwrap();

        let mut downstream = multicaster.new_downstream(false).await.unwrap();
        assert_eq!(downstream.next().await, Some(Ok(1)));
        assert_eq!(downstream.next().await, Some(Ok(2)));
        drop(downstream);

        for _ in 0..200 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stalled_subscriber_bounds_upstream_progress() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let upstream: UpstreamFactory<usize> = Arc::new(move || {
            let counter = counter.clone();
            async_stream::stream! {
                loop {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    yield StrataResult::Ok(n);
                }
            }
            .boxed()
        });
        let config = MulticastConfig::new().with_downstream_capacity(4);
        let multicaster = Multicaster::new(config, upstream).unwrap();

        let mut fast = multicaster.new_downstream(false).await.unwrap();
        let stalled = multicaster.new_downstream(false).await.unwrap();
        for expected in 1..=4 {
            assert_eq!(fast.next().await, Some(Ok(expected)));
        }
        let blocked = tokio::time::timeout(Duration::from_millis(50), fast.next()).await;
        assert!(blocked.is_err());
        assert_eq!(produced.load(Ordering::SeqCst), 4);

        drop(stalled);
        let resumed = tokio::time::timeout(Duration::from_secs(1), fast.next()).await;
        assert_eq!(resumed.unwrap(), Some(Ok(5)));
    }

    #[tokio::test]
    async fn test_keep_alive_replays_buffer_without_restart() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream: UpstreamFactory<i32> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async_stream::stream! {
                yield StrataResult::Ok(1);
                yield StrataResult::Ok(2);
                futures_util::future::pending::<()>().await;
            }
            .boxed()
        });
        let config = MulticastConfig::new()
            .with_buffer_size(1)
            .with_keep_upstream_alive(true);
        let multicaster = Multicaster::new(config, upstream).unwrap();

        let mut first = multicaster.new_downstream(false).await.unwrap();
        assert_eq!(first.next().await, Some(Ok(1)));
        assert_eq!(first.next().await, Some(Ok(2)));
        drop(first);

        let mut second = multicaster.new_downstream(false).await.unwrap();
        assert_eq!(second.next().await, Some(Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_reaches_every_subscriber() {
        let gate = Arc::new(Notify::new());
        let upstream_gate = gate.clone();
        let upstream: UpstreamFactory<i32> = Arc::new(move || {
            let gate = upstream_gate.clone();
            async_stream::stream! {
                gate.notified().await;
                yield StrataResult::Ok(1);
                yield Err(FetchError::Failed { reason: "boom".to_string() }.into());
            }
            .boxed()
        });
        let multicaster = Multicaster::new(MulticastConfig::default(), upstream).unwrap();
        let a = multicaster.new_downstream(false).await.unwrap();
        let b = multicaster.new_downstream(false).await.unwrap();
        gate.notify_one();

        let expected_error: StrataError = FetchError::Failed {
            reason: "boom".to_string(),
        }
        .into();
        for received in join_all([a.collect::<Vec<_>>(), b.collect::<Vec<_>>()]).await {
            assert_eq!(received, vec![Ok(1), Err(expected_error.clone())]);
        }
    }

    #[tokio::test]
    async fn test_late_joiner_restarts_upstream() {
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream_release = release.clone();
        let counter = calls.clone();
        let upstream: UpstreamFactory<usize> = Arc::new(move || {
            let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let release = upstream_release.clone();
            async_stream::stream! {
                yield StrataResult::Ok(run);
                release.notified().await;
            }
            .boxed()
        });
        let multicaster = Multicaster::new(MulticastConfig::default(), upstream).unwrap();

        let mut early = multicaster.new_downstream(false).await.unwrap();
        assert_eq!(early.next().await, Some(Ok(1)));

        let mut late = multicaster.new_downstream(false).await.unwrap();
        release.notify_one();

        assert_eq!(early.next().await, None);
        assert_eq!(late.next().await, Some(Ok(2)));
        release.notify_one();
        assert_eq!(late.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_piggyback_only_waits_for_a_regular_subscriber() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream: UpstreamFactory<i32> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async_stream::stream! {
                yield StrataResult::Ok(7);
            }
            .boxed()
        });
        let config = MulticastConfig::new().with_piggybacking_downstream(true);
        let multicaster = Multicaster::new(config, upstream).unwrap();

        let mut rider = multicaster.new_downstream(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let _driver = multicaster.new_downstream(false).await.unwrap();
        assert_eq!(rider.next().await, Some(Ok(7)));
        // stays attached after the upstream completes
        let still_open = tokio::time::timeout(Duration::from_millis(20), rider.next()).await;
        assert!(still_open.is_err());
    }

    #[tokio::test]
    async fn test_piggyback_only_requires_config() {
        let upstream: UpstreamFactory<i32> =
            Arc::new(|| futures_util::stream::empty::<StrataResult<i32>>().boxed());
        let multicaster = Multicaster::new(MulticastConfig::default(), upstream).unwrap();
        assert!(multicaster.new_downstream(true).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_construction() {
        let upstream: UpstreamFactory<i32> =
            Arc::new(|| futures_util::stream::empty::<StrataResult<i32>>().boxed());
        let config = MulticastConfig::new().with_keep_upstream_alive(true);
        assert!(Multicaster::new(config, upstream).is_err());
    }

    #[tokio::test]
    async fn test_close_ends_downstreams() {
        let upstream: UpstreamFactory<i32> = Arc::new(|| {
            async_stream::stream! {
                futures_util::future::pending::<()>().await;
                yield StrataResult::Ok(0);
            }
            .boxed()
        });
        let multicaster = Multicaster::new(MulticastConfig::default(), upstream).unwrap();
        let mut downstream = multicaster.new_downstream(false).await.unwrap();
        multicaster.close();
        assert_eq!(downstream.next().await, None);
    }
}
