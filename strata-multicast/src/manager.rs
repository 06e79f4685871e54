//! The channel manager actor.
//!
//! A single task owns the subscriber list, the replay buffer and the
//! current producer. Everything else talks to it through [`Command`]s, so
//! none of that state needs a lock.

use std::collections::VecDeque;
use std::sync::Arc;

use strata_core::{MulticastConfig, StrataError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::ack::{AckToken, DeliveryAck};
use crate::producer::{spawn_producer, ProducerHandle, UpstreamFactory};

/// Capacity of the command queue.
pub(crate) const COMMAND_QUEUE_CAPACITY: usize = 64;

/// What a downstream receives.
#[derive(Debug)]
pub(crate) enum Delivery<T> {
    Value(T, AckToken),
    Error(StrataError),
}

pub(crate) enum Command<T> {
    AddDownstream {
        id: u64,
        sender: mpsc::Sender<Delivery<T>>,
        piggyback_only: bool,
    },
    RemoveDownstream {
        id: u64,
    },
    DispatchValue {
        producer: u64,
        value: T,
        ack: Arc<DeliveryAck>,
    },
    DispatchError {
        producer: u64,
        error: StrataError,
    },
    UpstreamFinished {
        producer: u64,
    },
    Close,
}

/// Send a command from a synchronous context such as `Drop`.
///
/// Falls back to a detached send when the queue is full. If no runtime is
/// around the command is dropped; the manager then notices disconnected
/// downstreams on its next dispatch.
pub(crate) fn post<T: Send + 'static>(commands: &mpsc::Sender<Command<T>>, command: Command<T>) {
    if let Err(TrySendError::Full(command)) = commands.try_send(command) {
        if let Ok(handle) = Handle::try_current() {
            let commands = commands.clone();
            handle.spawn(async move {
                let _ = commands.send(command).await;
            });
        }
    }
}

struct ChannelEntry<T> {
    id: u64,
    /// Bounded by the config's downstream limit plus one slot kept free for
    /// a terminal error.
    sender: mpsc::Sender<Delivery<T>>,
    piggyback_only: bool,
    /// No value or error has been sent to this entry by the current producer.
    awaits_dispatch: bool,
}

pub(crate) struct ChannelManager<T> {
    config: MulticastConfig,
    upstream: UpstreamFactory<T>,
    commands: mpsc::WeakSender<Command<T>>,
    channels: Vec<ChannelEntry<T>>,
    producer: Option<ProducerHandle>,
    next_producer_id: u64,
    /// Whether the current producer has dispatched anything yet.
    dispatched_value: bool,
    buffer: VecDeque<(T, Arc<DeliveryAck>)>,
    /// Ack of the last value when no buffer retains it.
    last_ack: Option<Arc<DeliveryAck>>,
}

impl<T> ChannelManager<T>
where
    T: Clone + Send + 'static,
{
    /// Start the actor on `handle` and return its command queue.
    pub(crate) fn spawn(
        handle: &Handle,
        config: MulticastConfig,
        upstream: UpstreamFactory<T>,
    ) -> mpsc::Sender<Command<T>> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let manager = Self {
            config,
            upstream,
            commands: tx.downgrade(),
            channels: Vec::new(),
            producer: None,
            next_producer_id: 0,
            dispatched_value: false,
            buffer: VecDeque::new(),
            last_ack: None,
        };
        handle.spawn(manager.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command<T>>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::AddDownstream {
                    id,
                    sender,
                    piggyback_only,
                } => self.add(id, sender, piggyback_only),
                Command::RemoveDownstream { id } => self.remove(id),
                Command::DispatchValue {
                    producer,
                    value,
                    ack,
                } => self.dispatch_value(producer, value, ack),
                Command::DispatchError { producer, error } => self.dispatch_error(producer, error),
                Command::UpstreamFinished { producer } => self.upstream_finished(producer),
                Command::Close => break,
            }
        }
        self.shutdown();
    }

    fn is_current(&self, producer: u64) -> bool {
        self.producer.as_ref().map(|p| p.id) == Some(producer)
    }

    fn activate_if_necessary(&mut self) {
        if self.producer.is_some() {
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let id = self.next_producer_id;
        self.next_producer_id += 1;
        self.dispatched_value = false;
        self.producer = Some(spawn_producer(id, &self.upstream, commands));
        debug!(producer = id, subscribers = self.channels.len(), "Started upstream producer");
    }

    fn cancel_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.cancel();
            debug!(producer = producer.id, "Cancelled upstream producer");
        }
        self.buffer.clear();
        if let Some(ack) = self.last_ack.take() {
            ack.complete();
        }
    }

    fn add(&mut self, id: u64, sender: mpsc::Sender<Delivery<T>>, piggyback_only: bool) {
        let mut entry = ChannelEntry {
            id,
            sender,
            piggyback_only,
            awaits_dispatch: true,
        };

        if self.buffer.is_empty() {
            if let Some(ack) = self.last_ack.take() {
                ack.complete();
            }
        } else {
            for (value, ack) in &self.buffer {
                if entry
                    .sender
                    .try_send(Delivery::Value(value.clone(), ack.token()))
                    .is_err()
                {
                    debug!(downstream = id, "Downstream left before replay");
                    return;
                }
                ack.require(1);
            }
            entry.awaits_dispatch = false;
        }

        self.channels.push(entry);
        debug!(
            downstream = id,
            piggyback_only = piggyback_only,
            subscribers = self.channels.len(),
            "Added downstream"
        );

        if !piggyback_only {
            self.activate_if_necessary();
        }
    }

    fn remove(&mut self, id: u64) {
        let before = self.channels.len();
        self.channels.retain(|entry| entry.id != id);
        if self.channels.len() == before {
            return;
        }
        debug!(downstream = id, subscribers = self.channels.len(), "Removed downstream");

        if self.channels.is_empty() && !self.config.keep_upstream_alive {
            self.cancel_producer();
        }
    }

    fn dispatch_value(&mut self, producer: u64, value: T, ack: Arc<DeliveryAck>) {
        if !self.is_current(producer) {
            ack.complete();
            return;
        }
        self.dispatched_value = true;

        if self.config.buffer_size > 0 {
            self.buffer.push_back((value.clone(), Arc::clone(&ack)));
            while self.buffer.len() > self.config.buffer_size {
                self.buffer.pop_front();
            }
        } else {
            self.last_ack = Some(Arc::clone(&ack));
        }

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for entry in &mut self.channels {
            // The value that fills a queue holds the producer until taken.
            let token = if entry.sender.capacity() <= 2 {
                ack.blocking_token()
            } else {
                ack.token()
            };
            match entry.sender.try_send(Delivery::Value(value.clone(), token)) {
                Ok(()) => {
                    entry.awaits_dispatch = false;
                    delivered += 1;
                }
                Err(TrySendError::Closed(_)) => disconnected.push(entry.id),
                Err(TrySendError::Full(_)) => {
                    warn!(downstream = entry.id, "Downstream queue overflowed; disconnecting");
                    disconnected.push(entry.id);
                }
            }
        }
        if delivered > 0 {
            ack.require(self.config.min_acks.min(delivered));
        }

        for id in disconnected {
            self.remove(id);
        }
    }

    /// Deliver a terminal error to every subscriber and end the session.
    /// The manager stays up so later subscribers start a fresh producer.
    fn dispatch_error(&mut self, producer: u64, error: StrataError) {
        if !self.is_current(producer) {
            return;
        }
        warn!(
            producer = producer,
            subscribers = self.channels.len(),
            error = %error,
            "Upstream failed"
        );
        for entry in self.channels.drain(..) {
            let _ = entry.sender.try_send(Delivery::Error(error.clone()));
        }
        self.producer = None;
        self.buffer.clear();
        self.last_ack = None;
    }

    fn upstream_finished(&mut self, producer: u64) {
        if !self.is_current(producer) {
            return;
        }

        let piggybacking = self.config.piggybacking_downstream;
        let dispatched = self.dispatched_value;
        let mut leftovers = Vec::new();
        let mut kept = Vec::new();

        for entry in self.channels.drain(..) {
            if entry.awaits_dispatch && dispatched && !entry.piggyback_only {
                // joined after the value went out; needs its own run
                leftovers.push(entry);
            } else if piggybacking {
                kept.push(ChannelEntry {
                    awaits_dispatch: true,
                    ..entry
                });
            }
            // otherwise dropping the sender ends that downstream
        }

        debug!(
            producer = producer,
            leftovers = leftovers.len(),
            piggybacked = kept.len(),
            "Upstream finished"
        );

        self.producer = None;
        self.buffer.clear();
        self.last_ack = None;
        let restart = !leftovers.is_empty();
        self.channels = leftovers;
        self.channels.extend(kept);
        if restart {
            self.activate_if_necessary();
        }
    }

    fn shutdown(&mut self) {
        debug!(subscribers = self.channels.len(), "Channel manager closed");
        self.channels.clear();
        self.cancel_producer();
    }
}
