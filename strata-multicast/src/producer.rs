//! The upstream side: one task that drains the upstream stream into the
//! channel manager, waiting for acknowledgement after every value.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use strata_core::StrataResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ack::DeliveryAck;
use crate::manager::Command;

/// Creates a fresh upstream stream each time a producer starts.
pub type UpstreamFactory<T> = Arc<dyn Fn() -> BoxStream<'static, StrataResult<T>> + Send + Sync>;

pub(crate) struct ProducerHandle {
    pub(crate) id: u64,
    task: JoinHandle<()>,
}

impl ProducerHandle {
    /// Abort the producer task, dropping the upstream stream at its next
    /// suspension point.
    pub(crate) fn cancel(&self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_producer<T>(
    id: u64,
    upstream: &UpstreamFactory<T>,
    commands: mpsc::Sender<Command<T>>,
) -> ProducerHandle
where
    T: Send + 'static,
{
    let mut stream = upstream();
    let task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => {
                    let ack = DeliveryAck::new();
                    let command = Command::DispatchValue {
                        producer: id,
                        value,
                        ack: Arc::clone(&ack),
                    };
                    if commands.send(command).await.is_err() {
                        return;
                    }
                    ack.wait().await;
                }
                Err(error) => {
                    let _ = commands
                        .send(Command::DispatchError {
                            producer: id,
                            error,
                        })
                        .await;
                    break;
                }
            }
        }
        debug!(producer = id, "Upstream exhausted");
        let _ = commands.send(Command::UpstreamFinished { producer: id }).await;
    });
    ProducerHandle { id, task }
}
