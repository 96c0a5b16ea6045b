//! Broadcast bus for log and metric records.
//!
//! Every subscriber sees every record published after it subscribed. A slow
//! subscriber that falls more than `capacity` records behind skips the oldest
//! ones; the skip is logged. Closing the bus ends all subscriber streams.

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY: usize = 1024;

pub type BusStream<T> = BoxStream<'static, T>;

#[derive(Clone)]
pub struct Bus<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
    closed: CancellationToken,
}

impl<T> Bus<T>
where
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Publishes to current subscribers. Records published without subscribers,
    /// or after close, are dropped.
    pub fn publish(&self, item: T) {
        if self.closed.is_cancelled() {
            return;
        }
        // Err only means nobody is listening.
        _ = self.tx.send(item);
    }

    #[must_use]
    pub fn subscribe(&self) -> BusStream<T> {
        let name = self.name;
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |item| async move {
                match item {
                    Ok(item) => Some(item),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(bus = name, skipped, "bus subscriber lagged; records skipped");
                        None
                    }
                }
            })
            .take_until(self.closed.clone().cancelled_owned())
            .boxed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
