//! Combined progress feed over every running stage

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamMap;
use tokio_stream::wrappers::{ReceiverStream, WatchStream};

use crate::progress::Progress;
use crate::types::StageKey;

/// Buffered `(StageKey, Progress)` pairs per subscriber
const FAN_IN_BUFFER: usize = 256;

type Running = HashMap<StageKey, watch::Receiver<Progress<()>>>;

/// Registry of running stages and their progress feeds
///
/// The registry is itself a `watch` channel, so subscribers learn about stages
/// starting and finishing without polling.
#[derive(Debug)]
pub struct ProgressHub {
    registry: watch::Sender<Running>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    /// Empty hub
    pub fn new() -> Self {
        Self {
            registry: watch::Sender::new(HashMap::new()),
        }
    }

    /// Register a stage feed starting at `initial`
    ///
    /// The stage stays registered until the returned feed is dropped.
    pub fn register(self: &Arc<Self>, key: StageKey, initial: Progress<()>) -> ProgressFeed {
        let (tx, rx) = watch::channel(initial);
        self.registry.send_modify(|running| {
            running.insert(key.clone(), rx.clone());
        });
        ProgressFeed {
            key,
            tx,
            own: rx,
            hub: Arc::clone(self),
        }
    }

    /// Keys of the stages currently registered
    pub fn running(&self) -> Vec<StageKey> {
        self.registry.borrow().keys().cloned().collect()
    }

    fn unregister(&self, key: &StageKey, feed: &watch::Receiver<Progress<()>>) {
        self.registry.send_if_modified(|running| {
            // A newer run of the same stage may have taken the slot
            match running.get(key) {
                Some(rx) if rx.same_channel(feed) => {
                    running.remove(key);
                    true
                }
                _ => false,
            }
        });
    }

    /// Stream of the latest progress value of every running stage
    ///
    /// Values of one stage are coalesced: a slow subscriber sees the newest
    /// value, never a backlog. The stream ends when the hub is dropped.
    pub fn subscribe(&self) -> ReceiverStream<(StageKey, Progress<()>)> {
        let (tx, rx) = mpsc::channel(FAN_IN_BUFFER);
        let registry = self.registry.subscribe();
        tokio::spawn(fan_in(registry, tx));
        ReceiverStream::new(rx)
    }
}

async fn fan_in(
    mut registry: watch::Receiver<Running>,
    tx: mpsc::Sender<(StageKey, Progress<()>)>,
) {
    let mut streams: StreamMap<StageKey, WatchStream<Progress<()>>> = StreamMap::new();
    let mut known: Running = HashMap::new();

    loop {
        {
            let running = registry.borrow_and_update();
            known.retain(|key, _| running.contains_key(key));
            for (key, rx) in running.iter() {
                let fresh = known.get(key).is_none_or(|seen| !seen.same_channel(rx));
                if fresh {
                    known.insert(key.clone(), rx.clone());
                    streams.insert(key.clone(), WatchStream::new(rx.clone()));
                }
            }
        }

        tokio::select! {
            changed = registry.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some((key, value)) = streams.next(), if !streams.is_empty() => {
                if tx.send((key, value)).await.is_err() {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}

/// Publishing end of one stage's progress feed
///
/// Dropping the feed unregisters the stage; subscribers still receive the
/// last published value.
#[derive(Debug)]
pub struct ProgressFeed {
    key: StageKey,
    tx: watch::Sender<Progress<()>>,
    own: watch::Receiver<Progress<()>>,
    hub: Arc<ProgressHub>,
}

impl ProgressFeed {
    /// Publish a new value
    pub fn publish(&self, value: Progress<()>) {
        self.tx.send_replace(value);
    }
}

impl Drop for ProgressFeed {
    fn drop(&mut self) {
        self.hub.unregister(&self.key, &self.own);
    }
}
