//! Broadcast hub between the simulation driver and client sessions.
//!
//! Each subscriber owns a small bounded channel of encoded frames. The pump
//! task forwards every driver snapshot to all subscribers without ever
//! blocking: when a subscriber's queue is full the newest frame is dropped
//! for that subscriber only (frames are full snapshots, a later one always
//! supersedes). The most recent frame is cached so late joiners start with a
//! picture of the world.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of each subscriber's frame queue.
const SUBSCRIBER_QUEUE: usize = 4;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Bytes>>,
    last: Option<Bytes>,
}

#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. Its first frame is the cached last
    /// snapshot when one exists. The subscription deregisters itself when
    /// dropped.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.lock_inner();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(last) = &inner.last {
            // Fresh channel, cannot be full.
            let _ = tx.try_send(last.clone());
        }
        inner.subscribers.insert(id, tx);
        debug!(subscriber = id, "subscriber registered");
        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// The most recently published frame, if any.
    pub fn last_snapshot(&self) -> Option<Bytes> {
        self.lock_inner().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_inner().subscribers.len()
    }

    /// Pump task: forwards driver snapshots to all subscribers until the
    /// driver channel closes or the token is cancelled.
    pub async fn run(self: Arc<Self>, mut frames: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = frames.recv() => match frame {
                    Some(frame) => self.broadcast(frame),
                    None => return,
                },
            }
        }
    }

    fn broadcast(&self, frame: Bytes) {
        let mut inner = self.lock_inner();
        inner.last = Some(frame.clone());
        for (id, tx) in &inner.subscribers {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "slow subscriber; dropping frame");
                }
                // The session is tearing down; its Drop will deregister.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    fn remove(&self, id: u64) {
        self.lock_inner().subscribers.remove(&id);
        debug!(subscriber = id, "subscriber removed");
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().expect("hub mutex poisoned")
    }
}

/// One session's handle on the hub.
pub struct Subscription {
    id: u64,
    hub: Arc<Hub>,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag])
    }

    #[tokio::test]
    async fn late_subscriber_receives_last_snapshot_first() {
        let hub = Arc::new(Hub::new());
        let mut early = hub.subscribe();
        hub.broadcast(frame(1));
        assert_eq!(early.recv().await, Some(frame(1)));

        let mut late = hub.subscribe();
        assert_eq!(late.recv().await, Some(frame(1)));

        hub.broadcast(frame(2));
        assert_eq!(early.recv().await, Some(frame(2)));
        assert_eq!(late.recv().await, Some(frame(2)));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_newest_without_blocking_others() {
        let hub = Arc::new(Hub::new());
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for tag in 0..6 {
            hub.broadcast(frame(tag));
            assert_eq!(fast.recv().await, Some(frame(tag)));
        }

        // The slow queue kept only the oldest four frames.
        for tag in 0..4 {
            assert_eq!(slow.rx.try_recv().ok(), Some(frame(tag)));
        }
        assert!(slow.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_are_delivered_in_publish_order() {
        let hub = Arc::new(Hub::new());
        let mut sub = hub.subscribe();
        for tag in 0..4 {
            hub.broadcast(frame(tag));
        }
        for tag in 0..4 {
            assert_eq!(sub.recv().await, Some(frame(tag)));
        }
    }

    #[tokio::test]
    async fn dropping_a_subscription_deregisters_it() {
        let hub = Arc::new(Hub::new());
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn pump_ends_when_driver_channel_closes() {
        let hub = Arc::new(Hub::new());
        let (tx, rx) = mpsc::channel(2);
        let pump = tokio::spawn(Arc::clone(&hub).run(rx, CancellationToken::new()));

        let mut sub = hub.subscribe();
        tx.send(frame(9)).await.unwrap();
        assert_eq!(sub.recv().await, Some(frame(9)));
        assert_eq!(hub.last_snapshot(), Some(frame(9)));

        drop(tx);
        pump.await.unwrap();
    }
}
