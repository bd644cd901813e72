//! Bounded, never-blocking hand-off queue for visualization payloads.
//!
//! Payloads are delivered in send order. When the queue is full the sender
//! drops either the new payload or the oldest queued one, per [`DropPolicy`].

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropPolicy {
    DropNewest,
    DropOldest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    DroppedNewest,
    DroppedOldest,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelCapacity(NonZeroUsize);

impl ChannelCapacity {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self(capacity)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelCapacityError {
    #[error("channel capacity must be > 0")]
    Zero,
}

impl TryFrom<usize> for ChannelCapacity {
    type Error = ChannelCapacityError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        NonZeroUsize::new(value)
            .map(ChannelCapacity)
            .ok_or(ChannelCapacityError::Zero)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub enqueued: u64,
    pub dropped_newest: u64,
    pub dropped_oldest: u64,
    pub disconnected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped_newest: AtomicU64,
    dropped_oldest: AtomicU64,
    disconnected: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: SendOutcome) -> SendOutcome {
        let counter = match outcome {
            SendOutcome::Enqueued => &self.enqueued,
            SendOutcome::DroppedNewest => &self.dropped_newest,
            SendOutcome::DroppedOldest => &self.dropped_oldest,
            SendOutcome::Disconnected => &self.disconnected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_newest: self.dropped_newest.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelStatsHandle {
    counters: Arc<Counters>,
}

impl ChannelStatsHandle {
    pub fn snapshot(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

#[derive(Debug)]
pub struct DropSender<T> {
    tx: Sender<T>,
    // Lets the sender evict the head of the queue under `DropOldest`.
    evict_rx: Receiver<T>,
    policy: DropPolicy,
    counters: Arc<Counters>,
}

impl<T> DropSender<T> {
    pub fn try_send(&self, value: T) -> SendOutcome {
        let value = match self.tx.try_send(value) {
            Ok(()) => return self.counters.record(SendOutcome::Enqueued),
            Err(TrySendError::Disconnected(_)) => {
                return self.counters.record(SendOutcome::Disconnected)
            }
            Err(TrySendError::Full(value)) => value,
        };
        if self.policy == DropPolicy::DropNewest {
            return self.counters.record(SendOutcome::DroppedNewest);
        }
        match self.evict_rx.try_recv() {
            Ok(_) => {
                self.counters.record(SendOutcome::DroppedOldest);
            }
            // Drained by the consumer in the meantime; retry below.
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                return self.counters.record(SendOutcome::Disconnected)
            }
        }
        match self.tx.try_send(value) {
            Ok(()) => self.counters.record(SendOutcome::Enqueued),
            Err(TrySendError::Full(_)) => self.counters.record(SendOutcome::DroppedNewest),
            Err(TrySendError::Disconnected(_)) => self.counters.record(SendOutcome::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[derive(Debug)]
pub struct DropReceiver<T> {
    rx: Receiver<T>,
}

impl<T> DropReceiver<T> {
    pub fn recv(&self) -> Result<T, crossbeam_channel::RecvError> {
        self.rx.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn try_iter(&self) -> crossbeam_channel::TryIter<'_, T> {
        self.rx.try_iter()
    }
}

pub fn bounded_channel<T>(
    capacity: ChannelCapacity,
    policy: DropPolicy,
) -> (DropSender<T>, DropReceiver<T>, ChannelStatsHandle) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.get());
    let counters = Arc::new(Counters::default());
    let sender = DropSender {
        tx,
        evict_rx: rx.clone(),
        policy,
        counters: Arc::clone(&counters),
    };
    (sender, DropReceiver { rx }, ChannelStatsHandle { counters })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(n: usize) -> ChannelCapacity {
        ChannelCapacity::try_from(n).expect("capacity")
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(ChannelCapacity::try_from(0), Err(ChannelCapacityError::Zero));
    }

    #[test]
    fn drop_newest_keeps_queued_payloads() {
        let (tx, rx, stats) = bounded_channel(capacity(2), DropPolicy::DropNewest);
        assert_eq!(tx.try_send(1), SendOutcome::Enqueued);
        assert_eq!(tx.try_send(2), SendOutcome::Enqueued);
        assert_eq!(tx.try_send(3), SendOutcome::DroppedNewest);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.dropped_newest, 1);
    }

    #[test]
    fn drop_oldest_keeps_latest_in_order() {
        let (tx, rx, stats) = bounded_channel(capacity(2), DropPolicy::DropOldest);
        for value in 1..=4 {
            tx.try_send(value);
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(stats.snapshot().dropped_oldest, 2);
    }
}
