//! Bounded hand-off primitives between the loops and streaming consumers.
//!
//! None of these ever block the producer:
//! - `LatestSlot` keeps only the newest value
//! - `FrameQueue` evicts the oldest buffered item when full
//! - `MetricsQueue` discards the incoming item when full and counts it
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel as xch;
use tracing::{debug, trace};

/// Single-slot overwrite cell.
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T: Clone> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, value: T) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Copy of the newest value, if any was ever stored.
    pub fn latest(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Bounded queue that replaces the oldest entry instead of blocking.
#[derive(Debug, Clone)]
pub struct FrameQueue<T> {
    tx: xch::Sender<T>,
    rx: xch::Receiver<T>,
    replaced: Arc<AtomicU64>,
}

impl<T> FrameQueue<T> {
    /// Capacity 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = xch::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            replaced: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, mut item: T) {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(xch::TrySendError::Full(back)) => {
                    // A consumer may have drained in between; either way retry.
                    if self.rx.try_recv().is_ok() {
                        self.replaced.fetch_add(1, Ordering::Relaxed);
                        trace!("frame queue full; oldest entry replaced");
                    }
                    item = back;
                }
                Err(xch::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Receiving end for consumers. Clones share the same buffer.
    pub fn receiver(&self) -> xch::Receiver<T> {
        self.rx.clone()
    }

    /// Newest buffered item, draining the rest.
    pub fn latest(&self) -> Option<T> {
        self.rx.try_iter().last()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

/// Bounded queue that drops new entries when full.
#[derive(Debug, Clone)]
pub struct MetricsQueue<T> {
    tx: xch::Sender<T>,
    rx: xch::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> MetricsQueue<T> {
    /// Capacity 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = xch::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns false when the item was dropped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped = n, "metrics queue full; newest entry dropped");
                false
            }
        }
    }

    pub fn receiver(&self) -> xch::Receiver<T> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_overwrites() {
        let slot = LatestSlot::new();
        assert_eq!(slot.latest(), None::<u32>);
        slot.store(1);
        slot.store(2);
        assert_eq!(slot.latest(), Some(2));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.latest(), None);
    }

    #[test]
    fn metrics_queue_drops_newest() {
        let q = MetricsQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.dropped(), 1);
        let got: Vec<_> = q.receiver().try_iter().collect();
        assert_eq!(got, vec![1, 2]);
    }
}
