use crate::errors::{Result, StreamError};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Which end of the queue a consumer takes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOrder {
    Oldest,
    Newest,
    /// The newest entry; everything older is discarded and counted as dropped.
    Latest,
}

/// Fixed-capacity frame queue. Producers never block: when full, the oldest
/// entry is evicted. Consumers block (bounded by a timeout) until an entry
/// is present or the queue is closed.
///
/// With capacity 1 this is a latest-wins slot.
pub struct FrameQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                dropped: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("lock poisoned").capacity
    }

    /// Returns `false` if the queue is closed and the item was discarded.
    pub fn push_drop_oldest(&self, item: T) -> bool {
        let mut g = self.inner.lock().expect("lock poisoned");
        if g.closed {
            return false;
        }

        if g.items.len() >= g.capacity {
            g.items.pop_front();
            g.dropped = g.dropped.saturating_add(1);
        }
        g.items.push_back(item);
        self.cv.notify_all();
        true
    }

    /// Take an entry, waiting up to `timeout`. `Ok(None)` on timeout.
    pub fn pop_timeout(&self, order: PopOrder, timeout: Duration) -> Result<Option<T>> {
        let mut g = self.inner.lock().expect("lock poisoned");

        let deadline = Instant::now() + timeout;
        loop {
            let item = match order {
                PopOrder::Oldest => g.items.pop_front(),
                PopOrder::Newest => g.items.pop_back(),
                PopOrder::Latest => {
                    let newest = g.items.pop_back();
                    let stale = g.items.len() as u64;
                    g.items.clear();
                    g.dropped = g.dropped.saturating_add(stale);
                    newest
                }
            };
            if let Some(item) = item {
                return Ok(Some(item));
            }
            if g.closed {
                return Err(StreamError::StaleDataTimeout("frame source closed".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (ng, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .expect("lock poisoned");
            g = ng;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").closed
    }

    pub fn close(&self) {
        let mut g = self.inner.lock().expect("lock poisoned");
        g.closed = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drop_oldest_when_full() {
        let q = FrameQueue::new(3);
        for i in 0..5 {
            assert!(q.push_drop_oldest(i));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.pop_timeout(PopOrder::Oldest, Duration::ZERO).unwrap(), Some(2));
        assert_eq!(q.pop_timeout(PopOrder::Newest, Duration::ZERO).unwrap(), Some(4));
    }

    #[test]
    fn test_single_slot_is_latest_wins() {
        let q = FrameQueue::new(1);
        q.push_drop_oldest("old");
        q.push_drop_oldest("new");
        assert_eq!(
            q.pop_timeout(PopOrder::Oldest, Duration::ZERO).unwrap(),
            Some("new")
        );
    }

    #[test]
    fn test_latest_discards_backlog() {
        let q = FrameQueue::new(8);
        for i in 1..=4 {
            q.push_drop_oldest(i);
        }
        assert_eq!(q.pop_timeout(PopOrder::Latest, Duration::ZERO).unwrap(), Some(4));
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 3);
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let q: FrameQueue<u8> = FrameQueue::new(2);
        let start = Instant::now();
        assert_eq!(
            q.pop_timeout(PopOrder::Newest, Duration::from_millis(30)).unwrap(),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let q = Arc::new(FrameQueue::new(1));
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.push_drop_oldest(7u32);
            })
        };
        let got = q.pop_timeout(PopOrder::Newest, Duration::from_secs(5)).unwrap();
        assert_eq!(got, Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn test_closed_queue_errors_and_rejects() {
        let q = FrameQueue::new(2);
        q.close();
        assert!(!q.push_drop_oldest(1));
        assert!(q.pop_timeout(PopOrder::Oldest, Duration::from_millis(10)).is_err());
    }
}
