//! Shared helpers for the test suites: a settable clock and a channel-backed
//! entry collector.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::stream::{Entry, EntryResponse, IdxTs, StreamEntry, StreamSubscriber};
use crate::time::TimeSource;

/// A clock tests drive by hand.
#[derive(Clone)]
pub struct TestClock {
    now_us: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }
}

impl TimeSource for TestClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Subscriber that forwards every delivered entry into a channel.
pub struct EntryCollector<E> {
    sender: Sender<Entry<E>>,
    _entry: PhantomData<fn() -> E>,
}

/// Builds a collector plus the receiving end tests assert on.
pub fn entry_collector<E: StreamEntry>() -> (EntryCollector<E>, Receiver<Entry<E>>) {
    let (sender, receiver) = unbounded();
    (
        EntryCollector {
            sender,
            _entry: PhantomData,
        },
        receiver,
    )
}

impl<E: StreamEntry> StreamSubscriber<E> for EntryCollector<E> {
    fn on_entry(&mut self, entry: Entry<E>, _last: IdxTs) -> EntryResponse {
        if self.sender.send(entry).is_err() {
            return EntryResponse::Done;
        }
        EntryResponse::More
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_on_demand() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now_us(), 100);
        clock.advance_us(50);
        assert_eq!(clock.now_us(), 150);
        clock.set_us(10);
        assert_eq!(clock.now_us(), 10);
    }
}
