//! `BacklogWithTimeout<T>`, the bucketed expiration structure backing UDP
//! destination/peer inactivity timeouts.
//!
//! Items are kept in `⌈log2(timeout_ms)⌉ + 1` buckets, one per
//! `Timer`, with periods `timeout_ms, timeout_ms/2, timeout_ms/4, …, 1`ms.
//! An item lives in the bucket whose period is the largest power of two not
//! exceeding its remaining life; each bucket's timer rescans its own
//! contents on every tick, expiring or redistributing them by current
//! remaining life. This bounds the number of timers to `log2(timeout_ms)`
//! regardless of how many items are tracked, at the cost of expiration
//! accuracy within 2x of `timeout_ms` — a deliberate tradeoff, not a bug.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::reactor::{Reactor, Timer};

/// Opaque handle returned by [`BacklogWithTimeout::add_item`] for later use
/// with [`BacklogWithTimeout::remove_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BacklogKey(u64);

/// What happened when an item was added.
#[derive(Debug)]
pub enum AddOutcome {
    /// The item's age already met or exceeded the timeout; `on_expired` ran
    /// synchronously and the backlog is still alive.
    ExpiredImmediately,
    /// Same as above, but running `on_expired` caused the backlog itself to
    /// be stopped (e.g. the owning endpoint closed) — the "stopped inside
    /// the callback" case.
    ExpiredAndStopped,
    /// `time_getter(&t)` is later than the current clock reading; rejected.
    RejectedFromFuture,
    /// Enqueued into a bucket; use the key to `remove_item` later.
    Enqueued(BacklogKey),
}

struct Entry<T> {
    key: u64,
    born: u64,
    value: T,
}

struct Inner<T> {
    timeout_ms: u64,
    buckets: Vec<VecDeque<Entry<T>>>,
    next_key: u64,
    stopped: bool,
    time_getter: Box<dyn Fn(&T) -> u64>,
    clock: Box<dyn Fn() -> u64>,
    on_expired: Box<dyn FnMut(T)>,
}

impl<T> Inner<T> {
    /// Index of the bucket whose period is the largest power of two
    /// `<= remaining`, clamped into range.
    fn bucket_for_remaining(&self, remaining: u64) -> usize {
        let top = self.buckets.len() - 1;
        if remaining == 0 {
            return top;
        }
        let mut period = self.timeout_ms;
        let mut idx = 0;
        while idx < top && period / 2 >= remaining.max(1) {
            period /= 2;
            idx += 1;
        }
        idx.min(top)
    }
}

/// Bucketed expiration structure: see module docs.
pub struct BacklogWithTimeout<T> {
    inner: Rc<RefCell<Inner<T>>>,
    // Keeps the per-bucket repeating timers alive; dropping this drops them.
    timers: Vec<Timer>,
}

fn bucket_count(timeout_ms: u64) -> usize {
    if timeout_ms <= 1 {
        return 1;
    }
    (64 - (timeout_ms - 1).leading_zeros()) as usize + 1
}

impl<T: 'static> BacklogWithTimeout<T> {
    /// `timeout_ms`: inactivity window. `time_getter` reads an item's own
    /// "last seen" timestamp in the same units `clock` returns. Both clock
    /// and time_getter are injected (rather than reading `Instant::now()`
    /// directly) so tests can drive a manual clock.
    pub fn new(
        reactor: &Reactor,
        timeout_ms: u64,
        on_expired: impl FnMut(T) + 'static,
        time_getter: impl Fn(&T) -> u64 + 'static,
        clock: impl Fn() -> u64 + 'static,
    ) -> BacklogWithTimeout<T> {
        let count = bucket_count(timeout_ms.max(1));
        let inner = Rc::new(RefCell::new(Inner {
            timeout_ms: timeout_ms.max(1),
            buckets: (0..count).map(|_| VecDeque::new()).collect(),
            next_key: 0,
            stopped: false,
            time_getter: Box::new(time_getter),
            clock: Box::new(clock),
            on_expired: Box::new(on_expired),
        }));

        let mut timers = Vec::with_capacity(count);
        for i in 0..count {
            let period_ms = (timeout_ms.max(1) >> i).max(1);
            let timer = Timer::new(reactor);
            let inner_cloned = Rc::clone(&inner);
            let period = std::time::Duration::from_millis(period_ms);
            timer
                .start(period, Some(period), move |_reactor| {
                    scan_bucket(&inner_cloned, i);
                })
                .expect("starting a bucket timer cannot fail");
            timers.push(timer);
        }

        BacklogWithTimeout { inner, timers }
    }

    /// Adds `t` to the backlog, or expires it immediately if it's already
    /// past due. See [`AddOutcome`] for the exact cases.
    pub fn add_item(&self, t: T) -> AddOutcome {
        let (now, item_time, timeout_ms) = {
            let inner = self.inner.borrow();
            let now = (inner.clock)();
            let item_time = (inner.time_getter)(&t);
            (now, item_time, inner.timeout_ms)
        };

        if now < item_time {
            return AddOutcome::RejectedFromFuture;
        }

        let age = now - item_time;
        if age >= timeout_ms {
            let mut inner = self.inner.borrow_mut();
            (inner.on_expired)(t);
            return if inner.stopped {
                AddOutcome::ExpiredAndStopped
            } else {
                AddOutcome::ExpiredImmediately
            };
        }

        let mut inner = self.inner.borrow_mut();
        let remaining = timeout_ms - age;
        let idx = inner.bucket_for_remaining(remaining);
        let key = inner.next_key;
        inner.next_key += 1;
        inner.buckets[idx].push_back(Entry {
            key,
            born: item_time,
            value: t,
        });
        AddOutcome::Enqueued(BacklogKey(key))
    }

    /// Removes the item identified by `key` before it expires. Returns
    /// `true` if it was found and removed, `false` if it already expired or
    /// was never present — no item both expires and is observed by
    /// `remove_item == true` thereafter.
    pub fn remove_item(&self, key: BacklogKey) -> bool {
        let mut inner = self.inner.borrow_mut();
        for bucket in &mut inner.buckets {
            if let Some(pos) = bucket.iter().position(|e| e.key == key.0) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops all bucket timers and drops every tracked item without firing
    /// `on_expired` for them. Called when the owning endpoint closes.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.stopped = true;
        for bucket in &mut inner.buckets {
            bucket.clear();
        }
    }
}

fn scan_bucket<T>(inner: &Rc<RefCell<Inner<T>>>, bucket_idx: usize) {
    let entries = {
        let mut guard = inner.borrow_mut();
        if guard.stopped {
            return;
        }
        std::mem::take(&mut guard.buckets[bucket_idx])
    };

    for entry in entries {
        let (now, timeout_ms) = {
            let guard = inner.borrow();
            ((guard.clock)(), guard.timeout_ms)
        };
        let age = now.saturating_sub(entry.born);
        if age >= timeout_ms {
            let mut guard = inner.borrow_mut();
            if guard.stopped {
                return;
            }
            (guard.on_expired)(entry.value);
        } else {
            let mut guard = inner.borrow_mut();
            if guard.stopped {
                return;
            }
            let remaining = timeout_ms - age;
            let new_idx = guard.bucket_for_remaining(remaining);
            guard.buckets[new_idx].push_back(Entry {
                key: entry.key,
                born: entry.born,
                value: entry.value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn expires_immediately_when_already_past_due() {
        let reactor = Reactor::new().unwrap();
        let expired = Rc::new(RefCell::new(Vec::new()));
        let expired2 = Rc::clone(&expired);
        let backlog = BacklogWithTimeout::new(
            &reactor,
            100,
            move |item: i32| expired2.borrow_mut().push(item),
            |item: &i32| *item as u64,
            || 500,
        );
        match backlog.add_item(42) {
            AddOutcome::ExpiredImmediately => {}
            other => panic!("expected ExpiredImmediately, got {other:?}"),
        }
        assert_eq!(*expired.borrow(), vec![42]);
    }

    #[test]
    fn remove_item_prevents_later_expiration() {
        let reactor = Reactor::new().unwrap();
        let expired = Rc::new(RefCell::new(Vec::new()));
        let expired2 = Rc::clone(&expired);
        let clock = Rc::new(Cell::new(0u64));
        let clock_for_backlog = Rc::clone(&clock);
        let backlog = BacklogWithTimeout::new(
            &reactor,
            250,
            move |item: i32| expired2.borrow_mut().push(item),
            |item: &i32| *item as u64,
            move || clock_for_backlog.get(),
        );
        let key = match backlog.add_item(7) {
            AddOutcome::Enqueued(key) => key,
            other => panic!("expected Enqueued, got {other:?}"),
        };
        assert!(backlog.remove_item(key));
        assert!(!backlog.remove_item(key), "second removal must fail");
        clock.set(1000);
        assert!(expired.borrow().is_empty());
    }

    #[test]
    fn rejects_items_from_the_future() {
        let reactor = Reactor::new().unwrap();
        let backlog = BacklogWithTimeout::new(
            &reactor,
            100,
            |_: i32| {},
            |item: &i32| *item as u64,
            || 10,
        );
        match backlog.add_item(9_999) {
            AddOutcome::RejectedFromFuture => {}
            other => panic!("expected RejectedFromFuture, got {other:?}"),
        }
    }

    #[test]
    fn bucket_tick_expires_item_after_timeout() {
        let reactor = Reactor::new().unwrap();
        let expired = Rc::new(RefCell::new(Vec::new()));
        let expired2 = Rc::clone(&expired);
        let start = std::time::Instant::now();
        let backlog = BacklogWithTimeout::new(
            &reactor,
            20,
            move |item: i32| expired2.borrow_mut().push(item),
            |item: &i32| *item as u64,
            move || start.elapsed().as_millis() as u64,
        );
        match backlog.add_item(1) {
            AddOutcome::Enqueued(_) => {}
            other => panic!("expected Enqueued, got {other:?}"),
        }
        let r2 = reactor.clone();
        let timer = Timer::new(&reactor);
        timer
            .start(std::time::Duration::from_millis(200), None, move |_| {
                r2.stop_block_loop_from_exit();
            })
            .unwrap();
        reactor.start_block_loop_from_exit();
        reactor.run().unwrap();
        assert_eq!(*expired.borrow(), vec![1]);
    }
}
