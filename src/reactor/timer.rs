//! `Timer`, the public handle type, and the reactor's internal timer wheel.
//!
//! The wheel is a `BinaryHeap` ordered by deadline rather than a hashed
//! timing wheel — with tens to low thousands of timers
//! (one per `Timer` handle, a handful per `BacklogWithTimeout` bucket set)
//! a heap's `O(log n)` insert/pop is simpler and plenty fast, and it lets the
//! reactor compute its `mio::Poll::poll` timeout directly from the next
//! deadline instead of ticking a fixed-period OS timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::reactor::Reactor;
use crate::removable::{Removable, RemovalState};

pub(crate) struct TimerEntry {
    pub id: u64,
    pub repeat: Option<Duration>,
    pub callback: Box<dyn FnMut(&Reactor)>,
}

pub(crate) struct TimerWheel {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerEntry>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            deadlines: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(
        &mut self,
        id: u64,
        deadline: Instant,
        repeat: Option<Duration>,
        callback: Box<dyn FnMut(&Reactor)>,
    ) {
        self.deadlines.push(Reverse((deadline, id)));
        self.entries.insert(
            id,
            TimerEntry {
                id,
                repeat,
                callback,
            },
        );
    }

    pub fn remove(&mut self, id: u64) {
        // The heap entry is left in place (a "tombstone"); `take_due` skips
        // it once it finds the id missing from `entries`.
        self.entries.remove(&id);
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.peek().map(|Reverse((deadline, _))| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    /// Pops and returns every entry whose deadline is `<= now`, leaving
    /// entries with a later deadline (or tombstoned/removed entries) behind.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(entry) = self.entries.remove(&id) {
                due.push(entry);
            }
        }
        due
    }
}

struct TimerInner {
    reactor: Reactor,
    timer_id: std::cell::Cell<Option<u64>>,
    removal: Rc<RemovalState>,
}

/// A stoppable, optionally repeating timer handle.
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn new(reactor: &Reactor) -> Timer {
        Timer {
            inner: Rc::new(TimerInner {
                reactor: reactor.clone(),
                timer_id: std::cell::Cell::new(None),
                removal: Rc::new(RemovalState::new()),
            }),
        }
    }

    /// Starts (or restarts) the timer. `repeat`, if set, re-arms the timer
    /// with that interval after each firing.
    pub fn start(
        &self,
        timeout: Duration,
        repeat: Option<Duration>,
        mut on_timeout: impl FnMut(&Reactor) + 'static,
    ) -> Result<(), Error> {
        self.stop();
        let inner = Rc::clone(&self.inner);
        let id = self.inner.reactor.raw_set_timer(
            timeout,
            repeat,
            Box::new(move |reactor| {
                on_timeout(reactor);
                let _ = &inner;
            }),
        );
        self.inner.timer_id.set(Some(id));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(id) = self.inner.timer_id.take() {
            self.inner.reactor.raw_clear_timer(id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.timer_id.get().is_some()
    }
}

impl Removable for Timer {
    fn schedule_removal(&self) {
        let inner = Rc::clone(&self.inner);
        self.inner.removal.schedule(&self.inner.reactor.clone(), move || {
            inner.timer_id.take().map(|id| inner.reactor.raw_clear_timer(id));
        });
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.inner.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.inner.removal.is_scheduled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn stop_prevents_firing() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = Rc::clone(&fired);
        let timer = Timer::new(&reactor);
        timer
            .start(Duration::from_millis(5), None, move |_| {
                *fired2.borrow_mut() = true;
            })
            .unwrap();
        timer.stop();
        reactor.run().unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn repeat_fires_multiple_times() {
        let reactor = Reactor::new().unwrap();
        let count = Rc::new(RefCell::new(0));
        let count2 = Rc::clone(&count);
        let timer = Timer::new(&reactor);
        let r2 = reactor.clone();
        let timer_rc = Rc::new(timer);
        let timer_for_cb = Rc::clone(&timer_rc);
        timer_rc
            .start(Duration::from_millis(2), Some(Duration::from_millis(2)), move |_| {
                *count2.borrow_mut() += 1;
                if *count2.borrow() >= 3 {
                    timer_for_cb.stop();
                    r2.stop_block_loop_from_exit();
                }
            })
            .unwrap();
        reactor.start_block_loop_from_exit();
        reactor.run().unwrap();
        assert_eq!(*count.borrow(), 3);
    }
}
