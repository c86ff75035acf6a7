//! The single-threaded reactor: the scheduler for all asynchronous work in
//! this crate. Built directly on `mio::{Poll, Events, Token, Interest,
//! Waker}` the way `tokio`'s own reactor is — this crate is the
//! callback-driven layer `mio` deliberately does not provide.

mod signal;
mod timer;
mod work;

pub use signal::SignalHandlerId;
pub use timer::Timer;
pub use work::WorkHandle;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::error::Error;
use timer::TimerWheel;
use work::WorkPool;

/// Reserved tokens for the reactor's own wake/work/signal sources, kept out
/// of the range handed out to registered I/O handles.
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const WORK_TOKEN: Token = Token(usize::MAX - 2);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 3);

/// Readiness bits captured out of a `mio::event::Event` before releasing the
/// borrow on `Events`, so handler callbacks are free to re-borrow reactor
/// state (including re-registering themselves) without a `RefCell` panic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(e: &mio::event::Event) -> Readiness {
        Readiness {
            readable: e.is_readable(),
            writable: e.is_writable(),
            read_closed: e.is_read_closed(),
            write_closed: e.is_write_closed(),
            error: e.is_error(),
        }
    }
}

/// Implemented by every handle that registers raw I/O with the reactor
/// (TCP/UDP sockets). Stored as a type-erased `Rc<dyn IoHandler>` in the
/// reactor's token table.
pub trait IoHandler {
    fn on_ready(&self, reactor: &Reactor, readiness: Readiness);
}

/// The `Send + Sync` half of the reactor: a cross-thread FIFO plus a waker,
/// split out of `Reactor` itself (which holds `RefCell`s and is therefore
/// `!Send`) so that `execute_on_loop_thread` and the work-pool can reach it
/// from other threads.
struct CrossThread {
    queue: Mutex<VecDeque<Box<dyn FnOnce(&Reactor) + Send>>>,
    waker: mio::Waker,
}

/// A cheap, `Send + Sync` capability to wake and enqueue work onto a
/// `Reactor` from any thread. Returned by [`Reactor::handle`].
#[derive(Clone)]
pub struct LoopHandle {
    cross_thread: Arc<CrossThread>,
}

impl LoopHandle {
    /// Thread-safe. Appends `f` to the cross-thread FIFO and wakes the
    /// reactor. Drained on the reactor thread in arrival order.
    pub fn execute_on_loop_thread(&self, f: impl FnOnce(&Reactor) + Send + 'static) {
        self.cross_thread.queue.lock().unwrap().push_back(Box::new(f));
        let _ = self.cross_thread.waker.wake();
    }
}

struct EachCycleEntry {
    callback: Rc<RefCell<Box<dyn FnMut(&Reactor)>>>,
}

/// Handle returned by [`Reactor::schedule_call_on_each_loop_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleCallbackId(usize);

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    io_handlers: RefCell<Slab<Rc<dyn IoHandler>>>,
    cross_thread: Arc<CrossThread>,
    each_cycle: RefCell<Slab<EachCycleEntry>>,
    sync_queue: RefCell<VecDeque<Box<dyn FnOnce(&Reactor)>>>,
    sync_executor_active: Cell<bool>,
    block_from_exit: Cell<usize>,
    timers: RefCell<TimerWheel>,
    signals: RefCell<signal::SignalTable>,
    work_pool: RefCell<Option<Rc<WorkPool>>>,
    next_id: Cell<u64>,
    loop_id: u64,
}

/// Process-local event loop. Cheaply cloneable (an `Rc`); clones all refer
/// to the same underlying loop, so every handle can carry a back-pointer to
/// its reactor.
#[derive(Clone)]
pub struct Reactor(Rc<Inner>);

static NEXT_LOOP_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let cross_thread = Arc::new(CrossThread {
            queue: Mutex::new(VecDeque::new()),
            waker,
        });
        let loop_id = NEXT_LOOP_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let inner = Inner {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(1024)),
            io_handlers: RefCell::new(Slab::new()),
            cross_thread,
            each_cycle: RefCell::new(Slab::new()),
            sync_queue: RefCell::new(VecDeque::new()),
            sync_executor_active: Cell::new(false),
            block_from_exit: Cell::new(0),
            timers: RefCell::new(TimerWheel::new()),
            signals: RefCell::new(signal::SignalTable::new()),
            work_pool: RefCell::new(None),
            next_id: Cell::new(1),
            loop_id,
        };
        Ok(Reactor(Rc::new(inner)))
    }

    /// Numeric identifier used for log prefixes.
    pub fn id(&self) -> u64 {
        self.0.loop_id
    }

    pub fn registry(&self) -> mio::Registry {
        self.0
            .poll
            .borrow()
            .registry()
            .try_clone()
            .expect("registry clone")
    }

    /// Returns a `Send + Sync` capability usable from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            cross_thread: Arc::clone(&self.0.cross_thread),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);
        id
    }

    // -- IO handler table --------------------------------------------------

    /// Registers a handle implementing [`IoHandler`] and returns the `Token`
    /// events for it will be reported under. Callers are responsible for
    /// registering the underlying `mio` source with `self.registry()` using
    /// the returned token.
    pub fn register_io_handler(&self, handler: Rc<dyn IoHandler>) -> Token {
        let key = self.0.io_handlers.borrow_mut().insert(handler);
        Token(key)
    }

    pub fn deregister_io_handler(&self, token: Token) {
        let mut handlers = self.0.io_handlers.borrow_mut();
        if handlers.contains(token.0) {
            handlers.remove(token.0);
        }
    }

    // -- cross-thread / deferred callbacks ---------------------------------

    /// Thread-safe. See [`LoopHandle::execute_on_loop_thread`].
    pub fn execute_on_loop_thread(&self, f: impl FnOnce(&Reactor) + Send + 'static) {
        self.handle().execute_on_loop_thread(f);
    }

    /// Loop-thread-only. Defers `f` to the next loop cycle via the
    /// "sync-callback executor" idle hook: a single queue drained FIFO each
    /// cycle.
    pub fn schedule_callback(&self, f: impl FnOnce(&Reactor) + 'static) {
        self.0.sync_queue.borrow_mut().push_back(Box::new(f));
        self.0.sync_executor_active.set(true);
    }

    pub fn schedule_call_on_each_loop_cycle(
        &self,
        f: impl FnMut(&Reactor) + 'static,
    ) -> CycleCallbackId {
        let key = self.0.each_cycle.borrow_mut().insert(EachCycleEntry {
            callback: Rc::new(RefCell::new(Box::new(f))),
        });
        CycleCallbackId(key)
    }

    pub fn stop_call_on_each_loop_cycle(&self, id: CycleCallbackId) {
        let mut each_cycle = self.0.each_cycle.borrow_mut();
        if each_cycle.contains(id.0) {
            each_cycle.remove(id.0);
        }
    }

    // -- block-from-exit ----------------------------------------------------

    pub fn start_block_loop_from_exit(&self) {
        self.0.block_from_exit.set(self.0.block_from_exit.get() + 1);
    }

    pub fn stop_block_loop_from_exit(&self) {
        let n = self.0.block_from_exit.get();
        if n > 0 {
            self.0.block_from_exit.set(n - 1);
        }
    }

    // -- timers (internal; Timer handle is the public surface) -------------

    pub(crate) fn raw_set_timer(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        callback: Box<dyn FnMut(&Reactor)>,
    ) -> u64 {
        let id = self.next_id();
        self.0
            .timers
            .borrow_mut()
            .insert(id, Instant::now() + delay, repeat, callback);
        id
    }

    pub(crate) fn raw_clear_timer(&self, id: u64) {
        self.0.timers.borrow_mut().remove(id);
    }

    // -- signals -------------------------------------------------------------

    pub fn add_signal_handler(
        &self,
        sig: i32,
        repeat: bool,
        f: impl FnMut(&Reactor) + 'static,
    ) -> Result<SignalHandlerId, Error> {
        signal::ensure_pipe_registered(self, sig)?;
        Ok(self.0.signals.borrow_mut().add(sig, repeat, Box::new(f)))
    }

    pub fn remove_signal_handler(&self, id: SignalHandlerId) {
        self.0.signals.borrow_mut().remove(id);
    }

    // -- work pool -----------------------------------------------------------

    fn work_pool(&self) -> Rc<WorkPool> {
        let mut pool = self.0.work_pool.borrow_mut();
        if pool.is_none() {
            *pool = Some(Rc::new(WorkPool::new(self.handle())));
        }
        Rc::clone(pool.as_ref().unwrap())
    }

    /// Offloads `cpu_fn` to a worker-thread pool; `done_fn` runs on the
    /// reactor thread with the result (or a cancellation notice).
    pub fn add_work<T: Send + 'static>(
        &self,
        cpu_fn: impl FnOnce() -> T + Send + 'static,
        done_fn: impl FnOnce(&Reactor, Result<T, Error>) + 'static,
    ) -> WorkHandle {
        self.work_pool().submit(cpu_fn, done_fn)
    }

    pub fn cancel_work(&self, handle: &WorkHandle) {
        self.work_pool().cancel(handle);
    }

    /// Called on the loop thread from a worker's `execute_on_loop_thread`
    /// hand-off; looks up the matching `done_fn` by job id and runs it.
    pub(crate) fn complete_work(&self, id: u64, result: Option<Box<dyn std::any::Any + Send>>) {
        if let Some(pool) = self.0.work_pool.borrow().clone() {
            pool.complete(self, id, result);
        }
    }

    // -- the loop itself -----------------------------------------------------

    fn has_cross_thread_work(&self) -> bool {
        !self.0.cross_thread.queue.lock().unwrap().is_empty()
    }

    fn should_exit(&self) -> bool {
        self.0.io_handlers.borrow().is_empty()
            && self.0.timers.borrow().is_empty()
            && self.0.block_from_exit.get() == 0
            && self.0.signals.borrow().is_empty()
            && !self.has_cross_thread_work()
            && self.0.sync_queue.borrow().is_empty()
            && self.0
                .work_pool
                .borrow()
                .as_ref()
                .map(|p| p.pending_count() == 0)
                .unwrap_or(true)
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let timer_deadline = self.0.timers.borrow().next_deadline();
        let block_tick = if self.0.block_from_exit.get() > 0 {
            Some(Duration::from_millis(1))
        } else {
            None
        };
        match (timer_deadline, block_tick) {
            (Some(d), Some(b)) => Some(d.min(b)),
            (Some(d), None) => Some(d),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Enters the multiplex loop, dispatching events until no active
    /// handles, no queued callbacks, and no block-from-exit holders remain.
    /// Cross-thread callbacks arriving after the multiplexer decided to exit
    /// are drained and the loop is re-entered ("drain-then-exit") so enqueued
    /// work is never lost.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            let timeout = self.poll_timeout();
            {
                let mut poll = self.0.poll.borrow_mut();
                let mut events = self.0.events.borrow_mut();
                match poll.poll(&mut events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::from(e)),
                }
            }
            self.dispatch_events();
            self.drain_cross_thread();
            self.fire_timers();
            self.run_each_cycle();
            self.drain_sync_queue();

            if self.should_exit() {
                if self.has_cross_thread_work() {
                    continue;
                }
                return Ok(());
            }
        }
    }

    fn dispatch_events(&self) {
        let mut items: Vec<(Token, Readiness)> = Vec::new();
        {
            let events = self.0.events.borrow();
            for event in events.iter() {
                items.push((event.token(), Readiness::from(event)));
            }
        }
        for (token, readiness) in items {
            match token {
                WAKE_TOKEN => {} // draining happens unconditionally below
                WORK_TOKEN => {
                    let pool = self.0.work_pool.borrow().clone();
                    if let Some(pool) = pool {
                        pool.drain_done(self);
                    }
                }
                SIGNAL_TOKEN => signal::drain_pipe(self),
                _ => {
                    // Clone the `Rc<dyn IoHandler>` out before calling so a
                    // handler that deregisters itself mid-callback doesn't
                    // panic on the slab's own borrow.
                    let handler = self.0.io_handlers.borrow().get(token.0).cloned();
                    if let Some(h) = handler {
                        h.on_ready(self, readiness);
                    }
                }
            }
        }
    }

    fn drain_cross_thread(&self) {
        loop {
            let job = self.0.cross_thread.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => job(self),
                None => break,
            }
        }
    }

    fn fire_timers(&self) {
        let due = self.0.timers.borrow_mut().take_due(Instant::now());
        for mut entry in due {
            (entry.callback)(self);
            if let Some(repeat) = entry.repeat {
                self.0
                    .timers
                    .borrow_mut()
                    .insert(entry.id, Instant::now() + repeat, Some(repeat), entry.callback);
            }
        }
    }

    fn run_each_cycle(&self) {
        // Clone out the `Rc`s first (registration order) so a callback that
        // registers or stops another per-cycle callback doesn't conflict
        // with an outstanding borrow of the slab itself.
        let items: Vec<Rc<RefCell<Box<dyn FnMut(&Reactor)>>>> = self
            .0
            .each_cycle
            .borrow()
            .iter()
            .map(|(_, e)| Rc::clone(&e.callback))
            .collect();
        for cb in items {
            if let Ok(mut cb) = cb.try_borrow_mut() {
                cb(self);
            }
        }
    }

    fn drain_sync_queue(&self) {
        if !self.0.sync_executor_active.get() {
            return;
        }
        loop {
            let job = self.0.sync_queue.borrow_mut().pop_front();
            match job {
                Some(job) => job(self),
                None => break,
            }
        }
        self.0.sync_executor_active.set(false);
    }

    pub(crate) fn signal_token() -> Token {
        SIGNAL_TOKEN
    }

    pub(crate) fn work_token() -> Token {
        WORK_TOKEN
    }

    pub(crate) const fn interest_rw() -> Interest {
        Interest::READABLE.add(Interest::WRITABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn run_exits_with_no_work() {
        let reactor = Reactor::new().unwrap();
        reactor.run().unwrap();
    }

    #[test]
    fn schedule_callback_runs_next_cycle() {
        let reactor = Reactor::new().unwrap();
        let ran = Rc::new(StdRefCell::new(false));
        let ran2 = Rc::clone(&ran);
        reactor.schedule_callback(move |_| *ran2.borrow_mut() = true);
        reactor.run().unwrap();
        assert!(*ran.borrow());
    }

    #[test]
    fn block_from_exit_keeps_loop_alive_until_stopped() {
        let reactor = Reactor::new().unwrap();
        reactor.start_block_loop_from_exit();
        let r2 = reactor.clone();
        let ticks = Rc::new(StdRefCell::new(0));
        let ticks2 = Rc::clone(&ticks);
        let id = reactor.schedule_call_on_each_loop_cycle(move |_| {
            *ticks2.borrow_mut() += 1;
            if *ticks2.borrow() >= 3 {
                r2.stop_block_loop_from_exit();
            }
        });
        reactor.run().unwrap();
        assert!(*ticks.borrow() >= 3);
        reactor.stop_call_on_each_loop_cycle(id);
    }

    #[test]
    fn cross_thread_execute_wakes_loop() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let ran = Rc::new(StdRefCell::new(false));
        let ran2 = Rc::clone(&ran);
        reactor.start_block_loop_from_exit();
        let r2 = reactor.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.execute_on_loop_thread(move |r| {
                *ran2.borrow_mut() = true;
                r.stop_block_loop_from_exit();
            });
        });
        let _ = &r2;
        reactor.run().unwrap();
        assert!(*ran.borrow());
    }

    #[test]
    fn timer_fires_after_delay() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(StdRefCell::new(false));
        let fired2 = Rc::clone(&fired);
        let timer = Timer::new(&reactor);
        timer
            .start(Duration::from_millis(5), None, move |_| {
                *fired2.borrow_mut() = true;
            })
            .unwrap();
        reactor.run().unwrap();
        assert!(*fired.borrow());
    }
}
