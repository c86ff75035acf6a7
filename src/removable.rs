//! The two-phase deferred-destruction protocol every handle follows.
//!
//! Rather than an inheritance chain (`Removable -> Handle`), handles
//! *compose* a [`RemovalState`] field and implement [`Removable`] by
//! delegating to it. Subsystems that own downstream resources (TLS over TCP
//! owning a `TcpClient`) override `schedule_removal` to chain leaf-first.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::reactor::Reactor;

/// Every long-lived handle exposes this contract.
pub trait Removable {
    /// Idempotent: the first call marks the handle scheduled for release on
    /// the next loop cycle; later calls are no-ops.
    fn schedule_removal(&self);

    /// Registers a callback that fires exactly once, when release happens.
    /// Overwrites any previously set callback (there is only ever one
    /// owner of "what happens after I'm gone").
    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>);

    fn is_removal_scheduled(&self) -> bool;
}

/// Reusable state backing a `Removable` implementation. Embed this in a
/// handle's private record and delegate the trait's three methods to it;
/// call [`RemovalState::schedule`] with a `release` closure that actually
/// detaches the handle from the reactor's tables and drops its last strong
/// reference.
#[derive(Default)]
pub struct RemovalState {
    scheduled: Cell<bool>,
    on_schedule_removal: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl RemovalState {
    pub fn new() -> RemovalState {
        RemovalState {
            scheduled: Cell::new(false),
            on_schedule_removal: RefCell::new(None),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    pub fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        *self.on_schedule_removal.borrow_mut() = Some(f);
    }

    /// Schedules `release` to run on the next loop cycle (via the reactor's
    /// one-shot idle hook), then fires the `on_schedule_removal` callback.
    /// A second call while already scheduled is a no-op.
    pub fn schedule(self: &Rc<Self>, reactor: &Reactor, release: impl FnOnce() + 'static) {
        if self.scheduled.replace(true) {
            return;
        }
        let this = Rc::clone(self);
        reactor.schedule_callback(move || {
            release();
            if let Some(cb) = this.on_schedule_removal.borrow_mut().take() {
                cb();
            }
        });
    }
}

/// `schedule_removal` then forget: the default delete function, suitable for
/// use as a drop hook by owners elsewhere (e.g. a `TcpServer` closing every
/// accepted `TcpConnectedClient`).
pub fn default_delete<T: Removable + 'static>(handle: Rc<T>) {
    handle.schedule_removal();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn schedule_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let state = Rc::new(RemovalState::new());
        let release_count = Rc::new(StdRefCell::new(0));
        {
            let release_count = Rc::clone(&release_count);
            state.schedule(&reactor, move || {
                *release_count.borrow_mut() += 1;
            });
        }
        // Second call before the loop has even run must be a no-op.
        state.schedule(&reactor, || panic!("release must not run twice"));

        reactor.run().unwrap();
        assert_eq!(*release_count.borrow(), 1);
    }

    #[test]
    fn on_schedule_removal_fires_once_after_release() {
        let reactor = Reactor::new().unwrap();
        let state = Rc::new(RemovalState::new());
        let order = Rc::new(StdRefCell::new(Vec::new()));

        {
            let order = Rc::clone(&order);
            state.set_on_schedule_removal(Box::new(move || order.borrow_mut().push("removed")));
        }
        {
            let order = Rc::clone(&order);
            state.schedule(&reactor, move || order.borrow_mut().push("released"));
        }
        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec!["released", "removed"]);
    }
}
