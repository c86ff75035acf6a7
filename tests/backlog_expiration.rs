//! Backlog expiration: an item tracked with `timeout_ms = 250` expires
//! exactly once, between 250ms and 500ms after being added (the backlog's
//! 2x-accuracy invariant).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nexio::backlog::{AddOutcome, BacklogWithTimeout};
use nexio::reactor::Timer;
use nexio::Reactor;

#[test]
fn expires_once_within_the_accuracy_window() {
    let reactor = Reactor::new().expect("new reactor");
    let expired_at: Rc<RefCell<Vec<Duration>>> = Rc::new(RefCell::new(Vec::new()));
    let expired_at2 = Rc::clone(&expired_at);

    let start = Instant::now();
    let backlog = BacklogWithTimeout::new(
        &reactor,
        250,
        move |_item: i32| expired_at2.borrow_mut().push(start.elapsed()),
        |item: &i32| *item as u64,
        move || start.elapsed().as_millis() as u64,
    );

    match backlog.add_item(0) {
        AddOutcome::Enqueued(_) => {}
        other => panic!("expected Enqueued, got {other:?}"),
    }

    let reactor_for_guard = reactor.clone();
    let guard = Timer::new(&reactor);
    guard
        .start(Duration::from_millis(600), None, move |_| {
            reactor_for_guard.stop_block_loop_from_exit();
        })
        .expect("guard timer");
    reactor.start_block_loop_from_exit();
    reactor.run().expect("reactor run");

    let observed = expired_at.borrow();
    assert_eq!(observed.len(), 1, "item must expire exactly once");
    let elapsed = observed[0];
    assert!(
        elapsed >= Duration::from_millis(250) && elapsed <= Duration::from_millis(500),
        "expiration at {elapsed:?} outside the [250ms, 500ms] window"
    );
}
