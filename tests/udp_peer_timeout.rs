//! UDP peer inactivity timeout: a single packet, then the peer drops out of
//! the tracked map after `timeout_ms` of silence.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use nexio::reactor::Timer;
use nexio::udp::{UdpClient, UdpServer};
use nexio::{Endpoint, Error, Reactor};

#[test]
fn peer_times_out_once_after_single_packet() {
    let reactor = Reactor::new().expect("new reactor");

    let server = UdpServer::new(&reactor);
    let timeout_count = Rc::new(Cell::new(0u32));
    let timeout_count2 = Rc::clone(&timeout_count);
    let received = Rc::new(Cell::new(false));
    let received2 = Rc::clone(&received);

    server
        .start_receive_tracked(
            Endpoint::v4([0, 0, 0, 0], 0),
            None::<fn(&Reactor, &Rc<nexio::udp::UdpPeer>)>,
            move |_r, _peer, chunk| {
                assert_eq!(&*chunk.bytes(), b"!");
                received2.set(true);
            },
            100,
            move |r: &Reactor, _peer, err| {
                assert!(err.is_ok());
                timeout_count2.set(timeout_count2.get() + 1);
                r.stop_block_loop_from_exit();
            },
        )
        .expect("start_receive_tracked");

    let server_port = server.endpoint().port();

    // Hold the loop open past the timeout window even though nothing else
    // keeps it alive; the on_peer_timeout callback releases it.
    reactor.start_block_loop_from_exit();

    let client = UdpClient::new(&reactor);
    client
        .set_destination(
            Endpoint::parse("127.0.0.1", server_port),
            |_r, err| assert!(err.is_ok()),
            None::<fn(&Reactor, &nexio::buffer::DataChunk)>,
            None,
            None::<fn(&Reactor, Error)>,
        )
        .expect("set_destination");
    client
        .send_data(b"!".to_vec(), None::<fn(&Reactor, Error)>)
        .expect("send_data");

    // Safety net in case the timeout callback never fires.
    let guard = Timer::new(&reactor);
    let reactor_for_guard = reactor.clone();
    guard
        .start(Duration::from_millis(2_000), None, move |_| {
            reactor_for_guard.stop_block_loop_from_exit();
        })
        .expect("guard timer");

    reactor.run().expect("reactor run");

    assert!(received.get(), "server never received the packet");
    assert_eq!(timeout_count.get(), 1, "peer timeout must fire exactly once");
}
