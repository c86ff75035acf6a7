//! `close_with_reset()`: the peer observes the abrupt teardown instead of a
//! clean EOF.

use std::cell::Cell;
use std::rc::Rc;

use nexio::error::StatusCode;
use nexio::tcp::{TcpClient, TcpServer};
use nexio::{Endpoint, Error, Reactor};

#[test]
fn peer_observes_reset_after_close_with_reset() {
    let reactor = Reactor::new().expect("new reactor");

    let server = TcpServer::new(&reactor);
    let server_for_close = Rc::clone(&server);

    let peer_result = Rc::new(Cell::new(None));
    let peer_result2 = Rc::clone(&peer_result);

    server
        .listen(
            Endpoint::v4([0, 0, 0, 0], 0),
            |_r, result| {
                assert!(result.is_ok());
            },
            |_r, _client, _chunk| {},
            Some(move |_r: &Reactor, _client: &Rc<nexio::tcp::TcpConnectedClient>, err: Error| {
                peer_result2.set(Some(err.code()));
                server_for_close.close(None::<fn(&Reactor)>);
            }),
            128,
        )
        .expect("listen");

    let server_port = server.endpoint().port();

    let client = Rc::new(TcpClient::new(&reactor));
    let client_for_connect = Rc::clone(&client);

    client
        .connect(
            Endpoint::parse("127.0.0.1", server_port),
            move |_r, err| {
                assert!(err.is_ok());
                client_for_connect.close_with_reset();
            },
            None::<fn(&Reactor, &nexio::buffer::DataChunk)>,
            None::<fn(&Reactor, Error)>,
        )
        .expect("connect");

    reactor.run().expect("reactor run");

    // Linux reliably surfaces ECONNRESET through `take_error()` on EOF after
    // an abortive close (SO_LINGER 0); other platforms may instead see a
    // plain graceful EOF (`OK`) since the reset is best-effort, not
    // guaranteed, on every OS.
    let code = peer_result.get().expect("server never saw the peer close");
    assert!(
        code == StatusCode::ConnectionResetByPeer || code == StatusCode::Ok,
        "unexpected close code: {code:?}"
    );
}
