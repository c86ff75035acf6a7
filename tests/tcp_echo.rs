//! End-to-end TCP echo: a server bound on an OS-assigned port, a client
//! connecting to it, `"ping"` echoed back byte-for-byte.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use nexio::{Endpoint, Error, Reactor};
use nexio::tcp::{TcpClient, TcpServer};

#[test]
fn echoes_ping_and_closes_gracefully() {
    let reactor = Reactor::new().expect("new reactor");

    let server = TcpServer::new(&reactor);
    let server_for_close = Rc::clone(&server);
    let accepted = Rc::new(Cell::new(false));
    let accepted2 = Rc::clone(&accepted);

    server
        .listen(
            Endpoint::v4([0, 0, 0, 0], 0),
            move |_r, result| {
                assert!(result.is_ok(), "accept failed: {result:?}");
                accepted2.set(true);
            },
            move |_r, client, chunk| {
                // Echo exactly what was received, at whatever offset it
                // arrived at.
                let bytes = chunk.bytes().to_vec();
                client.send_data(bytes, None::<fn(&Reactor, Error)>).unwrap();
            },
            None::<fn(&Reactor, &Rc<nexio::tcp::TcpConnectedClient>, Error)>,
            128,
        )
        .expect("listen");

    let server_port = server.endpoint().port();

    let client = Rc::new(TcpClient::new(&reactor));
    let client_for_connect = Rc::clone(&client);
    let client_for_close = Rc::clone(&client);

    let received = Rc::new(RefCell::new(Vec::new()));
    let received2 = Rc::clone(&received);
    let received_offset = Rc::new(Cell::new(u64::MAX));
    let received_offset2 = Rc::clone(&received_offset);
    let client_closed = Rc::new(Cell::new(false));
    let client_closed2 = Rc::clone(&client_closed);

    client
        .connect(
            Endpoint::parse("127.0.0.1", server_port),
            move |_r, err| {
                assert!(err.is_ok(), "connect failed: {err:?}");
                client_for_connect
                    .send_data(b"ping".to_vec(), None::<fn(&Reactor, Error)>)
                    .unwrap();
            },
            Some(move |_r: &Reactor, chunk: &nexio::buffer::DataChunk| {
                received2.borrow_mut().extend_from_slice(chunk.bytes());
                received_offset2.set(chunk.offset());
                client_for_close.close();
            }),
            Some(move |_r, err| {
                assert!(err.is_ok(), "client close reported error: {err:?}");
                client_closed2.set(true);
                server_for_close.close(None::<fn(&Reactor)>);
            }),
        )
        .expect("connect");

    reactor.run().expect("reactor run");

    assert!(accepted.get(), "server never reported a new connection");
    assert!(client_closed.get(), "client never reported close");
    assert_eq!(&*received.borrow(), b"ping");
    assert_eq!(received_offset.get(), 0, "first chunk must start at offset 0");
    assert_eq!(server.connected_clients_count(), 0);
}
