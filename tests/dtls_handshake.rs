//! DTLS handshake and message exchange: both sides restricted to DTLS 1.2,
//! greetings are exchanged verbatim, and both sides report the negotiated
//! version once `FINISHING` completes.

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use nexio::tls::{DtlsClient, DtlsServer, ProtocolVersion, TlsConfig};
use nexio::{Endpoint, Error, Reactor};

#[test]
fn exchanges_greetings_over_dtls_1_2() {
    let reactor = Reactor::new().expect("new reactor");
    let scratch = tempfile::Builder::new()
        .prefix("nexio-test-dtls-handshake-")
        .tempdir()
        .expect("scratch dir");
    let (cert, key) = support::generate_self_signed(scratch.path());

    let server_config = TlsConfig::new(ProtocolVersion::Dtls1_2, ProtocolVersion::Dtls1_2)
        .expect("server config")
        .with_certificate(&cert)
        .with_private_key(&key);
    let server = Rc::new(DtlsServer::new(&reactor, &server_config).expect("new dtls server"));
    let server_for_done = Rc::clone(&server);

    let server_negotiated = Rc::new(Cell::new(None));
    let server_negotiated2 = Rc::clone(&server_negotiated);
    let server_received = Rc::new(RefCell::new(Vec::new()));
    let server_received2 = Rc::clone(&server_received);

    server
        .listen(
            Endpoint::v4([127, 0, 0, 1], 0),
            move |_r, peer, err| {
                assert!(err.is_ok(), "server handshake failed: {err:?}");
                server_negotiated2.set(peer.negotiated_dtls_version());
            },
            move |_r, peer, chunk| {
                let bytes = chunk.bytes().to_vec();
                server_received2.borrow_mut().extend_from_slice(&bytes);
                peer.send_data(b"Hello from server!".to_vec(), None::<fn(&Reactor, Error)>)
                    .unwrap();
            },
            None::<fn(&Reactor, &Rc<nexio::tls::DtlsConnectedClient>, Error)>,
        )
        .expect("listen");

    let server_port = server.endpoint().port();

    let client_config = TlsConfig::new(ProtocolVersion::Dtls1_2, ProtocolVersion::Dtls1_2)
        .expect("client config");
    let client = Rc::new(DtlsClient::new(&reactor, &client_config).expect("new dtls client"));
    let client_for_connect = Rc::clone(&client);
    let client_for_close = Rc::clone(&client);

    let client_negotiated = Rc::new(Cell::new(None));
    let client_negotiated2 = Rc::clone(&client_negotiated);
    let client_received = Rc::new(RefCell::new(Vec::new()));
    let client_received2 = Rc::clone(&client_received);

    client
        .connect(
            Endpoint::v4([127, 0, 0, 1], server_port),
            move |_r, err| {
                assert!(err.is_ok(), "client handshake failed: {err:?}");
                client_negotiated2.set(client_for_connect.negotiated_dtls_version());
                client_for_connect
                    .send_data(b"Hello from client!".to_vec(), None::<fn(&Reactor, Error)>)
                    .unwrap();
            },
            Some(move |_r: &Reactor, chunk: &nexio::buffer::DataChunk| {
                client_received2.borrow_mut().extend_from_slice(&chunk.bytes());
                client_for_close.close();
                server_for_done.close(None::<fn(&Reactor)>);
            }),
            None,
            None::<fn(&Reactor, Error)>,
        )
        .expect("connect");

    reactor.run().expect("reactor run");

    assert_eq!(&*server_received.borrow(), b"Hello from client!");
    assert_eq!(&*client_received.borrow(), b"Hello from server!");
    assert_eq!(server_negotiated.get(), Some(ProtocolVersion::Dtls1_2));
    assert_eq!(client_negotiated.get(), Some(ProtocolVersion::Dtls1_2));
}
