//! TLS/DTLS version mismatch: a server pinned to DTLS 1.2 only and a client
//! pinned to DTLS 1.0 only cannot agree on a version. Both sides report
//! `OPENSSL_ERROR` and no data callback ever fires.

mod support;

use std::cell::Cell;
use std::rc::Rc;

use nexio::error::StatusCode;
use nexio::tls::{DtlsClient, DtlsServer, ProtocolVersion, TlsConfig};
use nexio::{Endpoint, Error, Reactor};

#[test]
fn incompatible_versions_fail_the_handshake_on_both_sides() {
    let reactor = Reactor::new().expect("new reactor");
    let scratch = tempfile::Builder::new()
        .prefix("nexio-test-tls-version-mismatch-")
        .tempdir()
        .expect("scratch dir");
    let (cert, key) = support::generate_self_signed(scratch.path());

    let server_config = TlsConfig::new(ProtocolVersion::Dtls1_2, ProtocolVersion::Dtls1_2)
        .expect("server config")
        .with_certificate(&cert)
        .with_private_key(&key);
    let server = Rc::new(DtlsServer::new(&reactor, &server_config).expect("new dtls server"));
    let server_for_done = Rc::clone(&server);

    let server_result = Rc::new(Cell::new(None));
    let server_result2 = Rc::clone(&server_result);
    let server_received_data = Rc::new(Cell::new(false));
    let server_received_data2 = Rc::clone(&server_received_data);

    server
        .listen(
            Endpoint::v4([127, 0, 0, 1], 0),
            move |r, client, err| {
                server_result2.set(Some(err.code()));
                client.close();
                r.stop_block_loop_from_exit();
            },
            move |_r, _client, _chunk| {
                server_received_data2.set(true);
            },
            None::<fn(&Reactor, &Rc<nexio::tls::DtlsConnectedClient>, Error)>,
        )
        .expect("listen");

    let server_port = server.endpoint().port();

    let client_config = TlsConfig::new(ProtocolVersion::Dtls1_0, ProtocolVersion::Dtls1_0)
        .expect("client config");
    let client = Rc::new(DtlsClient::new(&reactor, &client_config).expect("new dtls client"));
    let client_for_connect = Rc::clone(&client);

    let client_result = Rc::new(Cell::new(None));
    let client_result2 = Rc::clone(&client_result);
    let client_received_data = Rc::new(Cell::new(false));
    let client_received_data2 = Rc::clone(&client_received_data);

    client
        .connect(
            Endpoint::v4([127, 0, 0, 1], server_port),
            move |r, err| {
                client_result2.set(Some(err.code()));
                client_for_connect.close();
                server_for_done.close(None::<fn(&Reactor)>);
                r.stop_block_loop_from_exit();
            },
            Some(move |_r: &Reactor, _chunk: &nexio::buffer::DataChunk| {
                client_received_data2.set(true);
            }),
            None,
            None::<fn(&Reactor, Error)>,
        )
        .expect("connect");

    // Neither side's failure alone is guaranteed to unregister every I/O
    // handler (the other peer keeps retransmitting/listening independently),
    // so hold the loop open and let each completed handshake vote to release
    // it; a guard timer prevents a hang if a side never calls back.
    reactor.start_block_loop_from_exit();
    reactor.start_block_loop_from_exit();
    let reactor_for_guard = reactor.clone();
    let guard = nexio::reactor::Timer::new(&reactor);
    guard
        .start(std::time::Duration::from_millis(2_000), None, move |_| {
            reactor_for_guard.stop_block_loop_from_exit();
            reactor_for_guard.stop_block_loop_from_exit();
        })
        .expect("guard timer");

    reactor.run().expect("reactor run");

    assert_eq!(client_result.get(), Some(StatusCode::OpensslError));
    assert_eq!(server_result.get(), Some(StatusCode::OpensslError));
    assert!(!client_received_data.get(), "client must never see a data callback");
    assert!(!server_received_data.get(), "server must never see a data callback");
}
