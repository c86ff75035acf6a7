//! TLS over TCP: `TlsClient`, `TlsServer`, `TlsConnectedClient`. Each wraps
//! the matching `tcp` transport handle and a [`TlsEngine`]
//! that does the actual handshake/record work; this module only shuttles
//! ciphertext between the two.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use openssl::ssl::SslContext;

use crate::buffer::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::removable::Removable;
use crate::tcp::{TcpClient, TcpConnectedClient, TcpServer};
use crate::tls::config::{ProtocolVersion, TlsConfig};
use crate::tls::engine::{CloseTransport, SendCiphertext, TlsEngine};

pub(crate) type SharedOnHandshake = Rc<RefCell<dyn FnMut(&Reactor, &Rc<TlsConnectedClient>, Error)>>;
pub(crate) type SharedOnReceive = Rc<RefCell<dyn FnMut(&Reactor, &Rc<TlsConnectedClient>, &DataChunk)>>;
pub(crate) type SharedOnClose = Rc<RefCell<dyn FnMut(&Reactor, &Rc<TlsConnectedClient>, Error)>>;

/// Outbound TLS connection: a `TcpClient` plus a client-side `TlsEngine`.
pub struct TlsClient {
    transport: Rc<TcpClient>,
    engine: Rc<TlsEngine>,
}

impl TlsClient {
    pub fn new(reactor: &Reactor, config: &TlsConfig) -> Result<TlsClient, Error> {
        let ctx = config.build_context(false)?;
        let transport = Rc::new(TcpClient::new(reactor));

        let t_send = Rc::clone(&transport);
        let send_ciphertext: SendCiphertext = Box::new(move |data, on_end| t_send.send_data(data, on_end));
        let t_close = Rc::clone(&transport);
        let close_transport: CloseTransport = Box::new(move || t_close.close());

        let engine = TlsEngine::new(
            reactor,
            ctx,
            false,
            config.max_version_minor_byte(),
            send_ciphertext,
            close_transport,
        );
        Ok(TlsClient { transport, engine })
    }

    /// Connects the underlying TCP socket, then runs the client handshake
    /// once it's open. `on_handshake_complete` fires exactly once with the
    /// overall outcome (TCP connect failure, or the handshake's own result).
    pub fn connect(
        &self,
        endpoint: Endpoint,
        on_handshake_complete: impl FnOnce(&Reactor, Error) + 'static,
        on_receive: Option<impl FnMut(&Reactor, &DataChunk) + 'static>,
        on_close: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        self.engine.set_on_handshake_complete(on_handshake_complete);
        if let Some(cb) = on_receive {
            self.engine.set_on_receive(cb);
        }
        if let Some(cb) = on_close {
            self.engine.set_on_close(cb);
        }

        let engine_for_connect = Rc::clone(&self.engine);
        let engine_for_receive = Rc::clone(&self.engine);
        let engine_for_close = Rc::clone(&self.engine);

        self.transport.connect(
            endpoint,
            move |_r: &Reactor, err: Error| {
                if err.is_error() {
                    engine_for_connect.fail_before_handshake(err);
                } else {
                    engine_for_connect.start_client();
                }
            },
            Some(move |_r: &Reactor, chunk: &DataChunk| {
                let bytes = chunk.bytes().to_vec();
                engine_for_receive.feed_ciphertext(&bytes);
            }),
            Some(move |_r: &Reactor, err: Error| {
                engine_for_close.fail_before_handshake(err);
            }),
        )
    }

    pub fn send_data(
        &self,
        data: Vec<u8>,
        on_end_send: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        self.engine.send_data(
            data,
            on_end_send.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor, Error)>),
        )
    }

    pub fn close(&self) {
        self.engine.close();
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// `None` before the handshake reaches `FINISHING`, the negotiated
    /// version thereafter.
    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.engine.negotiated_version()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }
}

impl Removable for TlsClient {
    fn schedule_removal(&self) {
        Removable::schedule_removal(&*self.engine);
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        Removable::set_on_schedule_removal(&*self.engine, f);
    }

    fn is_removal_scheduled(&self) -> bool {
        Removable::is_removal_scheduled(&*self.engine)
    }
}

/// One accepted TLS connection: a `TcpConnectedClient` plus a server-side
/// `TlsEngine`. Constructed only by `TlsServer`.
pub struct TlsConnectedClient {
    transport: Rc<TcpConnectedClient>,
    engine: Rc<TlsEngine>,
}

impl TlsConnectedClient {
    pub(crate) fn adopt(
        reactor: &Reactor,
        transport: Rc<TcpConnectedClient>,
        ctx: SslContext,
        max_version_minor_byte: u8,
        on_handshake_complete: SharedOnHandshake,
        on_receive: SharedOnReceive,
        on_close: SharedOnClose,
    ) -> Rc<TlsConnectedClient> {
        let t_send = Rc::clone(&transport);
        let send_ciphertext: SendCiphertext = Box::new(move |data, on_end| t_send.send_data(data, on_end));
        let t_close = Rc::clone(&transport);
        let close_transport: CloseTransport = Box::new(move || t_close.close());

        let engine = TlsEngine::new(reactor, ctx, true, max_version_minor_byte, send_ciphertext, close_transport);

        let client = Rc::new(TlsConnectedClient {
            transport,
            engine: Rc::clone(&engine),
        });

        let weak = Rc::downgrade(&client);
        {
            let weak = weak.clone();
            engine.set_on_handshake_complete(move |r, err| {
                if let Some(c) = weak.upgrade() {
                    (on_handshake_complete.borrow_mut())(r, &c, err);
                }
            });
        }
        {
            let weak = weak.clone();
            engine.set_on_receive(move |r, chunk| {
                if let Some(c) = weak.upgrade() {
                    (on_receive.borrow_mut())(r, &c, chunk);
                }
            });
        }
        {
            let weak = weak.clone();
            engine.set_on_close(move |r, err| {
                if let Some(c) = weak.upgrade() {
                    (on_close.borrow_mut())(r, &c, err);
                }
            });
        }

        client
    }

    pub(crate) fn engine(&self) -> &Rc<TlsEngine> {
        &self.engine
    }

    pub fn send_data(
        &self,
        data: Vec<u8>,
        on_end_send: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        self.engine.send_data(
            data,
            on_end_send.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor, Error)>),
        )
    }

    pub fn close(&self) {
        self.engine.close();
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// `None` before the handshake reaches `FINISHING`, the negotiated
    /// version thereafter.
    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.engine.negotiated_version()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }
}

impl Removable for TlsConnectedClient {
    fn schedule_removal(&self) {
        Removable::schedule_removal(&*self.engine);
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        Removable::set_on_schedule_removal(&*self.engine, f);
    }

    fn is_removal_scheduled(&self) -> bool {
        Removable::is_removal_scheduled(&*self.engine)
    }
}

/// Listening TLS endpoint: a `TcpServer` fanning accepted connections into
/// `TlsConnectedClient`s, each running its own server-side handshake (the
/// DTLS peer table is the UDP analogue of this).
pub struct TlsServer {
    reactor: Reactor,
    transport: Rc<TcpServer>,
    ctx: SslContext,
    max_version_minor_byte: u8,
    sessions: Rc<RefCell<HashMap<usize, Rc<TlsConnectedClient>>>>,
}

impl TlsServer {
    pub fn new(reactor: &Reactor, config: &TlsConfig) -> Result<TlsServer, Error> {
        let ctx = config.build_context(true)?;
        Ok(TlsServer {
            reactor: reactor.clone(),
            transport: TcpServer::new(reactor),
            ctx,
            max_version_minor_byte: config.max_version_minor_byte(),
            sessions: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn listen(
        &self,
        endpoint: Endpoint,
        mut on_new_conn: impl FnMut(&Reactor, Result<Rc<TlsConnectedClient>, Error>) + 'static,
        on_handshake_complete: impl FnMut(&Reactor, &Rc<TlsConnectedClient>, Error) + 'static,
        on_receive: impl FnMut(&Reactor, &Rc<TlsConnectedClient>, &DataChunk) + 'static,
        on_close: Option<impl FnMut(&Reactor, &Rc<TlsConnectedClient>, Error) + 'static>,
        backlog: i32,
    ) -> Result<(), Error> {
        let shared_on_handshake: SharedOnHandshake = Rc::new(RefCell::new(on_handshake_complete));
        let shared_on_receive: SharedOnReceive = Rc::new(RefCell::new(on_receive));
        let shared_on_close: SharedOnClose = match on_close {
            Some(f) => Rc::new(RefCell::new(f)),
            None => Rc::new(RefCell::new(|_: &Reactor, _: &Rc<TlsConnectedClient>, _: Error| {})),
        };

        let ctx = self.ctx.clone();
        let max_version_minor_byte = self.max_version_minor_byte;
        let sessions_for_new = Rc::clone(&self.sessions);
        let shared_on_handshake_for_new = Rc::clone(&shared_on_handshake);
        let shared_on_receive_for_new = Rc::clone(&shared_on_receive);
        let shared_on_close_for_new = Rc::clone(&shared_on_close);

        let new_conn_cb = move |r: &Reactor, result: Result<Rc<TcpConnectedClient>, Error>| match result {
            Ok(tcp_client) => {
                let key = Rc::as_ptr(&tcp_client) as usize;
                let tls_client = TlsConnectedClient::adopt(
                    r,
                    Rc::clone(&tcp_client),
                    ctx.clone(),
                    max_version_minor_byte,
                    Rc::clone(&shared_on_handshake_for_new),
                    Rc::clone(&shared_on_receive_for_new),
                    Rc::clone(&shared_on_close_for_new),
                );
                sessions_for_new.borrow_mut().insert(key, Rc::clone(&tls_client));
                let sessions_cleanup = Rc::clone(&sessions_for_new);
                tls_client.set_on_schedule_removal(Box::new(move || {
                    sessions_cleanup.borrow_mut().remove(&key);
                }));
                tls_client.engine().start_server();
                on_new_conn(r, Ok(tls_client));
            }
            Err(e) => on_new_conn(r, Err(e)),
        };

        let sessions_for_receive = Rc::clone(&self.sessions);
        let receive_cb = move |_r: &Reactor, tcp_client: &Rc<TcpConnectedClient>, chunk: &DataChunk| {
            let key = Rc::as_ptr(tcp_client) as usize;
            let tls_client = sessions_for_receive.borrow().get(&key).cloned();
            if let Some(tls_client) = tls_client {
                let bytes = chunk.bytes().to_vec();
                tls_client.engine().feed_ciphertext(&bytes);
            }
        };

        let sessions_for_close = Rc::clone(&self.sessions);
        let close_cb = move |_r: &Reactor, tcp_client: &Rc<TcpConnectedClient>, err: Error| {
            let key = Rc::as_ptr(tcp_client) as usize;
            let tls_client = sessions_for_close.borrow().get(&key).cloned();
            if let Some(tls_client) = tls_client {
                tls_client.engine().fail_before_handshake(err);
            }
        };

        let _ = &self.reactor;
        self.transport.listen(endpoint, new_conn_cb, receive_cb, Some(close_cb), backlog)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }

    pub fn connected_clients_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn close(&self, on_done: Option<impl FnOnce(&Reactor) + 'static>) {
        self.transport.close(on_done);
    }
}
