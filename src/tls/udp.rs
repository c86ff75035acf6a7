//! DTLS over UDP: `DtlsClient`, `DtlsServer`, `DtlsConnectedClient`.
//! Mirrors `tls::tcp` structurally; the only real difference is the
//! transport underneath `TlsEngine` — a single `UdpClient` destination for
//! the client side, `UdpServer`'s tracked-peer table for the server side.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use openssl::ssl::SslContext;

use crate::buffer::DataChunk;
use crate::endpoint::{Endpoint, PeerId};
use crate::error::Error;
use crate::reactor::Reactor;
use crate::removable::Removable;
use crate::tls::config::{ProtocolVersion, TlsConfig};
use crate::tls::engine::{CloseTransport, SendCiphertext, TlsEngine};
use crate::udp::{UdpClient, UdpPeer, UdpServer};

const DEFAULT_PEER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CLOSE_COOLDOWN_MS: u64 = 5_000;

pub(crate) type SharedOnHandshake = Rc<RefCell<dyn FnMut(&Reactor, &Rc<DtlsConnectedClient>, Error)>>;
pub(crate) type SharedOnReceive = Rc<RefCell<dyn FnMut(&Reactor, &Rc<DtlsConnectedClient>, &DataChunk)>>;
pub(crate) type SharedOnClose = Rc<RefCell<dyn FnMut(&Reactor, &Rc<DtlsConnectedClient>, Error)>>;

/// Outbound DTLS session over a single memorized destination.
pub struct DtlsClient {
    transport: Rc<UdpClient>,
    engine: Rc<TlsEngine>,
}

impl DtlsClient {
    pub fn new(reactor: &Reactor, config: &TlsConfig) -> Result<DtlsClient, Error> {
        let ctx = config.build_context(false)?;
        let transport = Rc::new(UdpClient::new(reactor));

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
        Ok(DtlsClient { transport, engine })
    }

    /// Memorizes `endpoint`, then runs the client handshake once the
    /// destination is set. `timeout_ms` is the same inactivity watchdog
    /// `UdpClient::set_destination` already provides, applied underneath the
    /// DTLS session.
    pub fn connect(
        &self,
        endpoint: Endpoint,
        on_handshake_complete: impl FnOnce(&Reactor, Error) + 'static,
        on_receive: Option<impl FnMut(&Reactor, &DataChunk) + 'static>,
        timeout_ms: Option<u64>,
        on_close: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        self.engine.set_on_handshake_complete(on_handshake_complete);
        if let Some(cb) = on_receive {
            self.engine.set_on_receive(cb);
        }
        if let Some(cb) = on_close {
            self.engine.set_on_close(cb);
        }

        let engine_for_set = Rc::clone(&self.engine);
        let engine_for_receive = Rc::clone(&self.engine);
        let engine_for_close = Rc::clone(&self.engine);

        self.transport.set_destination(
            endpoint,
            move |_r: &Reactor, err: Error| {
                if err.is_error() {
                    engine_for_set.fail_before_handshake(err);
                } else {
                    engine_for_set.start_client();
                }
            },
            Some(move |_r: &Reactor, chunk: &DataChunk| {
                let bytes = chunk.bytes().to_vec();
                engine_for_receive.feed_ciphertext(&bytes);
            }),
            timeout_ms,
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

    /// `None` before the handshake reaches `FINISHING`, the negotiated DTLS
    /// version thereafter.
    pub fn negotiated_dtls_version(&self) -> Option<ProtocolVersion> {
        self.engine.negotiated_version()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.transport.endpoint()
    }
}

impl Removable for DtlsClient {
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

/// One tracked DTLS peer: a `UdpPeer` plus a server-side `TlsEngine`.
/// Constructed only by `DtlsServer`.
pub struct DtlsConnectedClient {
    peer: Rc<UdpPeer>,
    engine: Rc<TlsEngine>,
}

impl DtlsConnectedClient {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn adopt(
        reactor: &Reactor,
        peer: Rc<UdpPeer>,
        server: Rc<UdpServer>,
        close_cooldown_ms: u64,
        ctx: SslContext,
        max_version_minor_byte: u8,
        on_handshake_complete: SharedOnHandshake,
        on_receive: SharedOnReceive,
        on_close: SharedOnClose,
    ) -> Rc<DtlsConnectedClient> {
        let peer_for_send = Rc::clone(&peer);
        let send_ciphertext: SendCiphertext = Box::new(move |data, on_end| peer_for_send.send_data(data, on_end));

        let peer_for_close = Rc::clone(&peer);
        let close_transport: CloseTransport =
            Box::new(move || server.close_peer(&peer_for_close, close_cooldown_ms));

        let engine = TlsEngine::new(reactor, ctx, true, max_version_minor_byte, send_ciphertext, close_transport);

        let client = Rc::new(DtlsConnectedClient {
            peer,
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

    /// `None` before the handshake reaches `FINISHING`, the negotiated DTLS
    /// version thereafter.
    pub fn negotiated_dtls_version(&self) -> Option<ProtocolVersion> {
        self.engine.negotiated_version()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.peer.endpoint()
    }
}

impl Removable for DtlsConnectedClient {
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

/// Listening DTLS endpoint built on `UdpServer`'s tracked-peer mode: each
/// distinct sender gets its own `DtlsConnectedClient` and handshake.
pub struct DtlsServer {
    transport: Rc<UdpServer>,
    ctx: SslContext,
    max_version_minor_byte: u8,
    peer_timeout_ms: u64,
    close_cooldown_ms: u64,
    sessions: Rc<RefCell<HashMap<PeerId, Rc<DtlsConnectedClient>>>>,
}

impl DtlsServer {
    pub fn new(reactor: &Reactor, config: &TlsConfig) -> Result<DtlsServer, Error> {
        let ctx = config.build_context(true)?;
        Ok(DtlsServer {
            transport: Rc::new(UdpServer::new(reactor)),
            ctx,
            max_version_minor_byte: config.max_version_minor_byte(),
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            close_cooldown_ms: DEFAULT_CLOSE_COOLDOWN_MS,
            sessions: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    /// Overrides the default inactivity timeout (60s) a tracked peer is
    /// allowed before `UdpServer`'s backlog expires it.
    pub fn with_peer_timeout_ms(mut self, ms: u64) -> DtlsServer {
        self.peer_timeout_ms = ms;
        self
    }

    /// Overrides the default cooldown (5s) a closed peer's `PeerId` is
    /// quarantined for before a new packet from it would start a fresh
    /// session.
    pub fn with_close_cooldown_ms(mut self, ms: u64) -> DtlsServer {
        self.close_cooldown_ms = ms;
        self
    }

    pub fn listen(
        &self,
        endpoint: Endpoint,
        on_handshake_complete: impl FnMut(&Reactor, &Rc<DtlsConnectedClient>, Error) + 'static,
        on_receive: impl FnMut(&Reactor, &Rc<DtlsConnectedClient>, &DataChunk) + 'static,
        on_close: Option<impl FnMut(&Reactor, &Rc<DtlsConnectedClient>, Error) + 'static>,
    ) -> Result<(), Error> {
        let shared_on_handshake: SharedOnHandshake = Rc::new(RefCell::new(on_handshake_complete));
        let shared_on_receive: SharedOnReceive = Rc::new(RefCell::new(on_receive));
        let shared_on_close: SharedOnClose = match on_close {
            Some(f) => Rc::new(RefCell::new(f)),
            None => Rc::new(RefCell::new(|_: &Reactor, _: &Rc<DtlsConnectedClient>, _: Error| {})),
        };

        let ctx = self.ctx.clone();
        let max_version_minor_byte = self.max_version_minor_byte;
        let close_cooldown_ms = self.close_cooldown_ms;
        let server_for_new_peer = Rc::clone(&self.transport);
        let sessions_for_new_peer = Rc::clone(&self.sessions);
        let shared_on_handshake_for_new = Rc::clone(&shared_on_handshake);
        let shared_on_receive_for_new = Rc::clone(&shared_on_receive);
        let shared_on_close_for_new = Rc::clone(&shared_on_close);

        let on_new_peer = move |r: &Reactor, peer: &Rc<UdpPeer>| {
            let dtls_client = DtlsConnectedClient::adopt(
                r,
                Rc::clone(peer),
                Rc::clone(&server_for_new_peer),
                close_cooldown_ms,
                ctx.clone(),
                max_version_minor_byte,
                Rc::clone(&shared_on_handshake_for_new),
                Rc::clone(&shared_on_receive_for_new),
                Rc::clone(&shared_on_close_for_new),
            );
            let key = peer.id();
            sessions_for_new_peer.borrow_mut().insert(key, Rc::clone(&dtls_client));
            let sessions_cleanup = Rc::clone(&sessions_for_new_peer);
            dtls_client.set_on_schedule_removal(Box::new(move || {
                sessions_cleanup.borrow_mut().remove(&key);
            }));
            dtls_client.engine().start_server();
        };

        let sessions_for_receive = Rc::clone(&self.sessions);
        let on_receive_raw = move |_r: &Reactor, peer: &Rc<UdpPeer>, chunk: &DataChunk| {
            let dtls_client = sessions_for_receive.borrow().get(&peer.id()).cloned();
            if let Some(dtls_client) = dtls_client {
                let bytes = chunk.bytes().to_vec();
                dtls_client.engine().feed_ciphertext(&bytes);
            }
        };

        // By the time a peer timeout fires, `UdpServer` has already dropped
        // it from its active map, so finish the DTLS session directly rather
        // than routing back through `close_peer` (which would be a no-op on
        // an absent peer anyway).
        let sessions_for_timeout = Rc::clone(&self.sessions);
        let on_peer_timeout = move |_r: &Reactor, peer: Rc<UdpPeer>, err: Error| {
            let dtls_client = sessions_for_timeout.borrow_mut().remove(&peer.id());
            if let Some(dtls_client) = dtls_client {
                dtls_client.engine().fail_before_handshake(err);
            }
        };

        self.transport.start_receive_tracked(
            endpoint,
            Some(on_new_peer),
            on_receive_raw,
            self.peer_timeout_ms,
            on_peer_timeout,
        )
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
