//! `TlsEngine`: the handshake/record state machine shared by the TLS (over
//! `TcpClient`/`TcpConnectedClient`) and DTLS (over `UdpClient`/`UdpPeer`)
//! overlays. It knows nothing about sockets — it's handed two closures,
//! `send_ciphertext`/`close_transport`, that do the actual I/O, the same way
//! `StreamEngine` is the one read/write engine both `TcpClient` and
//! `TcpConnectedClient` share.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use openssl::ssl::{Ssl, SslContext, SslStream};

use crate::buffer::{BufferPool, DataChunk};
use crate::error::{Error, StatusCode};
use crate::reactor::Reactor;
use crate::removable::{Removable, RemovalState};
use crate::tls::config::ProtocolVersion;
use crate::tls::duplex::MemoryDuplex;
use crate::tls::session::{self, HandshakeOutcome, ReadOutcome};

pub(crate) type SendCiphertext =
    Box<dyn Fn(Vec<u8>, Option<Box<dyn FnOnce(&Reactor, Error)>>) -> Result<(), Error>>;
pub(crate) type CloseTransport = Box<dyn Fn()>;

const PLAINTEXT_STAGING_SIZE: usize = 16 * 1024;

enum HandshakeSlot {
    NotStarted,
    Pending(openssl::ssl::MidHandshakeSslStream<MemoryDuplex>),
    Established(SslStream<MemoryDuplex>),
    Done,
}

impl HandshakeSlot {
    fn as_established_mut(&mut self) -> Option<&mut SslStream<MemoryDuplex>> {
        match self {
            HandshakeSlot::Established(s) => Some(s),
            _ => None,
        }
    }
}

pub(crate) struct TlsEngine {
    self_weak: Weak<TlsEngine>,
    reactor: Reactor,
    ctx: SslContext,
    is_server: bool,
    max_version_minor: u8,
    state: RefCell<HandshakeSlot>,
    on_handshake_complete: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    on_receive: RefCell<Option<Box<dyn FnMut(&Reactor, &DataChunk)>>>,
    on_close: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    read_pool: RefCell<BufferPool>,
    send_ciphertext: SendCiphertext,
    close_transport: CloseTransport,
    finished: Cell<bool>,
    negotiated_version: Cell<Option<ProtocolVersion>>,
    removal: Rc<RemovalState>,
}

impl TlsEngine {
    pub(crate) fn new(
        reactor: &Reactor,
        ctx: SslContext,
        is_server: bool,
        max_version_minor: u8,
        send_ciphertext: SendCiphertext,
        close_transport: CloseTransport,
    ) -> Rc<TlsEngine> {
        Rc::new_cyclic(|weak| TlsEngine {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            ctx,
            is_server,
            max_version_minor,
            state: RefCell::new(HandshakeSlot::NotStarted),
            on_handshake_complete: RefCell::new(None),
            on_receive: RefCell::new(None),
            on_close: RefCell::new(None),
            read_pool: RefCell::new(BufferPool::new()),
            send_ciphertext,
            close_transport,
            finished: Cell::new(false),
            negotiated_version: Cell::new(None),
            removal: Rc::new(RemovalState::new()),
        })
    }

    pub(crate) fn set_on_handshake_complete(&self, f: impl FnOnce(&Reactor, Error) + 'static) {
        *self.on_handshake_complete.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn set_on_receive(&self, f: impl FnMut(&Reactor, &DataChunk) + 'static) {
        *self.on_receive.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn set_on_close(&self, f: impl FnOnce(&Reactor, Error) + 'static) {
        *self.on_close.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(&*self.state.borrow(), HandshakeSlot::Established(_))
    }

    /// `None` before the handshake reaches `FINISHED` (spec's `UNKNOWN`),
    /// `Some` thereafter for the life of the session.
    pub(crate) fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated_version.get()
    }

    pub(crate) fn start_client(self: &Rc<Self>) {
        let ssl = match Ssl::new(&self.ctx) {
            Ok(ssl) => ssl,
            Err(e) => return self.fail_before_handshake(Error::from(e)),
        };
        let (outcome, out) = session::connect(ssl, MemoryDuplex::new());
        self.apply_outcome(outcome, out);
    }

    pub(crate) fn start_server(self: &Rc<Self>) {
        let ssl = match Ssl::new(&self.ctx) {
            Ok(ssl) => ssl,
            Err(e) => return self.fail_before_handshake(Error::from(e)),
        };
        let (outcome, out) = session::accept(ssl, MemoryDuplex::new());
        self.apply_outcome(outcome, out);
    }

    /// Feeds ciphertext received from the underlying transport into the
    /// handshake or the established record layer, whichever is active.
    pub(crate) fn feed_ciphertext(self: &Rc<Self>, data: &[u8]) {
        let resume_pending = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                HandshakeSlot::Pending(mid) => {
                    mid.get_mut().feed_incoming(data);
                    true
                }
                HandshakeSlot::Established(stream) => {
                    stream.get_mut().feed_incoming(data);
                    false
                }
                _ => return,
            }
        };

        if resume_pending {
            let mid = match self.state.replace(HandshakeSlot::Done) {
                HandshakeSlot::Pending(mid) => mid,
                other => {
                    *self.state.borrow_mut() = other;
                    return;
                }
            };
            let (outcome, out) = session::resume(mid);
            self.apply_outcome(outcome, out);
        } else {
            self.pump_established();
        }
    }

    fn apply_outcome(self: &Rc<Self>, outcome: HandshakeOutcome, out: Vec<u8>) {
        if !out.is_empty() {
            let _ = (self.send_ciphertext)(out, None);
        }
        match outcome {
            HandshakeOutcome::Established(stream) => {
                let version = stream.ssl().version2().and_then(ProtocolVersion::from_ssl_version);
                self.negotiated_version.set(version);
                *self.state.borrow_mut() = HandshakeSlot::Established(stream);
                self.report_handshake_complete(Error::OK);
                self.pump_established();
            }
            HandshakeOutcome::Pending(mid) => {
                *self.state.borrow_mut() = HandshakeSlot::Pending(mid);
            }
            HandshakeOutcome::Failed(err) => {
                self.maybe_send_version_mismatch_alert(&err);
                self.report_handshake_complete(err.clone());
                self.finish(err);
            }
        }
    }

    fn maybe_send_version_mismatch_alert(&self, err: &Error) {
        if !self.is_server {
            return;
        }
        if let Some(msg) = err.message() {
            if session::looks_like_version_mismatch(msg) {
                let alert = session::synthesize_version_mismatch_alert(self.max_version_minor);
                let _ = (self.send_ciphertext)(alert.to_vec(), None);
            }
        }
    }

    fn report_handshake_complete(self: &Rc<Self>, err: Error) {
        if let Some(cb) = self.on_handshake_complete.borrow_mut().take() {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r, err));
        }
    }

    fn pump_established(self: &Rc<Self>) {
        loop {
            let buf = self.read_pool.borrow_mut().take_or_allocate(PLAINTEXT_STAGING_SIZE);
            let outcome = {
                let mut state = self.state.borrow_mut();
                let stream = match state.as_established_mut() {
                    Some(s) => s,
                    None => return,
                };
                let mut borrowed = buf.borrow_mut();
                session::read_plaintext(stream, &mut borrowed[..])
            };
            match outcome {
                ReadOutcome::Data(n) => {
                    let chunk = DataChunk::new(Rc::clone(&buf), n, 0);
                    self.read_pool.borrow_mut().reclaim(buf);
                    if let Some(cb) = self.on_receive.borrow_mut().as_mut() {
                        cb(&self.reactor, &chunk);
                    }
                }
                ReadOutcome::WouldBlock => {
                    self.read_pool.borrow_mut().reclaim(buf);
                    return;
                }
                ReadOutcome::PeerClosed => {
                    self.read_pool.borrow_mut().reclaim(buf);
                    self.finish(Error::OK);
                    return;
                }
                ReadOutcome::Error(e) => {
                    self.read_pool.borrow_mut().reclaim(buf);
                    self.finish(e);
                    return;
                }
            }
        }
    }

    pub(crate) fn send_data(
        self: &Rc<Self>,
        data: Vec<u8>,
        on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>,
    ) -> Result<(), Error> {
        let ciphertext = {
            let mut state = self.state.borrow_mut();
            let stream = match state.as_established_mut() {
                Some(s) => s,
                None => return Err(Error::new(StatusCode::NotConnected)),
            };
            session::write_plaintext(stream, &data)?
        };
        (self.send_ciphertext)(ciphertext, on_end_send)
    }

    pub(crate) fn close(self: &Rc<Self>) {
        if self.finished.get() {
            return;
        }
        let out = {
            let mut state = self.state.borrow_mut();
            match state.as_established_mut() {
                Some(stream) => session::shutdown(stream),
                None => Vec::new(),
            }
        };
        if !out.is_empty() {
            let _ = (self.send_ciphertext)(out, None);
        }
        (self.close_transport)();
        self.finish(Error::OK);
    }

    pub(crate) fn fail_before_handshake(self: &Rc<Self>, err: Error) {
        self.report_handshake_complete(err.clone());
        self.finish(err);
    }

    fn finish(self: &Rc<Self>, err: Error) {
        if self.finished.replace(true) {
            return;
        }
        *self.state.borrow_mut() = HandshakeSlot::Done;
        if let Some(cb) = self.on_close.borrow_mut().take() {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r, err));
        }
        self.removal.schedule(&self.reactor, || {});
    }
}

impl Removable for TlsEngine {
    fn schedule_removal(&self) {
        if let Some(rc) = self.self_weak.upgrade() {
            rc.close();
        }
        self.removal.schedule(&self.reactor, || {});
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.removal.is_scheduled()
    }
}
