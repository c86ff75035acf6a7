//! `TcpConnectedClient`: an accepted connection. Owned by its `TcpServer`; shares
//! `StreamEngine` with `TcpClient` (same read-path and send API), but its
//! `on_receive`/`on_close` callbacks are the server's single shared
//! callbacks rather than per-connection ones, so each fires with a handle to
//! *which* connection it's about.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use mio::net::TcpStream;

use crate::buffer::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::removable::Removable;
use crate::tcp::engine::{StreamEngine, StreamState};

pub(crate) type SharedOnReceive =
    Rc<RefCell<dyn FnMut(&Reactor, &Rc<TcpConnectedClient>, &DataChunk)>>;
pub(crate) type SharedOnClose =
    Rc<RefCell<dyn FnMut(&Reactor, &Rc<TcpConnectedClient>, Error)>>;

pub struct TcpConnectedClient {
    engine: Rc<StreamEngine>,
}

impl TcpConnectedClient {
    /// Wraps an already-accepted `stream`. Wires `on_receive`/`on_close` so
    /// they receive the client handle alongside the reactor and payload.
    pub(crate) fn adopt(
        reactor: &Reactor,
        stream: TcpStream,
        on_receive: SharedOnReceive,
        on_close: SharedOnClose,
    ) -> Result<Rc<TcpConnectedClient>, Error> {
        let client = Rc::new(TcpConnectedClient {
            engine: StreamEngine::new(reactor),
        });

        let weak_for_receive: Weak<TcpConnectedClient> = Rc::downgrade(&client);
        client.engine.set_on_receive(move |r, chunk| {
            if let Some(c) = weak_for_receive.upgrade() {
                (on_receive.borrow_mut())(r, &c, chunk);
            }
        });

        let weak_for_close: Weak<TcpConnectedClient> = Rc::downgrade(&client);
        client.engine.set_on_close(move |r, err| {
            if let Some(c) = weak_for_close.upgrade() {
                (on_close.borrow_mut())(r, &c, err);
            }
        });

        client.engine.adopt(stream)?;
        Ok(client)
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

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    pub fn close(&self) {
        self.engine.close();
    }

    pub fn close_with_reset(&self) {
        self.engine.close_with_reset();
    }

    pub fn delay_send(&self, delay: bool) {
        self.engine.set_delay_send(delay);
    }

    pub fn is_open(&self) -> bool {
        self.engine.state() == StreamState::Open
    }

    pub fn endpoint(&self) -> Endpoint {
        self.engine.endpoint()
    }

    pub fn pending_send_requests(&self) -> usize {
        self.engine.pending_send_requests()
    }

    /// Forces closed with an explicit error, bypassing the normal `Ok`-only
    /// `close` path. Used by `TcpServer` for the immediate-RST accept edge
    /// case.
    pub(crate) fn force_close(&self, err: Error) {
        self.engine.force_finish(err);
    }
}

impl Removable for TcpConnectedClient {
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
