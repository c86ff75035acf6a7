//! `TcpClient`: an outbound TCP connection.

use std::rc::Rc;

use crate::buffer::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::reactor::Reactor;
use crate::removable::Removable;
use crate::tcp::engine::{StreamEngine, StreamState};

/// An outbound TCP connection: `IDLE -> CONNECTING -> OPEN -> CLOSING ->
/// CLOSED`.
pub struct TcpClient {
    engine: Rc<StreamEngine>,
}

impl TcpClient {
    pub fn new(reactor: &Reactor) -> TcpClient {
        TcpClient {
            engine: StreamEngine::new(reactor),
        }
    }

    /// Validates `endpoint` synchronously (`INVALID_ARGUMENT` if
    /// `UNDEFINED`), then connects. `on_connect` fires exactly once, always
    /// on a later loop cycle; `on_receive`/`on_close` are wired for the
    /// connection's lifetime.
    pub fn connect(
        &self,
        endpoint: Endpoint,
        on_connect: impl FnOnce(&Reactor, Error) + 'static,
        on_receive: Option<impl FnMut(&Reactor, &DataChunk) + 'static>,
        on_close: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        if endpoint.is_undefined() {
            return Err(Error::new(StatusCode::InvalidArgument));
        }

        self.engine.set_on_connect(on_connect);
        if let Some(on_receive) = on_receive {
            self.engine.set_on_receive(on_receive);
        }
        if let Some(on_close) = on_close {
            self.engine.set_on_close(on_close);
        }

        self.engine.connect(endpoint)
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

    pub fn reactor(&self) -> &Reactor {
        self.engine.reactor()
    }
}

impl Removable for TcpClient {
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
