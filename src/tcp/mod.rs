//! TCP transport: `TcpClient`, `TcpServer`, `TcpConnectedClient`. All three
//! share one read/write engine — `TcpConnectedClient` has the same
//! read-path and send API as `TcpClient`, so duplicating it per type would
//! just drift.

mod client;
mod connected_client;
mod engine;
mod server;

pub use client::TcpClient;
pub use connected_client::TcpConnectedClient;
pub use server::TcpServer;

pub(crate) use engine::{StreamEngine, StreamState};
