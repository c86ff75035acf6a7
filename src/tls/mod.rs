//! TLS and DTLS overlays, gated behind the `tls` feature.
//! `engine`/`session`/`duplex` hold the transport-agnostic handshake/record
//! pump; `tcp` and `udp` wire it to the matching plaintext transport.

mod config;
mod duplex;
mod engine;
mod session;
mod tcp;
mod udp;

pub use config::{ProtocolVersion, TlsConfig};
pub use tcp::{TlsClient, TlsConnectedClient, TlsServer};
pub use udp::{DtlsClient, DtlsConnectedClient, DtlsServer};
