//! `nexio`: a single-threaded, callback-driven reactor for TCP, UDP,
//! TLS/DTLS, and filesystem I/O.
//!
//! Every handle in this crate carries a back-pointer to the [`reactor::Reactor`]
//! it was created on and runs its callbacks on that reactor's thread alone —
//! there is no cross-thread handle sharing, only the explicit escape hatches
//! `reactor::Reactor::execute_on_loop_thread` and `reactor::Reactor::add_work`.

pub mod backlog;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod fs;
pub mod global;
pub mod reactor;
pub mod removable;
pub mod tcp;
pub mod udp;

#[cfg(feature = "tls")]
pub mod tls;

pub use endpoint::{Endpoint, PeerId};
pub use error::{Error, StatusCode};
pub use reactor::Reactor;
pub use removable::Removable;
