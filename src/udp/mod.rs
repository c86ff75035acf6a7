//! UDP transport: `UdpClient`, `UdpServer`, `UdpPeer`.

mod client;
mod peer;
mod server;

pub use client::UdpClient;
pub use peer::UdpPeer;
pub use server::UdpServer;

use std::sync::OnceLock;
use std::time::Instant;

/// Millisecond monotonic clock shared by `UdpClient`'s inactivity timer and
/// `UdpServer`'s `BacklogWithTimeout<Rc<UdpPeer>>`, so both measure
/// inactivity against the same clock `BacklogWithTimeout`'s contract
/// expects (`clock()`/`time_getter` both return the same units).
pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
