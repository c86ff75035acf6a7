//! Pure handshake/record pump helpers shared by the TLS (TCP) and DTLS (UDP)
//! overlays. None of this knows about the
//! underlying transport; [`TlsEngine`](super::engine::TlsEngine) wires it to
//! a real socket.

use std::io::{self, Read, Write};

use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, SslStream};

use crate::error::{Error, StatusCode};
use crate::tls::duplex::MemoryDuplex;

/// Outcome of a handshake step: either side's `connect`/`accept`/`handshake`
/// call, after any bytes it queued for the peer have been drained off.
pub(crate) enum HandshakeOutcome {
    Established(SslStream<MemoryDuplex>),
    Pending(MidHandshakeSslStream<MemoryDuplex>),
    Failed(Error),
}

fn drain(result: Result<SslStream<MemoryDuplex>, HandshakeError<MemoryDuplex>>) -> (HandshakeOutcome, Vec<u8>) {
    match result {
        Ok(mut stream) => {
            let out = stream.get_mut().take_outgoing();
            (HandshakeOutcome::Established(stream), out)
        }
        Err(HandshakeError::WouldBlock(mut mid)) => {
            let out = mid.get_mut().take_outgoing();
            (HandshakeOutcome::Pending(mid), out)
        }
        Err(HandshakeError::Failure(mut mid)) => {
            let message = mid.error().to_string();
            let out = mid.get_mut().take_outgoing();
            (
                HandshakeOutcome::Failed(Error::with_message(StatusCode::OpensslError, message)),
                out,
            )
        }
        Err(HandshakeError::SetupFailure(stack)) => (HandshakeOutcome::Failed(Error::from(stack)), Vec::new()),
    }
}

pub(crate) fn connect(ssl: Ssl, duplex: MemoryDuplex) -> (HandshakeOutcome, Vec<u8>) {
    drain(ssl.connect(duplex))
}

pub(crate) fn accept(ssl: Ssl, duplex: MemoryDuplex) -> (HandshakeOutcome, Vec<u8>) {
    drain(ssl.accept(duplex))
}

pub(crate) fn resume(mid: MidHandshakeSslStream<MemoryDuplex>) -> (HandshakeOutcome, Vec<u8>) {
    drain(mid.handshake())
}

/// Outcome of one plaintext read from an established `SslStream`.
pub(crate) enum ReadOutcome {
    Data(usize),
    WouldBlock,
    PeerClosed,
    Error(Error),
}

fn ssl_io_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::WouldBlock {
        return Error::new(StatusCode::OperationWouldBlock);
    }
    match e.get_ref().and_then(|inner| inner.downcast_ref::<openssl::ssl::Error>()) {
        Some(ssl_err) => Error::with_message(StatusCode::OpensslError, ssl_err.to_string()),
        None => Error::from(e),
    }
}

pub(crate) fn read_plaintext(stream: &mut SslStream<MemoryDuplex>, buf: &mut [u8]) -> ReadOutcome {
    match stream.read(buf) {
        Ok(0) => ReadOutcome::PeerClosed,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
        Err(e) => ReadOutcome::Error(ssl_io_error(e)),
    }
}

/// Encrypts `data` as one or more TLS records and returns the resulting
/// ciphertext to hand to the transport.
pub(crate) fn write_plaintext(stream: &mut SslStream<MemoryDuplex>, data: &[u8]) -> Result<Vec<u8>, Error> {
    stream.write_all(data).map_err(ssl_io_error)?;
    Ok(stream.get_mut().take_outgoing())
}

/// Sends `close_notify` and returns whatever ciphertext that produced.
pub(crate) fn shutdown(stream: &mut SslStream<MemoryDuplex>) -> Vec<u8> {
    let _ = stream.shutdown();
    stream.get_mut().take_outgoing()
}

/// Synthesizes the version-mismatch alert required when the underlying
/// OpenSSL build just drops the connection instead of emitting one: a fatal
/// `protocol_version` (70 / `0x46`) alert, record-layered as
/// SSL 3.0 framing per RFC 8446 §5 backwards-compatibility guidance.
pub(crate) fn synthesize_version_mismatch_alert(record_version_minor: u8) -> [u8; 7] {
    [0x15, 0x03, record_version_minor, 0x00, 0x02, 0x02, 0x46]
}

/// True if an OpenSSL handshake failure's message indicates the peer spoke
/// a protocol version outside our configured range, rather than some other
/// handshake failure (bad cert, cipher mismatch, etc).
pub(crate) fn looks_like_version_mismatch(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unsupported protocol") || lower.contains("wrong version number") || lower.contains("version too low")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_alert_is_seven_bytes() {
        let alert = synthesize_version_mismatch_alert(0x03);
        assert_eq!(alert, [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x46]);
    }

    #[test]
    fn recognizes_common_openssl_version_mismatch_messages() {
        assert!(looks_like_version_mismatch("unsupported protocol"));
        assert!(looks_like_version_mismatch("sslv3 alert handshake failure: wrong version number"));
        assert!(!looks_like_version_mismatch("certificate verify failed"));
    }
}
