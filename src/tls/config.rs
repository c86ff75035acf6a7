//! TLS/DTLS configuration: protocol version range, cipher list, and PEM
//! certificate/key loading.

use std::path::{Path, PathBuf};

use openssl::ssl::{SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVersion};

use crate::error::{Error, StatusCode};

/// A TLS or DTLS protocol version. Ordering follows protocol age, not the
/// wire version numbers (which run backwards for TLS 1.3 vs SSLv3 lineage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    Dtls1_0,
    Dtls1_2,
}

impl ProtocolVersion {
    fn is_dtls(self) -> bool {
        matches!(self, ProtocolVersion::Dtls1_0 | ProtocolVersion::Dtls1_2)
    }

    fn to_ssl_version(self) -> SslVersion {
        match self {
            ProtocolVersion::Tls1_0 => SslVersion::TLS1,
            ProtocolVersion::Tls1_1 => SslVersion::TLS1_1,
            ProtocolVersion::Tls1_2 => SslVersion::TLS1_2,
            ProtocolVersion::Tls1_3 => SslVersion::TLS1_3,
            ProtocolVersion::Dtls1_0 => SslVersion::DTLS1,
            ProtocolVersion::Dtls1_2 => SslVersion::DTLS1_2,
        }
    }

    /// Maps an established session's wire version back to our enum. `None`
    /// covers versions this crate never negotiates (SSLv3 and older) rather
    /// than panicking on them.
    pub(crate) fn from_ssl_version(version: SslVersion) -> Option<ProtocolVersion> {
        match version {
            SslVersion::TLS1 => Some(ProtocolVersion::Tls1_0),
            SslVersion::TLS1_1 => Some(ProtocolVersion::Tls1_1),
            SslVersion::TLS1_2 => Some(ProtocolVersion::Tls1_2),
            SslVersion::TLS1_3 => Some(ProtocolVersion::Tls1_3),
            SslVersion::DTLS1 => Some(ProtocolVersion::Dtls1_0),
            SslVersion::DTLS1_2 => Some(ProtocolVersion::Dtls1_2),
            _ => None,
        }
    }

    /// The first byte of `ClientHello.legacy_version`/`ServerHello.version`'s
    /// minor field, used only to synthesize the version-mismatch alert body
    /// (`15 03 <ver> 00 02 02 46`).
    fn minor_byte(self) -> u8 {
        match self {
            ProtocolVersion::Tls1_0 => 0x01,
            ProtocolVersion::Tls1_1 => 0x02,
            ProtocolVersion::Tls1_2 => 0x03,
            ProtocolVersion::Tls1_3 => 0x04,
            ProtocolVersion::Dtls1_0 => 0xff,
            ProtocolVersion::Dtls1_2 => 0xfd,
        }
    }
}

/// Configuration for a TLS or DTLS endpoint: the version range it will
/// negotiate within, and (for servers) the certificate/key pair it presents.
///
/// Built once and shared (via a built `SslContext`) across every connection
/// a `TlsServer`/`DtlsServer` accepts, the same way a listener shares one
/// bound socket across accepted connections.
pub struct TlsConfig {
    min_version: ProtocolVersion,
    max_version: ProtocolVersion,
    certificate_path: Option<PathBuf>,
    private_key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(min_version: ProtocolVersion, max_version: ProtocolVersion) -> Result<TlsConfig, Error> {
        if min_version.is_dtls() != max_version.is_dtls() {
            return Err(Error::with_message(
                StatusCode::InvalidArgument,
                "min_version and max_version must both be TLS or both be DTLS",
            ));
        }
        if min_version > max_version {
            return Err(Error::with_message(
                StatusCode::InvalidArgument,
                "min_version must not be greater than max_version",
            ));
        }
        Ok(TlsConfig {
            min_version,
            max_version,
            certificate_path: None,
            private_key_path: None,
        })
    }

    pub fn with_certificate(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.certificate_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_private_key(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.private_key_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub(crate) fn is_dtls(&self) -> bool {
        self.max_version.is_dtls()
    }

    pub(crate) fn max_version_minor_byte(&self) -> u8 {
        self.max_version.minor_byte()
    }

    pub(crate) fn build_context(&self, server: bool) -> Result<SslContext, Error> {
        let method = if self.is_dtls() { SslMethod::dtls() } else { SslMethod::tls() };
        let mut builder = SslContextBuilder::new(method)?;
        builder.set_min_proto_version(Some(self.min_version.to_ssl_version()))?;
        builder.set_max_proto_version(Some(self.max_version.to_ssl_version()))?;

        if server {
            let cert_path = self.certificate_path.as_ref().ok_or_else(|| {
                Error::new(StatusCode::TlsCertificateFileNotExist)
            })?;
            if !cert_path.exists() {
                return Err(Error::new(StatusCode::TlsCertificateFileNotExist));
            }
            builder
                .set_certificate_file(cert_path, SslFiletype::PEM)
                .map_err(|e| Error::with_message(StatusCode::TlsCertificateInvalid, e.to_string()))?;

            let key_path = self
                .private_key_path
                .as_ref()
                .ok_or_else(|| Error::new(StatusCode::TlsPrivateKeyFileNotExist))?;
            if !key_path.exists() {
                return Err(Error::new(StatusCode::TlsPrivateKeyFileNotExist));
            }
            builder
                .set_private_key_file(key_path, SslFiletype::PEM)
                .map_err(|e| Error::with_message(StatusCode::TlsPrivateKeyInvalid, e.to_string()))?;

            builder
                .check_private_key()
                .map_err(|e| Error::with_message(StatusCode::TlsPrivateKeyAndCertificateNotMatch, e.to_string()))?;
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_range() {
        let err = TlsConfig::new(ProtocolVersion::Tls1_2, ProtocolVersion::Tls1_0).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn rejects_mixed_tls_and_dtls() {
        let err = TlsConfig::new(ProtocolVersion::Tls1_2, ProtocolVersion::Dtls1_2).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn missing_certificate_rejected_for_server_context() {
        let cfg = TlsConfig::new(ProtocolVersion::Tls1_2, ProtocolVersion::Tls1_3).unwrap();
        let err = cfg.build_context(true).unwrap_err();
        assert_eq!(err.code(), StatusCode::TlsCertificateFileNotExist);
    }

    #[test]
    fn client_context_needs_no_certificate() {
        let cfg = TlsConfig::new(ProtocolVersion::Tls1_2, ProtocolVersion::Tls1_3).unwrap();
        assert!(cfg.build_context(false).is_ok());
    }

    #[test]
    fn negotiated_version_round_trips_through_ssl_version() {
        for v in [
            ProtocolVersion::Tls1_0,
            ProtocolVersion::Tls1_1,
            ProtocolVersion::Tls1_2,
            ProtocolVersion::Tls1_3,
            ProtocolVersion::Dtls1_0,
            ProtocolVersion::Dtls1_2,
        ] {
            assert_eq!(ProtocolVersion::from_ssl_version(v.to_ssl_version()), Some(v));
        }
    }
}
