//! Error types for `workload-identity-tokio`.

use http_body_util::LengthLimitError;
use std::error::Error as StdError;
use std::io;
use time::OffsetDateTime;
use workload_identity::SourceError;

/// Errors returned by `workload-identity-tokio`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The local credential expired; no connection was attempted.
    #[error("local credential expired at {not_after}")]
    CredentialExpired {
        /// End of the expired credential's validity.
        not_after: OffsetDateTime,
    },

    /// The TLS handshake failed: the peer chain did not validate against the
    /// trust bundle, the authorizer rejected it, or the peer rejected us.
    #[error("peer authentication failed: {0}")]
    PeerAuthenticationFailed(#[source] io::Error),

    /// A transport-level failure outside the TLS handshake.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// The configured server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0:?}")]
    InvalidServerName(String),

    /// A request or response body exceeded the size limit.
    #[error("body exceeds the {max} byte limit")]
    BodyTooLarge {
        /// Maximum accepted body length.
        max: usize,
    },

    /// The request could not be built (bad path or header value).
    #[error("invalid request: {0}")]
    InvalidRequest(#[source] http::Error),

    /// No address was configured for a client target or server listener.
    #[error("no {0} address configured")]
    MissingAddress(&'static str),

    /// The identity source failed for a reason other than expiry.
    #[error("identity source error: {0}")]
    Source(#[source] SourceError),

    /// Building the TLS configuration failed.
    #[error("TLS configuration error: {0}")]
    Config(#[from] workload_identity_rustls::Error),
}

impl Error {
    /// Classifies an I/O error from a TLS stream.
    ///
    /// Errors carrying a `rustls::Error` come from the handshake or from an
    /// alert sent by the peer; everything else is transport.
    pub(crate) fn from_io(e: io::Error) -> Self {
        let is_tls = e
            .get_ref()
            .is_some_and(|inner| inner.is::<rustls::Error>());
        if is_tls {
            Error::PeerAuthenticationFailed(e)
        } else {
            Error::ConnectionFailed(e)
        }
    }

    /// Classifies a failed HTTP exchange.
    ///
    /// A TLS 1.3 server rejects a client certificate after the client's side
    /// of the handshake has finished, so the alert only shows up here, as an
    /// I/O error below the `hyper::Error`.
    pub(crate) fn from_hyper(e: hyper::Error) -> Self {
        let tls_alert = e.source().is_some_and(carries_rustls_error);
        let io = io::Error::other(e);
        if tls_alert {
            Error::PeerAuthenticationFailed(io)
        } else {
            Error::ConnectionFailed(io)
        }
    }

    /// Classifies an error from collecting a size-limited body.
    pub(crate) fn from_body(e: Box<dyn StdError + Send + Sync>) -> Self {
        if e.is::<LengthLimitError>() {
            return Error::BodyTooLarge {
                max: crate::MAX_BODY_LEN,
            };
        }
        match e.downcast::<hyper::Error>() {
            Ok(e) => Self::from_hyper(*e),
            Err(e) => Error::ConnectionFailed(io::Error::other(e)),
        }
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        Error::ConnectionFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}

fn carries_rustls_error(mut e: &(dyn StdError + 'static)) -> bool {
    loop {
        if e.is::<rustls::Error>() {
            return true;
        }
        // `io::Error::source` skips the error it wraps.
        let next = match e.downcast_ref::<io::Error>() {
            Some(io) => io.get_ref().map(|inner| inner as &(dyn StdError + 'static)),
            None => e.source(),
        };
        match next {
            Some(next) => e = next,
            None => return false,
        }
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::CredentialExpired { not_after } => Error::CredentialExpired { not_after },
            other => Error::Source(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rustls_errors_are_authentication_failures() {
        let e = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(Error::from_io(e), Error::PeerAuthenticationFailed(_)));
    }

    #[test]
    fn plain_io_errors_are_connection_failures() {
        let e = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(Error::from_io(e), Error::ConnectionFailed(_)));
    }

    #[test]
    fn rustls_errors_are_found_below_io_wrappers() {
        let tls = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate),
        );
        let wrapped = io::Error::other(tls);
        assert!(carries_rustls_error(&wrapped));
        assert!(!carries_rustls_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[tokio::test]
    async fn oversized_bodies_are_reported() {
        use bytes::Bytes;
        use http_body_util::{BodyExt, Full, Limited};

        let body = Full::new(Bytes::from(vec![0u8; crate::MAX_BODY_LEN + 1]));
        let e = Limited::new(body, crate::MAX_BODY_LEN).collect().await.unwrap_err();
        assert!(matches!(
            Error::from_body(e),
            Error::BodyTooLarge { max } if max == crate::MAX_BODY_LEN
        ));
    }

    #[test]
    fn expiry_is_lifted_out_of_source_errors() {
        let not_after = OffsetDateTime::UNIX_EPOCH;
        assert!(matches!(
            Error::from(SourceError::CredentialExpired { not_after }),
            Error::CredentialExpired { not_after: t } if t == not_after
        ));
        assert!(matches!(Error::from(SourceError::Closed), Error::Source(SourceError::Closed)));
    }
}
