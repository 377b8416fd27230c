//! Error types for certificate and private key parsing/validation.

use x509_parser::error::X509Error;

/// An error that may arise parsing X.509 certificates.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate: {0}")]
    ParseX509Certificate(#[from] X509Error),

    /// Unexpected X.509 extension encountered.
    #[error("unexpected X.509 extension: {0}")]
    UnexpectedExtension(String),

    /// The certificate has too many URI SAN entries to process safely.
    #[error("certificate has too many URI SAN entries (max {max})")]
    TooManyUriSanEntries {
        /// Maximum number of URI SAN entries inspected before aborting.
        max: usize,
    },

    /// A certificate chain is longer than the accepted maximum.
    #[error("certificate chain has too many certificates (max {max})")]
    TooManyCertificates {
        /// Maximum number of certificates accepted in a chain.
        max: usize,
    },
}

/// An error that may arise decoding private keys.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum PrivateKeyError {
    /// Error returned by the PKCS#8 decoding library.
    #[error("failed decoding PKCS#8 private key: {0}")]
    DecodePkcs8(pkcs8::Error),
}
