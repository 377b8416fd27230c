//! `Certificate` and `PrivateKey` types and helpers.
//!
//! These types wrap DER-encoded bytes and validate them at construction time.

use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::cert::parsing::parse_der_encoded_bytes_as_x509_certificate;
use pkcs8::PrivateKeyInfo;
use time::OffsetDateTime;
use zeroize::Zeroize;

pub mod error;
pub(crate) mod parsing;

pub use parsing::MAX_CERT_CHAIN_LENGTH;

/// A subject alternative name entry, in the order it appears in the certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    /// A `uniformResourceIdentifier` entry, e.g. `spiffe://example.org/api`.
    Uri(String),
    /// A `dNSName` entry.
    Dns(String),
    /// Any other name form (IP address, email, otherName, ...).
    Other,
}

impl SanEntry {
    /// Returns the URI if this is a URI entry.
    pub fn as_uri(&self) -> Option<&str> {
        match self {
            SanEntry::Uri(uri) => Some(uri),
            _ => None,
        }
    }
}

/// A single DER-encoded X.509 certificate.
///
/// Invariant: instances are always validated as parseable DER-encoded X.509.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Returns the certificate bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the subject alternative names in certificate order.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError`] if the SAN extension is malformed or carries
    /// more than 32 URI entries.
    pub fn san_entries(&self) -> Result<Vec<SanEntry>, CertificateError> {
        san_entries_from_der(&self.0)
    }

    /// Returns the subject common name, if present.
    pub fn common_name(&self) -> Option<String> {
        common_name_from_der(&self.0)
    }

    /// Returns the `(not_before, not_after)` validity window.
    ///
    /// # Errors
    ///
    /// Never fails for a constructed `Certificate`; the `Result` mirrors the
    /// parsing step.
    pub fn validity(&self) -> Result<(OffsetDateTime, OffsetDateTime), CertificateError> {
        let x509 = parse_der_encoded_bytes_as_x509_certificate(&self.0)?;
        Ok(parsing::validity(&x509))
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: &[u8]) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(der_bytes)?;
        Ok(Self(Vec::from(der_bytes)))
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: Vec<u8>) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(&der_bytes)?;
        Ok(Self(der_bytes))
    }
}

/// A DER-encoded private key in PKCS#8 format.
///
/// Invariant: instances are always validated as parseable PKCS#8.
///
/// This type is zeroized on drop.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Returns the private key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(bytes).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(Vec::from(bytes)))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Extracts the subject alternative names from a DER-encoded certificate.
///
/// # Errors
///
/// Returns [`CertificateError`] if the bytes are not a certificate, the SAN
/// extension is malformed, or it carries more than 32 URI entries.
pub fn san_entries_from_der(der: &[u8]) -> Result<Vec<SanEntry>, CertificateError> {
    let x509 = parse_der_encoded_bytes_as_x509_certificate(der)?;
    parsing::san_entries(&x509)
}

/// Returns the first URI SAN of a DER-encoded certificate.
///
/// Unlike [`san_entries_from_der`] this applies no count or length limit: the
/// first URI entry is returned as written, or `None` if there is none.
///
/// # Errors
///
/// Returns [`CertificateError`] if the bytes are not a certificate or the SAN
/// extension is malformed.
pub fn first_uri_san_from_der(der: &[u8]) -> Result<Option<String>, CertificateError> {
    let x509 = parse_der_encoded_bytes_as_x509_certificate(der)?;
    parsing::first_uri_san(&x509)
}

/// Extracts the subject common name from a DER-encoded certificate.
///
/// Returns `None` when the bytes do not parse or no common name is present.
pub fn common_name_from_der(der: &[u8]) -> Option<String> {
    let x509 = parse_der_encoded_bytes_as_x509_certificate(der).ok()?;
    parsing::common_name(&x509)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_harness::{LeafSpec, TestCa};

    #[test]
    fn san_entries_keep_certificate_order() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(
            LeafSpec::spiffe("spiffe://example.org/workload-a").with_dns("workload-a.internal"),
        );

        let cert = Certificate::try_from(leaf.cert_der.as_slice()).unwrap();
        let entries = cert.san_entries().unwrap();

        assert_eq!(
            entries,
            vec![
                SanEntry::Uri("spiffe://example.org/workload-a".into()),
                SanEntry::Dns("workload-a.internal".into()),
            ]
        );
    }

    #[test]
    fn certificate_without_san_has_no_entries() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::common_name("workload-b"));

        let cert = Certificate::try_from(leaf.cert_der.clone()).unwrap();
        assert!(cert.san_entries().unwrap().is_empty());
        assert_eq!(cert.common_name().as_deref(), Some("workload-b"));
    }

    #[test]
    fn certificate_rejects_garbage() {
        assert!(Certificate::try_from(&b"not a certificate"[..]).is_err());
    }

    #[test]
    fn private_key_rejects_garbage_and_hides_bytes() {
        assert!(PrivateKey::try_from(&b"nope"[..]).is_err());

        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::spiffe("spiffe://example.org/a"));
        let key = PrivateKey::try_from(leaf.key_der.as_slice()).unwrap();

        let debug = format!("{key:?}");
        assert!(debug.starts_with("PrivateKey"));
        assert!(debug.contains("len"));
    }

    #[test]
    fn first_uri_san_ignores_entry_limits() {
        let ca = TestCa::new("example.org");
        let mut spec = LeafSpec::spiffe("spiffe://example.org/first");
        for i in 0..parsing::MAX_URI_SAN_ENTRIES {
            spec = spec.with_uri(&format!("spiffe://example.org/extra/{i}"));
        }
        let leaf = ca.issue(spec);

        assert!(matches!(
            san_entries_from_der(&leaf.cert_der),
            Err(CertificateError::TooManyUriSanEntries { .. })
        ));
        assert_eq!(
            first_uri_san_from_der(&leaf.cert_der).unwrap().as_deref(),
            Some("spiffe://example.org/first")
        );
        assert_eq!(
            first_uri_san_from_der(&ca.issue(LeafSpec::common_name("cn")).cert_der).unwrap(),
            None
        );
    }

    #[test]
    fn validity_window_is_ordered() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::spiffe("spiffe://example.org/a"));
        let cert = Certificate::try_from(leaf.cert_der).unwrap();

        let (not_before, not_after) = cert.validity().unwrap();
        assert!(not_before < not_after);
    }
}
