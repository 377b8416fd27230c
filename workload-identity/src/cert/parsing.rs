//! Internal parsing helpers on top of `x509-parser`.

use crate::cert::error::CertificateError;
use crate::cert::SanEntry;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::{ParsedExtension, SubjectAlternativeName};
use x509_parser::nom::Err;
use x509_parser::oid_registry;
use x509_parser::prelude::GeneralName;

pub(crate) const MAX_URI_SAN_ENTRIES: usize = 32;
pub(crate) const MAX_URI_LENGTH: usize = 2048;

/// Upper bound on certificates accepted in a leaf-first identity chain.
///
/// Identity chains are typically 1-3 certificates long.
pub const MAX_CERT_CHAIN_LENGTH: usize = 16;

/// Parses the given DER-encoded bytes as an X.509 certificate.
pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, CertificateError> {
    match x509_parser::parse_x509_certificate(der_bytes) {
        Ok((_, cert)) => Ok(cert),
        Err(Err::Incomplete(_)) => Err(CertificateError::ParseX509Certificate(
            X509Error::InvalidCertificate,
        )),
        Err(Err::Error(e) | Err::Failure(e)) => Err(CertificateError::ParseX509Certificate(e)),
    }
}

fn subject_alt_name<'a, 'x>(
    cert: &'a X509Certificate<'x>,
) -> Result<Option<&'a SubjectAlternativeName<'x>>, CertificateError> {
    let Some(ext) = cert
        .tbs_certificate
        .get_extension_unique(&oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)?
    else {
        return Ok(None);
    };

    match ext.parsed_extension() {
        ParsedExtension::SubjectAlternativeName(s) => Ok(Some(s)),
        other => Err(CertificateError::UnexpectedExtension(format!("{other:?}"))),
    }
}

/// Collects the subject alternative names of `cert` in certificate order.
///
/// A certificate without the SAN extension yields an empty list. URI entries
/// longer than [`MAX_URI_LENGTH`] are skipped.
pub(crate) fn san_entries(cert: &X509Certificate<'_>) -> Result<Vec<SanEntry>, CertificateError> {
    let Some(san) = subject_alt_name(cert)? else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(san.general_names.len());
    let mut uri_count = 0usize;

    for name in &san.general_names {
        match name {
            GeneralName::URI(uri) => {
                uri_count += 1;
                if uri_count > MAX_URI_SAN_ENTRIES {
                    return Err(CertificateError::TooManyUriSanEntries {
                        max: MAX_URI_SAN_ENTRIES,
                    });
                }
                if uri.len() > MAX_URI_LENGTH {
                    continue;
                }
                entries.push(SanEntry::Uri((*uri).to_owned()));
            }
            GeneralName::DNSName(dns) => entries.push(SanEntry::Dns((*dns).to_owned())),
            _ => entries.push(SanEntry::Other),
        }
    }

    Ok(entries)
}

/// Returns the first URI SAN of `cert`, whatever its length and however many
/// follow it.
pub(crate) fn first_uri_san(cert: &X509Certificate<'_>) -> Result<Option<String>, CertificateError> {
    let Some(san) = subject_alt_name(cert)? else {
        return Ok(None);
    };
    Ok(san.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) => Some((*uri).to_owned()),
        _ => None,
    }))
}

/// Returns the first subject common name, if it is a printable string.
pub(crate) fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .map(str::to_owned)
}

/// Returns the `(not_before, not_after)` validity window.
pub(crate) fn validity(cert: &X509Certificate<'_>) -> (OffsetDateTime, OffsetDateTime) {
    let validity = cert.validity();
    (
        validity.not_before.to_datetime(),
        validity.not_after.to_datetime(),
    )
}
