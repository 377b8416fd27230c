//! Test-only certificate authority.
//!
//! Issues SPIFFE-shaped leaf certificates (URI SAN, server + client auth) from
//! an in-memory root. Everything is returned as plain DER/PEM bytes so the
//! harness stays independent of the crates under test.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

/// An in-memory root CA for one trust domain.
pub struct TestCa {
    trust_domain: String,
    key: KeyPair,
    cert: Certificate,
}

impl std::fmt::Debug for TestCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCa")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

impl TestCa {
    /// Creates a self-signed root valid for one day around now.
    pub fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().expect("generate CA key");

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{trust_domain} test root"));
        dn.push(DnType::OrganizationName, trust_domain);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(1);

        let cert = params.self_signed(&key).expect("self-sign CA");

        Self {
            trust_domain: trust_domain.to_owned(),
            key,
            cert,
        }
    }

    /// Returns the trust domain name this CA was created for.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// DER encoding of the root certificate.
    pub fn root_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// PEM encoding of the root certificate.
    pub fn root_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issues `spiffe://<trust domain><path>` with default validity.
    pub fn issue_workload(&self, path: &str) -> IssuedLeaf {
        self.issue(LeafSpec::spiffe(&format!(
            "spiffe://{}{}",
            self.trust_domain, path
        )))
    }

    /// Issues a leaf certificate signed by this CA.
    pub fn issue(&self, spec: LeafSpec) -> IssuedLeaf {
        let key = KeyPair::generate().expect("generate leaf key");

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = &spec.common_name {
            dn.push(DnType::CommonName, cn.as_str());
        }
        params.distinguished_name = dn;

        for uri in &spec.uris {
            let uri = Ia5String::try_from(uri.as_str()).expect("URI SAN must be IA5");
            params.subject_alt_names.push(SanType::URI(uri));
        }
        for dns in &spec.dns {
            let dns = Ia5String::try_from(dns.as_str()).expect("DNS SAN must be IA5");
            params.subject_alt_names.push(SanType::DnsName(dns));
        }

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = spec.not_before;
        params.not_after = spec.not_after;

        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf");

        IssuedLeaf {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
            key_pem: key.serialize_pem(),
        }
    }
}

/// What to put in an issued leaf.
#[derive(Debug, Clone)]
pub struct LeafSpec {
    uris: Vec<String>,
    dns: Vec<String>,
    common_name: Option<String>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl LeafSpec {
    fn blank() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            uris: Vec::new(),
            dns: Vec::new(),
            common_name: None,
            not_before: now - Duration::minutes(5),
            not_after: now + Duration::hours(1),
        }
    }

    /// A leaf carrying one URI SAN.
    pub fn spiffe(uri: &str) -> Self {
        let mut spec = Self::blank();
        spec.uris.push(uri.to_owned());
        spec
    }

    /// A leaf with no SAN extension and the given subject common name.
    pub fn common_name(cn: &str) -> Self {
        let mut spec = Self::blank();
        spec.common_name = Some(cn.to_owned());
        spec
    }

    /// A leaf with neither SANs nor a common name.
    pub fn anonymous() -> Self {
        Self::blank()
    }

    /// Adds another URI SAN after the existing ones.
    #[must_use]
    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uris.push(uri.to_owned());
        self
    }

    /// Adds a DNS SAN.
    #[must_use]
    pub fn with_dns(mut self, dns: &str) -> Self {
        self.dns.push(dns.to_owned());
        self
    }

    /// Sets the subject common name.
    #[must_use]
    pub fn with_common_name(mut self, cn: &str) -> Self {
        self.common_name = Some(cn.to_owned());
        self
    }

    /// Valid from `back` ago until `ahead` from now.
    #[must_use]
    pub fn valid_around_now(mut self, back: Duration, ahead: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        self.not_before = now - back;
        self.not_after = now + ahead;
        self
    }
}

/// A signed leaf and its PKCS#8 private key.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    /// Leaf certificate, DER.
    pub cert_der: Vec<u8>,
    /// Leaf certificate, PEM.
    pub cert_pem: String,
    /// PKCS#8 private key, DER.
    pub key_der: Vec<u8>,
    /// PKCS#8 private key, PEM.
    pub key_pem: String,
}

impl IssuedLeaf {
    /// Leaf-first chain containing only the leaf.
    pub fn chain(&self) -> Vec<Vec<u8>> {
        vec![self.cert_der.clone()]
    }
}

/// A fresh PKCS#8 key that matches no issued certificate.
pub fn unrelated_key_der() -> Vec<u8> {
    KeyPair::generate()
        .expect("generate unrelated key")
        .serialize_der()
}
