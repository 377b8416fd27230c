use crate::authority::{Authority, AuthorityError, AuthorityMaterial, AuthorityFuture};
use crate::prelude::debug;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};

const CHAIN_FILE: &str = "svid.pem";
const KEY_FILE: &str = "svid_key.pem";
const BUNDLE_FILE: &str = "bundle.pem";

/// Reads identity material from PEM files in a directory.
///
/// The directory must contain:
///
/// * `svid.pem`: leaf-first certificate chain
/// * `svid_key.pem`: PKCS#8 private key of the leaf
/// * `bundle.pem`: trust bundle roots
///
/// Files are re-read on every fetch, so an external agent that rewrites them
/// (for example `spiffe-helper`) drives rotation.
#[derive(Debug, Clone)]
pub struct DirectoryAuthority {
    dir: PathBuf,
}

impl DirectoryAuthority {
    /// Creates an authority reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, AuthorityError> {
        let path = self.dir.join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|source| AuthorityError::Io { path, source })
    }

    async fn load(&self) -> Result<AuthorityMaterial, AuthorityError> {
        let chain_pem = self.read(CHAIN_FILE).await?;
        let key_pem = self.read(KEY_FILE).await?;
        let bundle_pem = self.read(BUNDLE_FILE).await?;

        let cert_chain = certificates(&chain_pem, CHAIN_FILE)?;
        let trust_bundle = certificates(&bundle_pem, BUNDLE_FILE)?;

        let private_key = match PrivateKeyDer::from_pem_slice(&key_pem) {
            Ok(PrivateKeyDer::Pkcs8(key)) => key.secret_pkcs8_der().to_vec(),
            Ok(_) => {
                return Err(AuthorityError::MalformedResponse(format!(
                    "{KEY_FILE}: private key is not PKCS#8"
                )))
            }
            Err(e) => {
                return Err(AuthorityError::MalformedResponse(format!("{KEY_FILE}: {e}")))
            }
        };

        debug!(
            "read identity material from {}: chain={}, bundle={}",
            self.dir.display(),
            cert_chain.len(),
            trust_bundle.len()
        );

        Ok(AuthorityMaterial::new(cert_chain, private_key, trust_bundle))
    }
}

fn certificates(pem: &[u8], file: &str) -> Result<Vec<Vec<u8>>, AuthorityError> {
    CertificateDer::pem_slice_iter(pem)
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AuthorityError::MalformedResponse(format!("{file}: {e}")))
}

impl Authority for DirectoryAuthority {
    fn fetch(&self) -> AuthorityFuture<'_> {
        Box::pin(self.load())
    }
}
