//! Process-wide `rustls` crypto provider selection.

use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Installs the crate's crypto provider as the process default, once.
///
/// Installation is best-effort: if the application (or another crate) already
/// installed a provider, that provider is kept.
pub fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the process default provider, installing ours first if needed.
///
/// Returns `None` only if installation raced with a failing custom provider
/// setup, which leaves no default in place.
pub fn default_provider() -> Option<Arc<CryptoProvider>> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default().cloned()
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_available_after_install() {
        ensure_crypto_provider_installed();
        ensure_crypto_provider_installed();
        assert!(default_provider().is_some());
    }
}
