//! TLS acceptor for server-side connections.

use crate::error::Error;
use crate::prelude::debug;
use rustls::server::Acceptor;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use workload_identity::IdentitySource;
use workload_identity_rustls::{peer_identity, PeerIdentity, ServerConfigSelector};

/// A TLS acceptor that reads the `ClientHello` first, lets the selector pick
/// the config, and returns the client's identity with the stream.
///
/// # Example
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # use workload_identity_rustls::mtls_server;
/// # use workload_identity_tokio::TlsAcceptor;
/// # use tokio::net::TcpListener;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
/// let selector = mtls_server(source.clone()).build_selector()?;
///
/// let acceptor = TlsAcceptor::new(source, selector);
/// let listener = TcpListener::bind("127.0.0.1:8443").await?;
///
/// loop {
///     let (stream, _) = listener.accept().await?;
///     let acceptor = acceptor.clone();
///
///     tokio::spawn(async move {
///         match acceptor.accept(stream).await {
///             Ok((_tls_stream, peer)) => println!("accepted {peer}"),
///             Err(e) => eprintln!("TLS connection failed: {e}"),
///         }
///     });
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct TlsAcceptor {
    source: IdentitySource,
    selector: ServerConfigSelector,
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("source", &self.source)
            .field("selector", &self.selector)
            .finish()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor over a selector built from the same source.
    pub fn new(source: IdentitySource, selector: impl Into<ServerConfigSelector>) -> Self {
        Self {
            source,
            selector: selector.into(),
        }
    }

    /// Runs the server side of the handshake on `stream`.
    ///
    /// # Errors
    ///
    /// * [`Error::CredentialExpired`] if the local credential is expired; the
    ///   connection is dropped without a handshake
    /// * [`Error::PeerAuthenticationFailed`] if the client chain is rejected
    /// * [`Error::ConnectionFailed`] on transport errors
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), Error> {
        self.source.current_credential()?;

        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(Error::from_io)?;

        let config = self.selector.select(&start.client_hello());
        let tls_stream = start.into_stream(config).await.map_err(Error::from_io)?;

        let (_io, server_conn) = tls_stream.get_ref();
        let peer = peer_identity(server_conn);
        debug!("accepted {peer}");

        Ok((tls_stream, peer))
    }
}

