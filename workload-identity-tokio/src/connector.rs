//! TLS connector for client-side connections.

use crate::error::Error;
use crate::prelude::debug;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use workload_identity::IdentitySource;
use workload_identity_rustls::{peer_identity, PeerIdentity};

/// A TLS connector that checks the local credential before dialing and
/// returns the server's identity with the stream.
///
/// # Example
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # use workload_identity_rustls::mtls_client;
/// # use workload_identity_tokio::TlsConnector;
/// # use std::sync::Arc;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
/// let config = mtls_client(source.clone()).build()?;
///
/// let connector = TlsConnector::new(source, Arc::new(config));
/// let (_stream, peer) = connector
///     .connect_addr("127.0.0.1:8443".parse()?, "workload-server".try_into()?)
///     .await?;
/// println!("connected to {peer}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TlsConnector {
    source: IdentitySource,
    inner: TokioTlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Creates a connector over a client config built from the same source.
    pub fn new(source: IdentitySource, config: Arc<ClientConfig>) -> Self {
        Self {
            source,
            inner: TokioTlsConnector::from(config),
        }
    }

    /// Runs a TLS handshake over an established TCP stream.
    ///
    /// `server_name` only drives SNI; the server is authenticated by its
    /// chain and authorized by its resolved identity.
    ///
    /// # Errors
    ///
    /// * [`Error::CredentialExpired`] if the local credential is expired
    /// * [`Error::PeerAuthenticationFailed`] if the handshake fails
    /// * [`Error::ConnectionFailed`] on transport errors
    pub async fn connect(
        &self,
        server_name: ServerName<'static>,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), Error> {
        self.source.current_credential()?;

        let tls_stream = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(Error::from_io)?;

        let (_io, client_conn) = tls_stream.get_ref();
        let peer = peer_identity(client_conn);
        debug!("connected to {peer}");

        Ok((tls_stream, peer))
    }

    /// Dials `addr` and then runs [`TlsConnector::connect`].
    ///
    /// The credential is checked before the TCP connection is opened.
    ///
    /// # Errors
    ///
    /// Same as [`TlsConnector::connect`].
    pub async fn connect_addr(
        &self,
        addr: SocketAddr,
        server_name: ServerName<'static>,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), Error> {
        self.source.current_credential()?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(Error::ConnectionFailed)?;
        self.connect(server_name, stream).await
    }

    /// Like [`TlsConnector::connect_addr`], resolving `target` (`host:port`).
    pub(crate) async fn connect_host(
        &self,
        target: &str,
        server_name: ServerName<'static>,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), Error> {
        self.source.current_credential()?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(Error::ConnectionFailed)?;
        self.connect(server_name, stream).await
    }
}
