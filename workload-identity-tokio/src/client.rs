//! One-shot HTTP/1.1 client over mutual TLS.

use crate::connector::TlsConnector;
use crate::error::Error;
use crate::prelude::debug;
use crate::MAX_BODY_LEN;
use bytes::Bytes;
use http::header::HOST;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use workload_identity::IdentitySource;
use workload_identity_rustls::{mtls_client, Authorizer, PeerIdentity};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`Client`].
pub struct ClientBuilder {
    source: IdentitySource,
    target: Option<String>,
    server_name: Option<String>,
    authorizer: Option<Arc<dyn Authorizer>>,
    timeout: Duration,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("target", &self.target)
            .field("server_name", &self.server_name)
            .field("authorizer", &self.authorizer.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Sets the server address as `host:port`. Required.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the SNI name. Defaults to the host part of the target.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Sets the authorization policy for the server identity.
    #[must_use]
    pub fn authorize<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Bounds one whole request: dial, handshake, send and receive the body.
    ///
    /// Default: 10s.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingAddress`] if no target was set
    /// * [`Error::InvalidServerName`] if the server name is not a DNS name or IP
    /// * [`Error::Config`] if the TLS config cannot be built
    pub fn build(self) -> Result<Client, Error> {
        let target = self.target.ok_or(Error::MissingAddress("target"))?;

        let name = self
            .server_name
            .unwrap_or_else(|| host_of(&target).to_owned());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| Error::InvalidServerName(name))?;

        let mut config = mtls_client(self.source.clone());
        if let Some(authorizer) = self.authorizer {
            config = config.authorize(authorizer);
        }
        let config = config.build()?;

        Ok(Client {
            connector: TlsConnector::new(self.source, Arc::new(config)),
            target,
            server_name,
            timeout: self.timeout,
        })
    }
}

/// Host part of `host:port`, with brackets stripped from IPv6 literals.
fn host_of(target: &str) -> &str {
    let host = match target.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => target,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Sends each HTTP/1.1 request over its own fresh mTLS connection.
///
/// Every request presents the current credential and validates the server
/// against the current bundle. Failed requests are not retried.
///
/// # Example
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # use workload_identity_tokio::Client;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
/// let client = Client::builder(source).target("workload-server:8443").build()?;
///
/// let response = client.get("/").await?;
/// println!("{}", String::from_utf8_lossy(response.body()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    connector: TlsConnector,
    target: String,
    server_name: ServerName<'static>,
    timeout: Duration,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("target", &self.target)
            .field("server_name", &self.server_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Starts building a client over `source`.
    pub fn builder(source: IdentitySource) -> ClientBuilder {
        ClientBuilder {
            source,
            target: None,
            server_name: None,
            authorizer: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sends `GET <path>` to the target.
    ///
    /// # Errors
    ///
    /// Same as [`Client::send`], plus [`Error::InvalidRequest`] if `path` is
    /// not a valid request target.
    pub async fn get(&self, path: &str) -> Result<Response<Bytes>, Error> {
        let request = Request::get(path)
            .body(Bytes::new())
            .map_err(Error::InvalidRequest)?;
        self.send(request).await
    }

    /// Sends `request` and returns the response with its whole body.
    ///
    /// Only the path and query of the request URI are used. A missing `Host`
    /// header is set to the target.
    ///
    /// # Errors
    ///
    /// * [`Error::CredentialExpired`] before dialing if the credential expired
    /// * [`Error::PeerAuthenticationFailed`] if either side rejects the handshake
    /// * [`Error::ConnectionFailed`] on transport errors, timeouts, or if the
    ///   server closes without answering
    /// * [`Error::BodyTooLarge`] if the response body exceeds [`MAX_BODY_LEN`]
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        self.send_with_peer(request).await.map(|(response, _)| response)
    }

    /// Like [`Client::send`], also returning the server's identity.
    ///
    /// # Errors
    ///
    /// Same as [`Client::send`].
    pub async fn send_with_peer(
        &self,
        request: Request<Bytes>,
    ) -> Result<(Response<Bytes>, PeerIdentity), Error> {
        if request.body().len() > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge { max: MAX_BODY_LEN });
        }
        let request = self.origin_form(request)?;

        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| Error::timed_out("request"))?
    }

    fn origin_form(&self, request: Request<Bytes>) -> Result<Request<Full<Bytes>>, Error> {
        let (mut parts, body) = request.into_parts();

        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);

        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.target)
                .map_err(|e| Error::InvalidRequest(e.into()))?;
            parts.headers.insert(HOST, host);
        }

        Ok(Request::from_parts(parts, Full::new(body)))
    }

    async fn exchange(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(Response<Bytes>, PeerIdentity), Error> {
        let (tls, peer) = self
            .connector
            .connect_host(&self.target, self.server_name.clone())
            .await?;
        debug!("{} {} to {peer} at {}", request.method(), request.uri(), self.target);

        let (mut sender, conn) = http1::handshake(TokioIo::new(tls))
            .await
            .map_err(Error::from_hyper)?;
        let target = self.target.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("connection to {target} ended: {e}");
            }
        });

        let response = sender.send_request(request).await.map_err(Error::from_hyper)?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, MAX_BODY_LEN)
            .collect()
            .await
            .map_err(Error::from_body)?
            .to_bytes();

        Ok((Response::from_parts(parts, body), peer))
    }
}
