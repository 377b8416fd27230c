//! HTTP/1.1 server over mutual TLS.

use crate::acceptor::TlsAcceptor;
use crate::context::RequestContext;
use crate::error::Error;
use crate::prelude::{debug, info, warn};
use crate::MAX_BODY_LEN;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::server::ClientHello;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use workload_identity::IdentitySource;
use workload_identity_rustls::{mtls_server, Authorizer, ClientHelloHook};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Boxed future returned by [`Handler::call`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Bytes>> + Send>>;

/// Application logic invoked once per request.
///
/// The request body is fully read before the call, and the request carries
/// the connection's [`RequestContext`] in its extensions.
///
/// Implemented for any `Fn(Request<Bytes>) -> impl Future<Output = Response<Bytes>>`.
pub trait Handler: Send + Sync + 'static {
    /// Handles one request.
    fn call(&self, request: Request<Bytes>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Bytes>> + Send + 'static,
{
    fn call(&self, request: Request<Bytes>) -> HandlerFuture {
        Box::pin(self(request))
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    source: IdentitySource,
    listen: Option<String>,
    authorizer: Option<Arc<dyn Authorizer>>,
    hook: Option<ClientHelloHook>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("listen", &self.listen)
            .field("authorizer", &self.authorizer.is_some())
            .field("hook", &self.hook.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Sets the listen address, e.g. `0.0.0.0:8443`. Required.
    #[must_use]
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    /// Sets the authorization policy for client identities.
    #[must_use]
    pub fn authorize<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Installs a per-connection config hook; see
    /// [`workload_identity_rustls::ServerConfigBuilder::config_for_client`].
    #[must_use]
    pub fn config_for_client<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientHello<'_>) -> Option<Arc<ServerConfig>> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Bounds each TLS handshake. Default: 10s.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bounds the reads after the handshake: the wait for each request head
    /// (the first one included) and for each request body. A connection that
    /// stays silent longer is closed; a stalled body gets `408`. Default: 30s.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Binds the listener and builds the TLS configuration.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingAddress`] if no listen address was set
    /// * [`Error::ConnectionFailed`] if binding fails
    /// * [`Error::Config`] if the TLS config cannot be built
    pub async fn build(self) -> Result<Server, Error> {
        let listen = self.listen.ok_or(Error::MissingAddress("listen"))?;

        let mut config = mtls_server(self.source.clone());
        if let Some(authorizer) = self.authorizer {
            config = config.authorize(authorizer);
        }
        if let Some(hook) = self.hook {
            config = config.config_for_client(move |hello: &ClientHello<'_>| hook(hello));
        }
        let selector = config.build_selector()?;

        let listener = TcpListener::bind(&listen)
            .await
            .map_err(Error::ConnectionFailed)?;
        let local_addr = listener.local_addr().map_err(Error::ConnectionFailed)?;

        Ok(Server {
            listener,
            local_addr,
            acceptor: TlsAcceptor::new(self.source, selector),
            timeouts: Timeouts {
                handshake: self.handshake_timeout,
                idle: self.idle_timeout,
            },
        })
    }
}

/// Accepts mTLS connections and serves HTTP/1.1 on them, running a
/// [`Handler`] for every request.
///
/// Each connection (handshake included) runs on its own task; a failed
/// handshake only drops that connection. Request bodies larger than
/// [`MAX_BODY_LEN`](crate::MAX_BODY_LEN) are answered with `413`.
///
/// # Example
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # use workload_identity_tokio::{CancellationToken, RequestContext, Server};
/// # use bytes::Bytes;
/// # use http::{Request, Response};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
/// let server = Server::builder(source).listen("0.0.0.0:8443").build().await?;
///
/// let shutdown = CancellationToken::new();
/// server
///     .serve(
///         |req: Request<Bytes>| async move {
///             let peer = RequestContext::from_request(&req).map(|ctx| ctx.peer().to_string());
///             Response::new(Bytes::from(format!("hello {}", peer.unwrap_or_default())))
///         },
///         shutdown,
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    timeouts: Timeouts,
}

#[derive(Clone, Copy, Debug)]
struct Timeouts {
    handshake: Duration,
    idle: Duration,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Starts building a server over `source`.
    pub fn builder(source: IdentitySource) -> ServerBuilder {
        ServerBuilder {
            source,
            listen: None,
            authorizer: None,
            hook: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// Cancellation stops accepting new connections; connections already
    /// accepted run to completion.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok(())`; accept errors are logged and
    /// retried.
    pub async fn serve<H: Handler>(self, handler: H, shutdown: CancellationToken) -> Result<(), Error> {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        info!("serving on {}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("server on {} shutting down", self.local_addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (tcp, remote_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let handler = Arc::clone(&handler);
            let timeouts = self.timeouts;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(acceptor, handler, tcp, remote_addr, timeouts).await {
                    warn!("connection from {remote_addr} failed: {e}");
                }
            });
        }
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    handler: Arc<dyn Handler>,
    tcp: TcpStream,
    remote_addr: SocketAddr,
    timeouts: Timeouts,
) -> Result<(), Error> {
    let (tls, peer) = tokio::time::timeout(timeouts.handshake, acceptor.accept(tcp))
        .await
        .map_err(|_| Error::timed_out("TLS handshake"))??;
    debug!("connection from {remote_addr} authenticated as {peer}");

    let ctx = RequestContext::new(peer, remote_addr);
    let service = service_fn(move |request: Request<Incoming>| {
        dispatch(Arc::clone(&handler), ctx.clone(), request, timeouts.idle)
    });

    // The header read timer also runs while a keep-alive connection waits
    // for its next request.
    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.idle)
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(Error::from_hyper)?;

    debug!("connection from {remote_addr} closed");
    Ok(())
}

async fn dispatch(
    handler: Arc<dyn Handler>,
    ctx: RequestContext,
    request: Request<Incoming>,
    idle_timeout: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (mut parts, body) = request.into_parts();

    let body = Limited::new(body, MAX_BODY_LEN).collect();
    let body = match tokio::time::timeout(idle_timeout, body).await {
        Ok(Ok(body)) => body.to_bytes(),
        Ok(Err(e)) => {
            let status = match Error::from_body(e) {
                Error::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            debug!("rejecting request from {}: {status}", ctx.peer());
            return Ok(empty(status));
        }
        Err(_) => {
            debug!("request body from {} timed out", ctx.peer());
            return Ok(empty(StatusCode::REQUEST_TIMEOUT));
        }
    };

    parts.extensions.insert(ctx);
    let response = handler.call(Request::from_parts(parts, body)).await;
    Ok(response.map(Full::new))
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
