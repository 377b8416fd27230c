use http::Request;
use std::net::SocketAddr;
use workload_identity_rustls::PeerIdentity;

/// What a handler knows about the connection a request arrived on.
///
/// Built once per connection after the handshake and inserted into the
/// extensions of every request read from it.
#[derive(Clone, Debug)]
pub struct RequestContext {
    peer: PeerIdentity,
    remote_addr: SocketAddr,
}

impl RequestContext {
    pub(crate) fn new(peer: PeerIdentity, remote_addr: SocketAddr) -> Self {
        Self { peer, remote_addr }
    }

    /// The context the [`Server`](crate::Server) attached to `request`.
    pub fn from_request<B>(request: &Request<B>) -> Option<&Self> {
        request.extensions().get::<Self>()
    }

    /// The authenticated peer. Its id is `unknown` if no name could be
    /// resolved from the leaf.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// The peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
