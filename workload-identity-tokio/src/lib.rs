#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # workload-identity-tokio
//!
//! Tokio-native mTLS plumbing on top of
//! [`workload-identity-rustls`](workload_identity_rustls) configs.
//!
//! * [`TlsConnector`] and [`TlsAcceptor`] return `(TlsStream, PeerIdentity)`
//!   after a successful handshake.
//! * [`Client`] sends each HTTP/1.1 request over a fresh connection.
//! * [`Server`] accepts connections, resolves each client's identity and
//!   serves HTTP/1.1 with `hyper`, running a [`Handler`] for every request.
//!   The request's extensions carry a [`RequestContext`].
//!
//! Every new connection reads the identity source's current snapshot, so a
//! rotation takes effect on the next connection without a restart.
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use workload_identity::IdentitySource;
//! use workload_identity_rustls::authorizer;
//! use workload_identity_tokio::Client;
//!
//! let source = IdentitySource::connect("unix:///tmp/spire-agent/public/api.sock").await?;
//! let client = Client::builder(source)
//!     .target("workload-server:8443")
//!     .authorize(authorizer::trust_domains(["example.org"])?)
//!     .build()?;
//!
//! let response = client.get("/").await?;
//! println!("{}", String::from_utf8_lossy(response.body()));
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod client;
mod connector;
mod context;
mod error;
mod server;

mod observability;
mod prelude;

pub use acceptor::TlsAcceptor;
pub use client::{Client, ClientBuilder};
pub use connector::TlsConnector;
pub use context::RequestContext;
pub use error::Error;
pub use server::{Handler, HandlerFuture, Server, ServerBuilder};

/// Largest request or response body accepted (1 MiB).
pub const MAX_BODY_LEN: usize = 1024 * 1024;

pub use tokio_util::sync::CancellationToken;
pub use workload_identity_rustls::PeerIdentity;
