//! Shared plumbing for the `workload-server` and `workload-client` binaries.
//!
//! Both binaries fetch their identity from an authority address, build an
//! authorization policy from the command line and speak HTTP/1.1 over mutual
//! TLS: the client sends `GET /` and the server greets it by identity.

use anyhow::Context as _;
use bytes::Bytes;
use clap::{Args, Parser};
use http::{Request, Response, StatusCode};
use log::{info, warn};
use std::time::Duration;
use workload_identity::{authority, IdentitySource, IdentitySourceBuilder};
use workload_identity_rustls::{authorizer, Authorizer, PeerIdentity};
use workload_identity_tokio::{Client, RequestContext, Server};

/// Default authority address, matching the SPIRE agent's public socket.
pub const DEFAULT_AUTHORITY: &str = "unix:///tmp/spire-agent/public/api.sock";

/// Identity and authorization flags shared by both binaries.
#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Identity authority: `unix://` or `tcp://` Workload API endpoint, or a
    /// directory of PEM files (`file:///path` or a bare path)
    #[arg(long, env = "WORKLOAD_AUTHORITY_ADDR", default_value = DEFAULT_AUTHORITY)]
    pub authority: String,

    /// Accept only this peer identity (repeatable)
    #[arg(long = "allow-id", value_name = "SPIFFE_ID")]
    pub allow_ids: Vec<String>,

    /// Accept any peer in this trust domain (repeatable)
    #[arg(long = "allow-trust-domain", value_name = "TRUST_DOMAIN")]
    pub allow_trust_domains: Vec<String>,

    /// Refresh once this fraction of the credential lifetime remains
    #[arg(long, default_value_t = 0.5)]
    pub refresh_low_water_mark: f64,

    /// Seconds to wait for the first credential before giving up
    #[arg(long, default_value_t = 15)]
    pub initial_fetch_timeout: u64,
}

/// Serves the hello service over mutual TLS.
#[derive(Parser, Debug, Clone)]
#[command(name = "workload-server", version, about, long_about = None)]
pub struct ServerArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub listen: String,
}

/// Calls the hello service over mutual TLS and prints the reply.
#[derive(Parser, Debug, Clone)]
#[command(name = "workload-client", version, about, long_about = None)]
pub struct ClientArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Server address as `host:port`
    #[arg(long, default_value = "workload-server:8443")]
    pub target: String,

    /// TLS server name (SNI); defaults to the host of `--target`
    #[arg(long)]
    pub server_name: Option<String>,

    /// Request path
    #[arg(long, default_value = "/")]
    pub path: String,

    /// Seconds allowed for the whole request
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

/// Connects to the authority and waits for the first credential.
///
/// # Errors
///
/// Fails if the address is invalid or no usable material arrives within the
/// initial fetch timeout.
pub async fn build_source(args: &IdentityArgs) -> anyhow::Result<IdentitySource> {
    let authority = authority::from_address(&args.authority)
        .with_context(|| format!("invalid authority address {:?}", args.authority))?;

    let source = IdentitySourceBuilder::from_arc(authority)
        .refresh_low_water_mark(args.refresh_low_water_mark)
        .initial_fetch_timeout(Duration::from_secs(args.initial_fetch_timeout))
        .build()
        .await
        .with_context(|| format!("fetching initial identity from {}", args.authority))?;

    info!("identity source ready (version {})", source.version());
    Ok(source)
}

/// Builds the peer authorization policy from `--allow-id` and
/// `--allow-trust-domain`.
///
/// With both kinds of flags a peer passes if either list admits it. With
/// neither, every authenticated peer is accepted.
///
/// # Errors
///
/// Fails on malformed identities or trust domain names.
pub fn authorizer_from(args: &IdentityArgs) -> anyhow::Result<Box<dyn Authorizer>> {
    let ids = if args.allow_ids.is_empty() {
        None
    } else {
        Some(authorizer::exact(&args.allow_ids).context("invalid --allow-id")?)
    };
    let domains = if args.allow_trust_domains.is_empty() {
        None
    } else {
        Some(
            authorizer::trust_domains(&args.allow_trust_domains)
                .context("invalid --allow-trust-domain")?,
        )
    };

    Ok(match (ids, domains) {
        (Some(ids), Some(domains)) => Box::new(move |peer: &PeerIdentity| {
            ids.authorize(peer) || domains.authorize(peer)
        }),
        (Some(ids), None) => Box::new(ids),
        (None, Some(domains)) => Box::new(domains),
        (None, None) => {
            warn!("no --allow-id or --allow-trust-domain given; accepting any authenticated peer");
            Box::new(authorizer::any())
        }
    })
}

/// Binds the server described by `args`.
///
/// # Errors
///
/// Fails on an invalid policy, TLS config errors or if the address cannot be
/// bound.
pub async fn build_server(args: &ServerArgs, source: IdentitySource) -> anyhow::Result<Server> {
    let server = Server::builder(source)
        .listen(&args.listen)
        .authorize(authorizer_from(&args.identity)?)
        .build()
        .await
        .with_context(|| format!("starting server on {}", args.listen))?;
    Ok(server)
}

/// Builds the client described by `args`.
///
/// # Errors
///
/// Fails on an invalid policy or server name.
pub fn build_client(args: &ClientArgs, source: IdentitySource) -> anyhow::Result<Client> {
    let mut builder = Client::builder(source)
        .target(&args.target)
        .authorize(authorizer_from(&args.identity)?)
        .timeout(Duration::from_secs(args.timeout));
    if let Some(name) = &args.server_name {
        builder = builder.server_name(name);
    }
    Ok(builder.build()?)
}

/// The hello handler: greets the caller by its authenticated identity.
pub async fn greet(request: Request<Bytes>) -> Response<Bytes> {
    let Some(ctx) = RequestContext::from_request(&request) else {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    };
    info!(
        "{} {} from {} ({})",
        request.method(),
        request.uri(),
        ctx.peer(),
        ctx.remote_addr()
    );
    Response::new(Bytes::from(format!(
        "Hello, client with SPIFFE ID: {}\n",
        ctx.peer().id()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(extra: &[&str]) -> IdentityArgs {
        let mut argv = vec!["workload-server", "--authority", "/tmp/identity"];
        argv.extend_from_slice(extra);
        ServerArgs::try_parse_from(argv).unwrap().identity
    }

    #[test]
    fn server_defaults() {
        let args = ServerArgs::try_parse_from(["workload-server", "--authority", "/tmp/x"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:8443");
        assert!((args.identity.refresh_low_water_mark - 0.5).abs() < f64::EPSILON);
        assert!(args.identity.allow_ids.is_empty());
    }

    #[test]
    fn client_defaults() {
        let args = ClientArgs::try_parse_from(["workload-client", "--authority", "/tmp/x"]).unwrap();
        assert_eq!(args.target, "workload-server:8443");
        assert_eq!(args.server_name, None);
        assert_eq!(args.path, "/");
    }

    #[test]
    fn allow_flags_repeat() {
        let args = identity(&[
            "--allow-id",
            "spiffe://example.org/a",
            "--allow-id",
            "spiffe://example.org/b",
            "--allow-trust-domain",
            "other.org",
        ]);
        assert_eq!(args.allow_ids.len(), 2);
        assert_eq!(args.allow_trust_domains, ["other.org"]);
        assert!(authorizer_from(&args).is_ok());
    }

    #[tokio::test]
    async fn greet_without_context_is_a_server_error() {
        let request = Request::get("/").body(Bytes::new()).unwrap();
        assert_eq!(greet(request).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn malformed_policy_is_rejected() {
        assert!(authorizer_from(&identity(&["--allow-id", "not a uri"])).is_err());
        assert!(authorizer_from(&identity(&["--allow-trust-domain", "Bad Domain!"])).is_err());
    }
}
