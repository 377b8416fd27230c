use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_harness::{LeafSpec, TestCa};
use tokio::task::JoinHandle;
use workload_identity::{AuthorityMaterial, IdentitySource, StaticAuthority};
use workload_identity_rustls::{authorizer, Authorizer};
use workload_identity_rustls::mtls_client;
use workload_identity_tokio::{
    CancellationToken, Client, Error, RequestContext, Server, TlsConnector, MAX_BODY_LEN,
};

fn material(ca: &TestCa, id: &str) -> AuthorityMaterial {
    let leaf = ca.issue(LeafSpec::spiffe(id));
    AuthorityMaterial::new(leaf.chain(), leaf.key_der, vec![ca.root_der()])
}

async fn source(material: AuthorityMaterial) -> (StaticAuthority, IdentitySource) {
    let authority = StaticAuthority::new(material);
    let source = IdentitySource::builder(authority.clone()).build().await.unwrap();
    (authority, source)
}

struct Running {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

async fn start_server(source: IdentitySource, auth: impl Authorizer) -> Running {
    start_server_idle(source, auth, Duration::from_secs(30)).await
}

async fn start_server_idle(
    source: IdentitySource,
    auth: impl Authorizer,
    idle_timeout: Duration,
) -> Running {
    let server = Server::builder(source)
        .listen("127.0.0.1:0")
        .authorize(auth)
        .idle_timeout(idle_timeout)
        .build()
        .await
        .unwrap();
    let addr = server.local_addr();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = move |request: Request<Bytes>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let ctx = RequestContext::from_request(&request).unwrap();
            Response::new(Bytes::from(format!(
                "Hello, client with SPIFFE ID: {}",
                ctx.peer().id()
            )))
        }
    };

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.serve(handler, shutdown.clone()));
    Running {
        addr,
        calls,
        shutdown,
        task,
    }
}

fn get(path: &str) -> Request<Bytes> {
    Request::get(path).body(Bytes::new()).unwrap()
}

fn client(source: IdentitySource, addr: SocketAddr) -> Client {
    Client::builder(source)
        .target(addr.to_string())
        .server_name("workload-server")
        .build()
        .unwrap()
}

#[tokio::test]
async fn end_to_end_rotation_without_restart() {
    let ca_v1 = TestCa::new("example.org");
    let (server_authority, server_source) =
        source(material(&ca_v1, "spiffe://example.org/server")).await;
    let (client_authority, client_source) =
        source(material(&ca_v1, "spiffe://example.org/client")).await;

    let server = start_server(server_source.clone(), authorizer::any()).await;
    let client = client(client_source.clone(), server.addr);

    let (response, peer) = client.send_with_peer(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        &response.body()[..],
        b"Hello, client with SPIFFE ID: spiffe://example.org/client"
    );
    assert_eq!(peer.id(), "spiffe://example.org/server");

    // Both sides move to material from a new root.
    let ca_v2 = TestCa::new("example.org");
    server_authority.rotate(material(&ca_v2, "spiffe://example.org/server"));
    client_authority.rotate(material(&ca_v2, "spiffe://example.org/client"));

    assert_eq!(server_source.refresh().await.unwrap(), 2);
    // The client still trusts only the v1 root.
    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, Error::PeerAuthenticationFailed(_)), "got {err:?}");

    assert_eq!(client_source.refresh().await.unwrap(), 2);
    let response = client.get("/").await.unwrap();
    assert_eq!(
        &response.body()[..],
        b"Hello, client with SPIFFE ID: spiffe://example.org/client"
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);

    server.stop().await;
}

#[tokio::test]
async fn untrusted_client_never_reaches_handler() {
    let ca = TestCa::new("example.org");
    let rogue_ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;

    // Trusts the real root, but its own leaf comes from elsewhere.
    let rogue_leaf = rogue_ca.issue(LeafSpec::spiffe("spiffe://example.org/client"));
    let (_rogue_authority, rogue_source) = source(AuthorityMaterial::new(
        rogue_leaf.chain(),
        rogue_leaf.key_der,
        vec![ca.root_der()],
    ))
    .await;

    let server = start_server(server_source, authorizer::any()).await;

    let err = client(rogue_source, server.addr).get("/").await.unwrap_err();
    assert!(
        matches!(err, Error::PeerAuthenticationFailed(_) | Error::ConnectionFailed(_)),
        "got {err:?}"
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    // The failed handshake only affected its own connection.
    let (_client_authority, good_source) =
        source(material(&ca, "spiffe://example.org/client")).await;
    assert!(client(good_source, server.addr).get("/").await.is_ok());
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn unauthorized_client_never_reaches_handler() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;
    let (_client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/intruder")).await;

    let server = start_server(
        server_source,
        authorizer::exact(["spiffe://example.org/client"]).unwrap(),
    )
    .await;

    assert!(client(client_source, server.addr).get("/").await.is_err());
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn untrusted_server_fails_peer_authentication() {
    let ca = TestCa::new("example.org");
    let other_ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&other_ca, "spiffe://example.org/server")).await;
    let (_client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/client")).await;

    let server = start_server(server_source, authorizer::any()).await;

    let err = client(client_source, server.addr).get("/").await.unwrap_err();
    assert!(matches!(err, Error::PeerAuthenticationFailed(_)), "got {err:?}");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn client_authorizes_server_identity() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/impostor")).await;
    let (_client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/client")).await;

    let server = start_server(server_source, authorizer::any()).await;

    let client = Client::builder(client_source)
        .target(server.addr.to_string())
        .authorize(authorizer::exact(["spiffe://example.org/server"]).unwrap())
        .build()
        .unwrap();

    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, Error::PeerAuthenticationFailed(_)), "got {err:?}");

    server.stop().await;
}

#[tokio::test]
async fn concurrent_handshakes_during_rotation() {
    const CLIENTS: usize = 16;
    const ROUNDS: usize = 4;
    const ROTATIONS: usize = 5;

    let ca = TestCa::new("example.org");
    let (server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;
    let (client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/client")).await;

    let server = start_server(server_source.clone(), authorizer::any()).await;
    let client = client(client_source.clone(), server.addr);

    let rotator = {
        let rotations: Vec<_> = (0..ROTATIONS)
            .map(|_| {
                (
                    material(&ca, "spiffe://example.org/server"),
                    material(&ca, "spiffe://example.org/client"),
                )
            })
            .collect();
        let (server_source, client_source) = (server_source.clone(), client_source.clone());
        tokio::spawn(async move {
            for (server_material, client_material) in rotations {
                server_authority.rotate(server_material);
                client_authority.rotate(client_material);
                server_source.refresh().await.unwrap();
                client_source.refresh().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let mut requests = Vec::with_capacity(CLIENTS);
    for _ in 0..CLIENTS {
        let client = client.clone();
        requests.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let (response, peer) = client.send_with_peer(get("/")).await?;
                assert_eq!(
                    &response.body()[..],
                    b"Hello, client with SPIFFE ID: spiffe://example.org/client"
                );
                assert_eq!(peer.id(), "spiffe://example.org/server");
            }
            Ok::<_, Error>(())
        }));
    }

    for request in requests {
        request.await.unwrap().unwrap();
    }
    rotator.await.unwrap();

    assert_eq!(server_source.version(), 1 + ROTATIONS as u64);
    assert_eq!(client_source.version(), 1 + ROTATIONS as u64);
    assert_eq!(server.calls.load(Ordering::SeqCst), CLIENTS * ROUNDS);

    server.stop().await;
}

#[tokio::test]
async fn expired_credential_fails_before_dialing() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;

    let short_lived = ca.issue(
        LeafSpec::spiffe("spiffe://example.org/client")
            .valid_around_now(time::Duration::seconds(1), time::Duration::seconds(2)),
    );
    let (client_authority, client_source) = source(AuthorityMaterial::new(
        short_lived.chain(),
        short_lived.key_der,
        vec![ca.root_der()],
    ))
    .await;
    client_authority.set_unavailable(true);

    let server = start_server(server_source, authorizer::any()).await;
    let client = client(client_source, server.addr);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, Error::CredentialExpired { .. }), "got {err:?}");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn builders_require_addresses() {
    let ca = TestCa::new("example.org");
    let (_authority, source) = source(material(&ca, "spiffe://example.org/a")).await;

    assert!(matches!(
        Client::builder(source.clone()).build(),
        Err(Error::MissingAddress("target"))
    ));
    assert!(matches!(
        Server::builder(source).build().await,
        Err(Error::MissingAddress("listen"))
    ));
}

#[tokio::test]
async fn silent_connection_is_closed_after_idle_timeout() {
    use tokio::io::AsyncReadExt;

    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;
    let (_client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/client")).await;

    let server =
        start_server_idle(server_source, authorizer::any(), Duration::from_millis(200)).await;

    let config = mtls_client(client_source.clone()).build().unwrap();
    let connector = TlsConnector::new(client_source, Arc::new(config));
    let (mut tls, peer) = connector
        .connect_addr(server.addr, "workload-server".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(peer.id(), "spiffe://example.org/server");

    // Authenticated, then silent: the server must hang up on its own.
    let mut buf = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut buf)).await;
    assert!(closed.is_ok(), "server kept an idle connection open");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn oversized_request_body_is_refused() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) =
        source(material(&ca, "spiffe://example.org/server")).await;
    let (_client_authority, client_source) =
        source(material(&ca, "spiffe://example.org/client")).await;

    let server = start_server(server_source, authorizer::any()).await;
    let client = client(client_source, server.addr);

    let too_big = Request::post("/")
        .body(Bytes::from(vec![0u8; MAX_BODY_LEN + 1]))
        .unwrap();
    assert!(matches!(
        client.send(too_big).await,
        Err(Error::BodyTooLarge { max }) if max == MAX_BODY_LEN
    ));
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}
