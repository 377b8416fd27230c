use rustls::pki_types::ServerName;
use rustls::server::{Acceptor, ClientHello};
use std::sync::Arc;
use std::time::Duration;
use test_harness::{LeafSpec, TestCa};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor, TlsConnector};
use workload_identity::{AuthorityMaterial, IdentitySource, StaticAuthority};
use workload_identity_rustls::{authorizer, mtls_client, mtls_server, peer_identity, PeerIdentity};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn material(ca: &TestCa, spec: LeafSpec) -> AuthorityMaterial {
    let leaf = ca.issue(spec);
    AuthorityMaterial::new(leaf.chain(), leaf.key_der, vec![ca.root_der()])
}

async fn source_for(ca: &TestCa, path: &str) -> (StaticAuthority, IdentitySource) {
    let id = format!("spiffe://{}{}", ca.trust_domain(), path);
    let authority = StaticAuthority::new(material(ca, LeafSpec::spiffe(&id)));
    let source = IdentitySource::builder(authority.clone()).build().await.unwrap();
    (authority, source)
}

/// Runs one handshake; returns what each side saw of its peer.
async fn handshake(
    acceptor: TlsAcceptor,
    connector: TlsConnector,
) -> (Result<PeerIdentity, BoxError>, Result<PeerIdentity, BoxError>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        let tls = acceptor.accept(tcp).await?;
        Ok::<_, BoxError>(peer_identity(tls.get_ref().1))
    });

    let client = async {
        let tcp = TcpStream::connect(addr).await?;
        let name = ServerName::try_from("workload.invalid")?;
        let tls = connector.connect(name, tcp).await?;
        Ok::<_, BoxError>(peer_identity(tls.get_ref().1))
    }
    .await;

    let server = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server side did not finish")
        .unwrap();
    (server, client)
}

fn endpoints(server: rustls::ServerConfig, client: rustls::ClientConfig) -> (TlsAcceptor, TlsConnector) {
    (
        TlsAcceptor::from(Arc::new(server)),
        TlsConnector::from(Arc::new(client)),
    )
}

#[tokio::test]
async fn mutual_handshake_resolves_both_identities() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) = source_for(&ca, "/server").await;
    let (_client_authority, client_source) = source_for(&ca, "/client").await;

    let (acceptor, connector) = endpoints(
        mtls_server(server_source.clone()).build().unwrap(),
        mtls_client(client_source.clone()).build().unwrap(),
    );

    let (server_saw, client_saw) = handshake(acceptor, connector).await;
    let server_saw = server_saw.unwrap();
    assert_eq!(server_saw.id(), "spiffe://example.org/client");
    assert_eq!(server_saw.chain().len(), 1);
    assert_eq!(client_saw.unwrap().id(), "spiffe://example.org/server");

    server_source.close().await;
    client_source.close().await;
}

#[tokio::test]
async fn unauthorized_client_is_rejected_by_server() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) = source_for(&ca, "/server").await;
    let (_client_authority, client_source) = source_for(&ca, "/intruder").await;

    let (acceptor, connector) = endpoints(
        mtls_server(server_source)
            .authorize(authorizer::exact(["spiffe://example.org/client"]).unwrap())
            .build()
            .unwrap(),
        mtls_client(client_source).build().unwrap(),
    );

    let (server_saw, _) = handshake(acceptor, connector).await;
    assert!(server_saw.is_err());
}

#[tokio::test]
async fn server_from_foreign_trust_root_is_rejected_by_client() {
    let ours = TestCa::new("example.org");
    let theirs = TestCa::new("example.org");
    let (_server_authority, server_source) = source_for(&theirs, "/server").await;
    let (_client_authority, client_source) = source_for(&ours, "/client").await;

    let (acceptor, connector) = endpoints(
        mtls_server(server_source).build().unwrap(),
        mtls_client(client_source).build().unwrap(),
    );

    let (server_saw, client_saw) = handshake(acceptor, connector).await;
    assert!(client_saw.is_err());
    assert!(server_saw.is_err());
}

#[tokio::test]
async fn rotation_is_used_by_the_next_handshake() {
    let ca = TestCa::new("example.org");
    let (server_authority, server_source) = source_for(&ca, "/server").await;
    let (_client_authority, client_source) = source_for(&ca, "/client").await;

    let acceptor = TlsAcceptor::from(Arc::new(mtls_server(server_source.clone()).build().unwrap()));
    let connector = TlsConnector::from(Arc::new(mtls_client(client_source).build().unwrap()));

    let (_, before) = handshake(acceptor.clone(), connector.clone()).await;
    assert_eq!(before.unwrap().id(), "spiffe://example.org/server");

    server_authority.rotate(material(&ca, LeafSpec::spiffe("spiffe://example.org/server-v2")));
    assert_eq!(server_source.refresh().await.unwrap(), 2);

    let (_, after) = handshake(acceptor, connector).await;
    assert_eq!(after.unwrap().id(), "spiffe://example.org/server-v2");
}

#[tokio::test]
async fn expired_client_credential_is_never_presented() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) = source_for(&ca, "/server").await;

    let short_lived = LeafSpec::spiffe("spiffe://example.org/client")
        .valid_around_now(time::Duration::seconds(1), time::Duration::seconds(2));
    let authority = StaticAuthority::new(material(&ca, short_lived));
    let client_source = IdentitySource::builder(authority.clone()).build().await.unwrap();
    authority.set_unavailable(true);

    let (acceptor, connector) = endpoints(
        mtls_server(server_source).build().unwrap(),
        mtls_client(client_source.clone()).build().unwrap(),
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client_source.current_credential().is_err());

    let (server_saw, _) = handshake(acceptor, connector).await;
    assert!(server_saw.is_err());
}

#[tokio::test]
async fn selector_hook_picks_config_per_client_hello() {
    let ca = TestCa::new("example.org");
    let (_server_authority, server_source) = source_for(&ca, "/server").await;
    let (_client_authority, client_source) = source_for(&ca, "/client").await;

    let alt = Arc::new(
        mtls_server(server_source.clone())
            .with_alpn_protocols([b"alt"])
            .build()
            .unwrap(),
    );
    let selector = mtls_server(server_source)
        .config_for_client(move |hello: &ClientHello<'_>| {
            (hello.server_name() == Some("alt.example")).then(|| Arc::clone(&alt))
        })
        .build_selector()
        .unwrap();
    let connector = TlsConnector::from(Arc::new(
        mtls_client(client_source)
            .with_alpn_protocols([b"alt"])
            .build()
            .unwrap(),
    ));

    for (sni, expected_alpn) in [("alt.example", Some(b"alt".to_vec())), ("plain.example", None)] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let selector = selector.clone();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let start = LazyConfigAcceptor::new(Acceptor::default(), tcp).await.unwrap();
            let config = selector.select(&start.client_hello());
            start.into_stream(config).await.unwrap();
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = connector
            .connect(ServerName::try_from(sni).unwrap(), tcp)
            .await
            .unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec), expected_alpn);

        server.await.unwrap();
    }
}
