use bytes::Bytes;
use clap::Parser;
use http::{Request, Response};
use workload_demo::{build_client, build_source, ClientArgs};
use workload_identity_tokio::{Client, PeerIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = ClientArgs::parse();

    let source = build_source(&args.identity).await?;
    let client = build_client(&args, source.clone())?;

    let result = get(&client, &args.path).await;
    source.close().await;

    let (response, server) = result?;
    eprintln!("server identity: {server}");
    if !response.status().is_success() {
        anyhow::bail!("server answered {}", response.status());
    }
    print!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}

async fn get(client: &Client, path: &str) -> anyhow::Result<(Response<Bytes>, PeerIdentity)> {
    let request = Request::get(path).body(Bytes::new())?;
    Ok(client.send_with_peer(request).await?)
}
