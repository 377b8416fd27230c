use clap::Parser;
use log::info;
use workload_demo::{build_server, build_source, greet, ServerArgs};
use workload_identity_tokio::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = ServerArgs::parse();

    // No credential, no server: exits non-zero.
    let source = build_source(&args.identity).await?;
    let server = build_server(&args, source.clone()).await?;
    eprintln!("workload server listening on {}", server.local_addr());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
        signal.cancel();
    });

    server.serve(greet, shutdown).await?;
    source.close_configured().await?;
    Ok(())
}
