use clap::Parser;
use exchange_deploy::{cli::Cli, step::Cancellation};
use tracing::warn;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so that stdout carries only the address listing
    tracing_subscriber::fmt()
        .pretty()
        .with_writer(std::io::stderr)
        .init();

    let (cancel, cancellation) = Cancellation::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, abandoning in-flight transactions");
            cancel.cancel();
        }
    });

    cli.run(cancellation).await
}
