use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use websocket_chat::{
    broker::Broker,
    cli::{BrokerArgs, Cli, ClientArgs, Command},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let broker = Broker::new(listener);
    // The last word of this line is the URL clients connect to.
    info!("websocket chat broker ready at ws://{}/ws", broker.local_addr()?);

    broker.run_until_ctrl_c().await.inspect_err(|err| {
        warn!(error = ?err, "broker exited with error");
    })
}

async fn run_client(args: ClientArgs) -> Result<()> {
    info!(server = %args.server, "joining chat");
    client::run(args).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Broker(args) => run_broker(args).await,
        Command::Client(args) => run_client(args).await,
    }
}
