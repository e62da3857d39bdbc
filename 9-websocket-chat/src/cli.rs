use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat broker, accepting WebSocket connections.
    Broker(BrokerArgs),
    /// Connect to a broker and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced when joining. Prompted for on stdin when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// WebSocket URL of the broker.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,
}
