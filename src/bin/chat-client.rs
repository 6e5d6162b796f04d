//! Interactive client: forwards console lines to the relay and prints
//! everything the relay sends back.

use chat_relay::client;
use chat_relay::config::ClientArgs;
use clap::Parser;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    println!("Connected to {}:{}", args.host, args.port);

    let input = client::spawn_line_reader(std::io::BufReader::new(std::io::stdin()))?;
    client::run(stream, input, tokio::io::stdout()).await?;

    println!("Left the chat");
    Ok(())
}
