use clap::Parser;
use clap_derive::Parser;
use socketbase::client::SocketClient;
use socketbase::config::SocketConfig;
use socketbase::context::SocketContext;
use socketbase::events::ReceivedPacket;
use socketbase::structure_type::{SendRoute, TransportMode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::bail;
use tokio::sync::mpsc;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    server_addr: SocketAddr,

    /// tcp, udp or both
    #[clap(long, default_value = "both")]
    mode: String,

    #[clap(long, default_value_t = false)]
    no_crypto: bool,

    #[clap(short, long, default_value_t = 10)]
    count: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_mode(s: &str) -> anyhow::Result<TransportMode> {
    match s {
        "tcp" => Ok(TransportMode::Tcp),
        "udp" => Ok(TransportMode::Udp),
        "both" => Ok(TransportMode::Both),
        other => bail!("unknown transport mode {}", other),
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let mut config = SocketConfig::new(args.server_addr);
    config.transport_mode = parse_mode(&args.mode)?;
    config.crypto = !args.no_crypto;

    let (packet_sender, mut packets) = mpsc::unbounded_channel::<ReceivedPacket>();
    let mut client = SocketClient::connect(SocketContext::new(config)?, Arc::new(packet_sender)).await?;
    client.wait_ready(Duration::from_secs(10)).await?;
    info!("connected as connection {}", client.connection().connection_id());

    for i in 0..args.count {
        let start = Instant::now();
        let mut packet = client.new_packet(1, None);
        packet.put_string(&format!("echo #{}", i))?;
        client.send(packet, SendRoute::Auto).await?;

        match tokio::time::timeout(Duration::from_secs(5), packets.recv()).await? {
            Some(received) => info!("received {:?} after {:?}", received.packet.cursor().read_string()?, start.elapsed()),
            None => bail!("connection closed"),
        }
        if !client.connection().is_available() {
            bail!("connection closed");
        }
    }

    client.close().await;
    Ok(())
}
