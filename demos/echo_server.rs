use clap::Parser;
use clap_derive::Parser;
use socketbase::config::SocketConfig;
use socketbase::context::SocketContext;
use socketbase::events::{ConnectionEvent, ReceivedPacket};
use socketbase::server::SocketServer;
use socketbase::codec::sendable::SendablePacket;
use socketbase::structure_type::{SendRoute, TransportMode};
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    addr: SocketAddr,

    /// tcp, udp or both
    #[clap(long, default_value = "both")]
    mode: String,

    #[clap(long, default_value_t = false)]
    no_crypto: bool,

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

    let mut config = SocketConfig::new(args.addr);
    config.transport_mode = parse_mode(&args.mode)?;
    config.crypto = !args.no_crypto;

    let (packet_sender, mut packets) = mpsc::unbounded_channel::<ReceivedPacket>();
    let server = SocketServer::start(SocketContext::new(config)?, Arc::new(packet_sender)).await?;
    info!("echo server listening on {:?}", server.local_addr());

    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Ready { connection_id }) => info!("connection {} is ready", connection_id),
                Ok(ConnectionEvent::Closed { connection_id, reason }) => info!("connection {} closed: {:?}", connection_id, reason),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("skipped {} events", n),
                Err(RecvError::Closed) => return,
            }
        }
    });

    while let Some(received) = packets.recv().await {
        let Some(connection) = server.connection(received.connection_id) else {
            continue;
        };
        let packet = received.packet;
        let mut reply = SendablePacket::new(server.context().pools.clone(), packet.protocol_code, packet.command_id);
        reply.put_slice(&packet.body);
        if let Err(e) = connection.send_packet(reply, SendRoute::Auto).await {
            warn!("could not echo to connection {}: {}", received.connection_id, e);
        }
    }
    Ok(())
}
