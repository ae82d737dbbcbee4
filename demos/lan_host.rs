//! A game host that accepts connections on the LAN, answers discovery and diagnostic queries,
//!  and echoes every reliable message back to its sender.

use std::time::{Duration, Instant};
use clap::Parser;
use clap_derive::Parser;
use lanlink::config::NetConfig;
use lanlink::connection::{ConnectionId, Incoming};
use lanlink::driver::udp::{UdpConfig, UdpDriver};
use lanlink::server_info::StaticServerInfo;
use lanlink::transport::Transport;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 26000)]
    port: u16,

    #[clap(long, default_value = "lanlink")]
    name: String,

    #[clap(long, default_value = "e1m1")]
    map: String,

    #[clap(long, default_value_t = 8)]
    max_connections: usize,

    /// `<ip>` or `<ip> <mask>`
    #[clap(long)]
    ban: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let mut config = NetConfig::default();
    config.dedicated = true;
    config.listen = true;
    config.max_connections = args.max_connections;

    let driver = UdpDriver::new(UdpConfig {
        host_port: args.port,
        ..UdpConfig::default()
    });
    let server_info = StaticServerInfo::new(&args.name, &args.map)
        .with_rule("maxclients", &args.max_connections.to_string());

    let mut transport = Transport::new(config, vec![Box::new(driver)], Box::new(server_info), Instant::now())?;
    if let Some(ban) = &args.ban {
        transport.ban(&ban.split_whitespace().collect::<Vec<_>>())?;
    }
    info!("hosting '{}' on port {}", args.name, args.port);

    let mut connections: Vec<ConnectionId> = Vec::new();
    let mut ticks = tokio::time::interval(Duration::from_millis(10));
    loop {
        ticks.tick().await;
        let now = Instant::now();

        transport.poll_once(now);
        while let Some(id) = transport.check_new_connections(now) {
            info!("new connection {} from {}", id, transport.connection_address(id).unwrap_or("?"));
            connections.push(id);
        }

        connections.retain(|&id| {
            loop {
                match transport.receive(id, now) {
                    Ok(None) => return true,
                    Ok(Some(Incoming::Reliable(msg))) => {
                        if transport.can_send(id) {
                            if let Err(e) = transport.send_reliable(id, &msg, now) {
                                info!("unable to echo to {}: {}", id, e);
                            }
                        }
                    }
                    Ok(Some(Incoming::Unreliable(msg))) => {
                        let _ = transport.send_unreliable(id, &msg);
                    }
                    Err(e) => {
                        info!("connection {}: {}", id, e);
                        return false;
                    }
                }
            }
        });

        for line in transport.drain_console() {
            println!("{}", line);
        }
    }
}
