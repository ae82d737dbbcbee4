//! Lists the servers on the LAN, optionally queries one of them for players and rules, and
//!  optionally connects and sends a message to it.

use std::time::{Duration, Instant};
use clap::Parser;
use clap_derive::Parser;
use lanlink::config::NetConfig;
use lanlink::connect::ConnectStatus;
use lanlink::connection::Incoming;
use lanlink::driver::udp::{UdpConfig, UdpDriver};
use lanlink::server_info::StaticServerInfo;
use lanlink::transport::Transport;
use tracing::Level;

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 26000)]
    port: u16,

    /// query players and rules of this host
    #[clap(long)]
    query: Option<String>,

    /// connect to this host, the empty string means 'the only server on the LAN'
    #[clap(long)]
    connect: Option<String>,

    #[clap(long, default_value = "hello")]
    message: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

const FRAME: Duration = Duration::from_millis(10);

fn print_console(transport: &mut Transport) {
    for line in transport.drain_console() {
        println!("{}", line);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .try_init()
        .ok();

    let driver = UdpDriver::new(UdpConfig {
        host_port: args.port,
        ..UdpConfig::default()
    });
    let mut transport = Transport::new(NetConfig::default(), vec![Box::new(driver)], Box::new(StaticServerInfo::default()), Instant::now())?;
    let mut ticks = tokio::time::interval(FRAME);

    transport.start_discovery(true, false, Instant::now());
    while transport.is_discovery_in_progress() {
        ticks.tick().await;
        transport.poll_once(Instant::now());
        print_console(&mut transport);
    }

    if let Some(host) = &args.query {
        transport.query_players(host, Instant::now())?;
        transport.query_rules(host, Instant::now())?;
        while transport.is_query_in_progress() {
            ticks.tick().await;
            transport.poll_once(Instant::now());
            print_console(&mut transport);
        }
    }

    let Some(host) = &args.connect else {
        return Ok(());
    };

    let mut connector = transport.begin_connect(host, Instant::now())?;
    let id = loop {
        ticks.tick().await;
        let now = Instant::now();
        transport.poll_once(now);
        let status = transport.poll_connect(&mut connector, now);
        print_console(&mut transport);
        match status {
            ConnectStatus::Pending => {}
            ConnectStatus::Connected(id) => break id,
            ConnectStatus::Failed(failure) => return Err(failure.into()),
        }
    };

    transport.send_reliable(id, args.message.as_bytes(), Instant::now())?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        ticks.tick().await;
        let now = Instant::now();
        transport.poll_once(now);
        match transport.receive(id, now)? {
            Some(Incoming::Reliable(msg)) => {
                println!("echo: {}", String::from_utf8_lossy(&msg));
                break;
            }
            Some(Incoming::Unreliable(_)) | None => {}
        }
    }

    for line in transport.stats().report() {
        println!("{}", line);
    }
    transport.close(id);
    transport.shutdown();
    Ok(())
}
