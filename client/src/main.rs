use clap::Parser;
use client::input::{parse_key_command, InputTracker};
use client::network::{ClientEvent, NetworkClient};
use log::{error, info, warn};
use shared::DEFAULT_PORT;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

const POLL_INTERVAL: Duration = Duration::from_millis(16);
const RTT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless MOAG console client", long_about = None)]
struct Args {
    /// Server host name or address
    address: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

enum Step {
    Line(Option<String>),
    Network(Vec<ClientEvent>),
    Quit,
}

async fn resolve(address: &str, port: u16) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((address, port))
        .await?
        .next()
        .ok_or_else(|| format!("no address found for {}", address).into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = resolve(&args.address, args.port).await?;

    info!("Starting client...");
    let mut client = NetworkClient::connect(server).await?;
    info!("Commands: !left !right !up !down !fire toggle a key, anything else is chat");

    let mut tracker = InputTracker::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_rtt_log = Instant::now();

    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Line(line?),
            events = client.poll(POLL_INTERVAL) => Step::Network(events?),
            _ = tokio::signal::ctrl_c() => Step::Quit,
        };

        match step {
            Step::Line(None) | Step::Quit => break,
            Step::Line(Some(line)) => {
                if let Some(key) = parse_key_command(&line) {
                    if let Some(edge) = tracker.toggle(key, Instant::now()) {
                        client.queue_input(edge);
                    }
                } else if !line.trim().is_empty() {
                    client.queue_chat(line.trim_end());
                }
            }
            Step::Network(events) => {
                for event in events {
                    match event {
                        ClientEvent::ChatLine(line) => info!("{}", line),
                        ClientEvent::Disconnected => {
                            warn!("Server closed the connection");
                            return Ok(());
                        }
                    }
                }
            }
        }

        if let Err(e) = client.flush().await {
            error!("Connection lost: {}", e);
            return Err(e.into());
        }

        if last_rtt_log.elapsed() >= RTT_LOG_INTERVAL {
            last_rtt_log = Instant::now();
            if let Some(rtt) = client.rtt() {
                info!("RTT {} ms", rtt.as_millis());
            }
        }
    }

    info!("Disconnecting");
    client.disconnect().await?;
    Ok(())
}
