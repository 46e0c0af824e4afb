use clap::Parser;
use client::{Connection, Transport};
use log::{error, info, warn};
use shared::Position;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless client that walks a circle and reports its peers", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:4242")]
    server: String,

    /// Transport binding the server is running
    #[arg(short, long, value_enum, default_value_t = Transport::Udp)]
    transport: Transport,

    /// Position updates sent per second
    #[arg(short, long, default_value = "60")]
    rate: u32,

    /// Seconds to run before disconnecting, 0 to run until Ctrl+C
    #[arg(short, long, default_value = "0")]
    duration: u64,
}

const CENTER: (f64, f64) = (540.0, 360.0);
const RADIUS: f64 = 150.0;

/// Position after `step` ticks on a circle completed every `rate` ticks.
fn walk(step: u64, rate: u32) -> Position {
    let angle = (step as f64 / rate.max(1) as f64) * std::f64::consts::TAU;
    Position::new(
        (CENTER.0 + RADIUS * angle.cos()).round() as i64,
        (CENTER.1 + RADIUS * angle.sin()).round() as i64,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} ({:?})", args.server, args.transport);

    let connection = Connection::connect(args.transport, &args.server).await?;

    let mut send_interval = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_interval = interval(Duration::from_secs(1));

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut step = 0u64;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if !connection.is_connected() {
            warn!("Lost connection to server");
            break;
        }

        tokio::select! {
            _ = send_interval.tick() => {
                step += 1;
                if let Err(e) = connection.send_position(walk(step, args.rate)).await {
                    error!("Write pos: {}", e);
                }
            }
            _ = report_interval.tick() => {
                let updates = connection.peer_table().take_update_count();
                let peers = connection.peers();
                info!("{} peers, {} updates/sec", peers.len(), updates);
                for (peer, position) in &peers {
                    info!("  {} at ({}, {})", peer, position.x, position.y);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    connection.shutdown().await;
    info!("Bye!");
    Ok(())
}
