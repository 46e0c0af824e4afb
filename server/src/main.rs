use clap::Parser;
use log::{error, info};
use server::config::{ServerConfig, Transport};
use server::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relays client positions to every other client", long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port for both the stream and datagram listeners
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Transport binding to serve
    #[arg(short, long, value_enum, default_value_t = Transport::Udp)]
    transport: Transport,

    /// Outbound queue capacity per websocket client
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Deadline for a single delivery, in milliseconds
    #[arg(long, default_value = "50")]
    send_timeout_ms: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            transport: args.transport,
            queue_capacity: args.queue_capacity,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::from(Args::parse());
    info!("Starting {:?} server on {}", config.transport, config.socket_addr_string());

    let server = Server::bind(&config).await?;
    let shutdown = server.shutdown_handle();
    let mut running = tokio::spawn(server.run());

    tokio::select! {
        result = &mut running => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    shutdown.shutdown().await;
    if let Err(e) = running.await {
        error!("Server task panicked: {}", e);
    }

    info!("Bye!");
    Ok(())
}
