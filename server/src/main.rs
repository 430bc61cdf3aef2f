use clap::Parser;
use log::info;
use relay_server::RelayServer;
use relay_shared::{BROADCAST_RATE_HZ, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Room-scoped position relay", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, env = "WS_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "WS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// State broadcasts per second
    #[arg(short, long, env = "BROADCAST_RATE_HZ", default_value_t = BROADCAST_RATE_HZ)]
    broadcast_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let server = RelayServer::bind(&address, args.broadcast_rate).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
