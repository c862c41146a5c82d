use clap::Parser;
use log::info;
use server::network::Server;
use server::session::SessionConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'a', long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Advisory simulation tick rate sent to clients
    #[arg(short = 't', long, default_value = "100")]
    tick_rate: u32,

    /// Ticks of execution lead granted ahead of the confirmed tick
    #[arg(short = 'b', long, default_value = "3")]
    tick_buffer: u32,

    /// Maximum players per session
    #[arg(short = 'm', long, default_value = "8")]
    max_players: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = SessionConfig {
        tick_rate: args.tick_rate,
        tick_buffer: args.tick_buffer,
        max_players: args.max_players,
    };

    info!("Starting session server...");
    info!(
        "Sessions: tick rate {}, tick buffer {}, up to {} players",
        config.tick_rate, config.tick_buffer, config.max_players
    );

    let mut server = Server::bind(&args.address, config).await?;
    info!("Listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
