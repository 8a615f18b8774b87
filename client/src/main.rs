use clap::Parser;
use client::network::{BotOptions, Client, ClientResult};
use log::{info, warn};
use shared::MiniGameKind;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Participant id to identify as
    #[arg(short = 'i', long)]
    id: String,

    /// Display name (defaults to the id)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Mini-game to vote for; random each round when omitted
    #[arg(short = 'v', long)]
    vote: Option<String>,

    /// Spread of press timing in milliseconds
    #[arg(short = 'j', long, default_value = "60")]
    jitter_ms: u64,

    /// Ask the server to open voting once connected
    #[arg(long)]
    start: bool,

    /// Input frame length in milliseconds
    #[arg(short = 'f', long, default_value = "16")]
    frame_ms: u64,

    /// Seed for votes and press timing
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> ClientResult<()> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut options = BotOptions::new(args.id.clone());
    if let Some(name) = args.name {
        options.name = name;
    }
    options.vote = args.vote.as_deref().map(str::parse::<MiniGameKind>).transpose()?;
    options.jitter_ms = args.jitter_ms;
    options.start = args.start;
    options.frame = Duration::from_millis(args.frame_ms.max(1));
    options.seed = args.seed;

    info!("Starting bot {} against {}", args.id, args.server);
    let mut client = Client::connect(&args.server, options).await?;

    tokio::select! {
        result = client.run() => {
            match result? {
                Some(ranking) => info!("Session over, {} ranked", ranking.len()),
                None => warn!("Disconnected before the session ended"),
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving");
            client.leave().await?;
        },
    }
    info!("Last measured round trip: {}ms", client.ping_ms());

    Ok(())
}
