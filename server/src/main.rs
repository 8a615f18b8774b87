use clap::Parser;
use log::info;
use server::config::SessionConfig;
use server::network::{Server, ServerResult};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Rounds per session
    #[arg(short = 'r', long, default_value = "5")]
    max_rounds: u32,

    /// Voting window in seconds
    #[arg(long, default_value = "15")]
    voting_secs: u64,

    /// Seconds to wait for results after a round's time limit
    #[arg(long, default_value = "30")]
    submission_timeout_secs: u64,

    /// Seconds results stay on screen between rounds
    #[arg(long, default_value = "25")]
    results_secs: u64,

    /// Start voting automatically once this many players are connected (0 = never)
    #[arg(short = 'a', long, default_value = "0")]
    auto_start: usize,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long, default_value = "32")]
    max_clients: usize,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_rounds: self.max_rounds,
            voting_duration: Duration::from_secs(self.voting_secs),
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            inter_round_delay: Duration::from_secs(self.results_secs),
            auto_start_players: self.auto_start,
            max_connections: self.max_clients,
            ..SessionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::init();

    let args = Args::parse();
    let config = args.session_config();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting session server on {}", address);
    info!(
        "{} rounds, {}s voting, max {} clients",
        config.max_rounds,
        config.voting_duration.as_secs(),
        config.max_connections
    );

    let mut server = Server::new(&address, config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = handle.send(server::network::ServerMessage::Shutdown);
        }
    });

    server.run().await?;

    Ok(())
}
