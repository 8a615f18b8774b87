use std::time::Duration;

/// Tunables for one session. Durations are wall-clock.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub max_rounds: u32,
    pub voting_duration: Duration,
    /// Voting is cut down to this once everyone live has voted
    pub early_close_floor: Duration,
    /// Grace after the round time limit for results to arrive
    pub submission_timeout: Duration,
    /// Results display before the next vote opens
    pub inter_round_delay: Duration,
    /// Results display after the last round before the session ends
    pub final_results_delay: Duration,
    pub reconnect_grace: Duration,
    pub empty_lobby_reset: Duration,
    /// Open voting automatically once this many participants are live; 0 disables
    pub auto_start_players: usize,
    pub max_connections: usize,
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            voting_duration: Duration::from_secs(15),
            early_close_floor: Duration::from_secs(5),
            submission_timeout: Duration::from_secs(30),
            inter_round_delay: Duration::from_secs(25),
            final_results_delay: Duration::from_secs(10),
            reconnect_grace: Duration::from_secs(10),
            empty_lobby_reset: Duration::from_secs(10),
            auto_start_players: 0,
            max_connections: 32,
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}
