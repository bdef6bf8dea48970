use std::{env, time::Duration};

// Runtime/server constants (not tunable per deployment).

/// Clients that never join a lobby are reaped after this deadline.
pub const NO_LOBBY_TIMEOUT: Duration = Duration::from_secs(1);
/// Sealed lobbies close every member this long after the seal broadcast.
pub const SEAL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Liveness ping cadence on every open connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

pub fn http_port() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5050)
}

pub fn database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        return url;
    }

    let host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let user = env::var("DB_USER").unwrap_or_else(|_| "signaling".to_string());
    let password = env::var("DB_PASSWORD").unwrap_or_default();
    let name = env::var("DB_NAME").unwrap_or_else(|_| "signaling".to_string());

    if password.is_empty() {
        format!("postgres://{user}@{host}/{name}")
    } else {
        format!("postgres://{user}:{password}@{host}/{name}")
    }
}

pub fn code_seed() -> u64 {
    env::var("CODE_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Shared limits and timers handed to the broker at construction, so tests
/// can build arbitrary configurations without touching the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on concurrently connected peers.
    pub max_peers: usize,
    /// Upper bound on live lobbies in the registry.
    pub max_lobbies: usize,
    /// Upper bound on snapshots held in the in-memory cache.
    pub max_save_games: usize,
    /// Deadline for a connection's first successful JOIN.
    pub no_lobby_timeout: Duration,
    /// Delay between the seal broadcast and member teardown.
    pub seal_close_timeout: Duration,
    /// Liveness ping cadence.
    pub ping_interval: Duration,
    /// Period of the bulk snapshot flush; zero disables it.
    pub save_flush_interval: Duration,
    /// Also notify non-promoted members when the host migrates.
    pub broadcast_host_change: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            max_peers: parse_env("MAX_PEERS", 4096),
            max_lobbies: parse_env("MAX_LOBBIES", 1_048_576),
            max_save_games: parse_env("MAX_SAVE_GAMES", 10_000),
            no_lobby_timeout: NO_LOBBY_TIMEOUT,
            seal_close_timeout: SEAL_CLOSE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            save_flush_interval: Duration::from_secs(parse_env("SAVE_FLUSH_INTERVAL_SECS", 760)),
            broadcast_host_change: env::var("BROADCAST_HOST_CHANGE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_peers: 4096,
            max_lobbies: 1_048_576,
            max_save_games: 10_000,
            no_lobby_timeout: NO_LOBBY_TIMEOUT,
            seal_close_timeout: SEAL_CLOSE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            save_flush_interval: Duration::from_secs(760),
            broadcast_host_change: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
