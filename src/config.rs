//! Process configuration.
//!
//! Every component has its own config struct with defaults; [`AppConfig`]
//! gathers them and overlays environment variables. A variable that does not
//! parse is ignored with a warning and the default stays in place.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::game::manager::GameConfig;
use crate::network::auth::AuthConfig;
use crate::network::hub::HubConfig;
use crate::network::server::ServerConfig;
use crate::queue::worker::WorkerConfig;
use crate::store::StoreConfig;

/// Configuration for the whole server process.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Listener.
    pub server: ServerConfig,
    /// Connection hub.
    pub hub: HubConfig,
    /// Game manager.
    pub game: GameConfig,
    /// Action worker.
    pub worker: WorkerConfig,
    /// Store resilience.
    pub store: StoreConfig,
    /// Token validation.
    pub auth: AuthConfig,
    /// Directory for the file backends. In-memory backends when unset.
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = AppConfig {
            auth: AuthConfig {
                issuer: lookup("AUTH_ISSUER").filter(|v| !v.is_empty()),
                audience: lookup("AUTH_AUDIENCE").filter(|v| !v.is_empty()),
                secret: lookup("AUTH_SECRET").filter(|v| !v.is_empty()),
                allow_anonymous: lookup("AUTH_ALLOW_ANONYMOUS").map(|v| flag(&v)).unwrap_or(false),
                ..AuthConfig::default()
            },
            data_dir: lookup("TYCOON_DATA_DIR").filter(|d| !d.is_empty()).map(PathBuf::from),
            ..AppConfig::default()
        };

        override_with(&lookup, "AUTH_LEEWAY_SECS", &mut config.auth.leeway, secs);

        override_with(&lookup, "TYCOON_BIND_ADDR", &mut config.server.bind_addr, |v| {
            SocketAddr::from_str(v).ok()
        });
        override_with(&lookup, "TYCOON_MAX_CONNECTIONS", &mut config.server.max_connections, parse);

        override_with(&lookup, "TYCOON_HEARTBEAT_SECS", &mut config.hub.heartbeat_interval, secs);
        override_with(&lookup, "TYCOON_PONG_TIMEOUT_SECS", &mut config.hub.pong_timeout, secs);
        override_with(
            &lookup,
            "TYCOON_DISCONNECT_TIMEOUT_SECS",
            &mut config.hub.disconnect_timeout,
            secs,
        );

        override_with(&lookup, "TYCOON_MAX_PLAYERS", &mut config.game.max_players_cap, parse);
        override_with(&lookup, "TYCOON_IDLE_EXPIRY_SECS", &mut config.game.idle_expiry, secs);

        override_with(&lookup, "TYCOON_MAX_ATTEMPTS", &mut config.worker.max_attempts, |v| {
            parse::<u32>(v).filter(|n| *n > 0)
        });
        override_with(&lookup, "TYCOON_RETRY_INTERVAL_MS", &mut config.worker.retry_interval, millis);

        override_with(&lookup, "TYCOON_STORE_TIMEOUT_MS", &mut config.store.op_timeout, millis);
        override_with(
            &lookup,
            "TYCOON_BREAKER_THRESHOLD",
            &mut config.store.breaker.failure_threshold,
            |v| parse::<u32>(v).filter(|n| *n > 0),
        );
        override_with(&lookup, "TYCOON_BREAKER_RESET_SECS", &mut config.store.breaker.reset_timeout, secs);
        override_with(&lookup, "TYCOON_CONNECT_ATTEMPTS", &mut config.store.backoff.max_attempts, |v| {
            parse::<u32>(v).filter(|n| *n > 0)
        });

        config
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

fn secs(value: &str) -> Option<Duration> {
    parse::<u64>(value).map(Duration::from_secs)
}

fn millis(value: &str) -> Option<Duration> {
    parse::<u64>(value).map(Duration::from_millis)
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
    convert: impl Fn(&str) -> Option<T>,
) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match convert(&raw) {
        Some(value) => *slot = value,
        None => warn!(variable = name, value = %raw, "Ignoring unparseable setting"),
    }
}
