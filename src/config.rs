use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    /// Safety cap on the funding-graph fixed-point loop. 50 matches the
    /// historical bound; no legitimate graph shape is known to need more.
    pub max_resolve_iterations: u32,
    /// How many recent closed runs get their stats recomputed after payday.
    pub recompute_stats_limit: i64,
    /// Whether to refresh cached giving/receiving amounts after the run.
    pub update_cached_amounts: bool,
    /// Advisory lock key guarding against concurrent payday invocations.
    pub job_lock_key: i64,
    /// Settlement period. A new run is refused while the latest one
    /// started less than this many days ago; resuming an open run is
    /// always allowed.
    pub period_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/payday".to_string()),
            max_resolve_iterations: parse_var("PAYDAY_MAX_RESOLVE_ITERATIONS", 50)?,
            recompute_stats_limit: parse_var("PAYDAY_RECOMPUTE_STATS_LIMIT", 10)?,
            update_cached_amounts: parse_var("PAYDAY_UPDATE_CACHED_AMOUNTS", true)?,
            job_lock_key: parse_var("PAYDAY_JOB_LOCK_KEY", 1)?,
            period_days: parse_var("PAYDAY_PERIOD_DAYS", 7)?,
        })
    }

    /// Defaults with no database, for driving the engine against an
    /// in-memory store.
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            max_resolve_iterations: 50,
            recompute_stats_limit: 10,
            update_cached_amounts: true,
            job_lock_key: 1,
            period_days: 7,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, config::ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| config::ConfigError::Message(format!("invalid value for {}", name))),
        Err(_) => Ok(default),
    }
}
