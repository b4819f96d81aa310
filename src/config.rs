use std::time::Duration;

/// Default service endpoint for local development.
const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Foreground (UI-context) poll interval: 3 seconds.
pub const UI_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Background/service-context poll interval: 5 seconds.
pub const BACKGROUND_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// A pending record older than this with no status update is declared dead.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub poll_interval: Duration,
    pub staleness_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            poll_interval: BACKGROUND_POLL_INTERVAL,
            staleness_window: STALENESS_WINDOW,
        }
    }
}

impl Config {
    /// Builds a config from `CLIPSIFT_SERVER_URL`,
    /// `CLIPSIFT_POLL_INTERVAL_SECS` and `CLIPSIFT_STALENESS_WINDOW_SECS`,
    /// falling back to a `.env` file in the working directory, then to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env_value("CLIPSIFT_SERVER_URL").unwrap_or(defaults.server_url),
            poll_interval: env_secs("CLIPSIFT_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval),
            staleness_window: env_secs("CLIPSIFT_STALENESS_WINDOW_SECS")
                .unwrap_or(defaults.staleness_window),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env_value(name)?.parse::<u64>().ok().map(Duration::from_secs)
}

fn env_value(name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(name) {
        let value = value.trim().trim_matches('"').to_string();
        if !value.is_empty() {
            return Some(value);
        }
    }

    // Fall back to a .env file in the working directory
    let prefix = format!("{name}=");
    if let Ok(contents) = std::fs::read_to_string(".env") {
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix(&prefix) {
                let value = rest.trim().trim_matches('"').to_string();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }

    None
}
