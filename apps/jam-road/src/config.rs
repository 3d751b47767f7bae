use std::env;

pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub room_ttl_seconds: u64,
    pub message_cap: usize,
    pub sweep_interval_seconds: u64,
    pub turn_host: Option<String>,
    pub turn_secret: Option<String>,
    pub credential_ttl_seconds: u64,
    pub stun_urls: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("JAM_ROAD_PORT").unwrap_or(defaults.port),
            room_ttl_seconds: env_parse("JAM_ROAD_ROOM_TTL").unwrap_or(defaults.room_ttl_seconds),
            message_cap: env_parse("JAM_ROAD_MESSAGE_CAP").unwrap_or(defaults.message_cap),
            sweep_interval_seconds: env_parse("JAM_ROAD_SWEEP_INTERVAL")
                .unwrap_or(defaults.sweep_interval_seconds),
            turn_host: env_non_empty("JAM_ROAD_TURN_HOST"),
            turn_secret: env_non_empty("JAM_ROAD_TURN_SECRET"),
            credential_ttl_seconds: env_parse("JAM_ROAD_CREDENTIAL_TTL")
                .unwrap_or(defaults.credential_ttl_seconds),
            stun_urls: env_non_empty("JAM_ROAD_STUN_URLS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.stun_urls),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            room_ttl_seconds: 3600,
            message_cap: 100,
            sweep_interval_seconds: 60,
            turn_host: None,
            turn_secret: None,
            credential_ttl_seconds: 3600,
            stun_urls: DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

fn env_non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stun_list_ignores_blank_entries() {
        assert_eq!(
            split_list(" stun:a:3478 ,, stun:b:19302,"),
            vec!["stun:a:3478".to_string(), "stun:b:19302".to_string()]
        );
    }

    #[test_timeout::timeout]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.message_cap, 100);
        assert_eq!(config.room_ttl_seconds, 3600);
        assert_eq!(config.stun_urls.len(), 2);
        assert!(config.turn_secret.is_none());
    }
}
