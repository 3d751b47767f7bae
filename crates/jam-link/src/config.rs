use std::env;
use std::time::Duration;

use crate::candidate::CandidatePolicy;

pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:8080/signaling";
pub const DEFAULT_CREDENTIALS_URL: &str = "http://127.0.0.1:8080/credentials";
pub const DEFAULT_CHANNEL_LABEL: &str = "midi";

/// Exponential backoff for signaling reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            multiplier: 2,
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * multiplier^(attempt - 1), cap)`; attempts are 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyConfig {
    /// Pings per measurement run.
    pub burst: u32,
    pub spacing: Duration,
    /// A run still missing pongs after this long is closed out.
    pub run_timeout: Duration,
    /// Delay between the channel opening and the automatic first run.
    pub auto_start_delay: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            burst: 5,
            spacing: Duration::from_millis(100),
            run_timeout: Duration::from_secs(5),
            auto_start_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub signaling_url: String,
    /// `None` skips the fetch and always uses the built-in server list.
    pub credentials_url: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub candidate_queue_cap: usize,
    pub channel_label: String,
    pub candidates: CandidatePolicy,
    pub reconnect: ReconnectPolicy,
    pub latency: LatencyConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            credentials_url: Some(DEFAULT_CREDENTIALS_URL.to_string()),
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
            candidate_queue_cap: 50,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            candidates: CandidatePolicy::default(),
            reconnect: ReconnectPolicy::default(),
            latency: LatencyConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Reads `JAM_*` overrides on top of the defaults. Unparseable values
    /// fall back to the default rather than failing.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let signaling_url = env::var("JAM_SIGNALING_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.signaling_url);
        let credentials_url = match env::var("JAM_CREDENTIALS_URL") {
            Ok(value) if value.trim().is_empty() || value == "none" => None,
            Ok(value) => Some(value),
            Err(_) => defaults.credentials_url,
        };
        let poll_interval = env_millis("JAM_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval);
        let negotiation_timeout =
            env_millis("JAM_NEGOTIATION_TIMEOUT_MS").unwrap_or(defaults.negotiation_timeout);
        let max_attempts = env::var("JAM_RECONNECT_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.reconnect.max_attempts);

        Self {
            signaling_url,
            credentials_url,
            poll_interval,
            negotiation_timeout,
            candidates: CandidatePolicy {
                ipv4: env_flag("JAM_IPV4").unwrap_or(defaults.candidates.ipv4),
                ipv6: env_flag("JAM_IPV6").unwrap_or(defaults.candidates.ipv6),
            },
            reconnect: ReconnectPolicy {
                max_attempts,
                ..defaults.reconnect
            },
            ..defaults
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_flag(var: &str) -> Option<bool> {
    let value = env::var(var).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "JAM_SIGNALING_URL",
        "JAM_CREDENTIALS_URL",
        "JAM_POLL_INTERVAL_MS",
        "JAM_NEGOTIATION_TIMEOUT_MS",
        "JAM_RECONNECT_MAX_ATTEMPTS",
        "JAM_IPV4",
        "JAM_IPV6",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test_timeout::timeout]
    fn backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(1_000),
            multiplier: 2,
            cap: Duration::from_millis(5_000),
            max_attempts: 5,
        };
        let delays: Vec<u128> = (1..=4)
            .map(|attempt| policy.delay_for(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000]);
    }

    #[test_timeout::timeout]
    fn backoff_saturates_on_huge_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(200), policy.cap);
    }

    #[test_timeout::timeout]
    fn from_env_uses_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(LinkConfig::from_env(), LinkConfig::default());
    }

    #[test_timeout::timeout]
    fn from_env_applies_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("JAM_SIGNALING_URL", "https://jam.example/signaling");
            env::set_var("JAM_CREDENTIALS_URL", "none");
            env::set_var("JAM_POLL_INTERVAL_MS", "250");
            env::set_var("JAM_IPV6", "false");
            env::set_var("JAM_RECONNECT_MAX_ATTEMPTS", "not-a-number");
        }

        let config = LinkConfig::from_env();
        clear_env();

        assert_eq!(config.signaling_url, "https://jam.example/signaling");
        assert_eq!(config.credentials_url, None);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(!config.candidates.ipv6);
        assert!(config.candidates.ipv4);
        assert_eq!(config.reconnect.max_attempts, 5);
    }
}
