use std::str::FromStr;
use std::time::Duration;

/// Default join timeout, counted from the moment the join call is issued.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Runtime configuration for broadcast sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
    /// Media engine application id.
    pub app_id: String,
    /// Base URL of the token issuer. `None` means a static token is used.
    pub token_service_url: Option<String>,
    pub join_timeout: Duration,
    /// Attempts for the initial token fetch. 1 means no retry.
    pub token_fetch_attempts: u32,
    pub token_retry_delay: Duration,
    /// Consecutive mid-session renewal failures tolerated before the session
    /// is ended. `None` never ends the session for renewal failures.
    pub max_renewal_failures: Option<u32>,
    /// Prefix for replay locations written into the finalized record.
    pub replay_base_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            token_service_url: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            token_fetch_attempts: 1,
            token_retry_delay: Duration::from_secs(1),
            max_renewal_failures: None,
            replay_base_url: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl BroadcastConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults. Malformed values are logged and
    /// also fall back to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let join_timeout = parse_var(&lookup, "JOIN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.join_timeout);
        let token_fetch_attempts = parse_var::<u32, _>(&lookup, "TOKEN_FETCH_ATTEMPTS")
            .unwrap_or(defaults.token_fetch_attempts)
            .max(1);
        let token_retry_delay = parse_var(&lookup, "TOKEN_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.token_retry_delay);
        let request_timeout = parse_var(&lookup, "REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Self {
            app_id: non_empty("AGORA_APP_ID").unwrap_or(defaults.app_id),
            token_service_url: non_empty("TOKEN_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            join_timeout,
            token_fetch_attempts,
            token_retry_delay,
            max_renewal_failures: parse_var(&lookup, "MAX_RENEWAL_FAILURES"),
            replay_base_url: non_empty("REPLAY_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            request_timeout,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BroadcastConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BroadcastConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = config_from(&[]);
        assert_eq!(config, BroadcastConfig::default());
        assert_eq!(config.join_timeout, Duration::from_secs(15));
        assert_eq!(config.token_fetch_attempts, 1);
        assert!(config.max_renewal_failures.is_none());
    }

    #[test]
    fn test_reads_all_values() {
        let config = config_from(&[
            ("AGORA_APP_ID", "app-123"),
            ("TOKEN_SERVICE_URL", "https://tokens.example.com/"),
            ("JOIN_TIMEOUT_SECS", "30"),
            ("TOKEN_FETCH_ATTEMPTS", "3"),
            ("TOKEN_RETRY_DELAY_MS", "250"),
            ("MAX_RENEWAL_FAILURES", "5"),
            ("REPLAY_BASE_URL", "https://cdn.example.com/replays/"),
            ("REQUEST_TIMEOUT_SECS", "4"),
        ]);
        assert_eq!(config.app_id, "app-123");
        assert_eq!(
            config.token_service_url.as_deref(),
            Some("https://tokens.example.com")
        );
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.token_fetch_attempts, 3);
        assert_eq!(config.token_retry_delay, Duration::from_millis(250));
        assert_eq!(config.max_renewal_failures, Some(5));
        assert_eq!(
            config.replay_base_url.as_deref(),
            Some("https://cdn.example.com/replays")
        );
        assert_eq!(config.request_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = config_from(&[
            ("JOIN_TIMEOUT_SECS", "soon"),
            ("MAX_RENEWAL_FAILURES", "-1"),
        ]);
        assert_eq!(config.join_timeout, DEFAULT_JOIN_TIMEOUT);
        assert!(config.max_renewal_failures.is_none());
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let config = config_from(&[("TOKEN_FETCH_ATTEMPTS", "0")]);
        assert_eq!(config.token_fetch_attempts, 1);
    }

    #[test]
    fn test_blank_url_is_none() {
        let config = config_from(&[("TOKEN_SERVICE_URL", "  ")]);
        assert!(config.token_service_url.is_none());
    }
}
