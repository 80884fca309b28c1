//! Runner configuration: where the generation backend lives.

use std::time::Duration;

/// OpenAI-compatible chat endpoint used for candidate generation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL, e.g. `http://localhost:8080/v1`.
    pub endpoint_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Temperature of candidate 0.
    pub base_temperature: f32,
    /// Added per candidate index so candidates diverge.
    pub temperature_step: f32,
    pub request_timeout: Duration,
}

const MAX_TEMPERATURE: f32 = 1.2;

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl RunnerConfig {
    /// Build from `REFINE_ENDPOINT_URL`, `REFINE_MODEL`, `REFINE_API_KEY`,
    /// `REFINE_MAX_TOKENS` and `REFINE_REQUEST_TIMEOUT_SECS`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            endpoint_url: lookup("REFINE_ENDPOINT_URL")
                .unwrap_or_else(|| "http://localhost:8080/v1".into()),
            model: lookup("REFINE_MODEL").unwrap_or_else(|| "default".into()),
            api_key: lookup("REFINE_API_KEY").filter(|k| !k.is_empty()),
            max_tokens: lookup("REFINE_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            base_temperature: 0.3,
            temperature_step: 0.2,
            request_timeout: Duration::from_secs(
                lookup("REFINE_REQUEST_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint_url.trim_end_matches('/'))
    }

    /// Sampling temperature for one candidate slot.
    pub fn temperature_for(&self, candidate_index: usize) -> f32 {
        (self.base_temperature + self.temperature_step * candidate_index as f32).min(MAX_TEMPERATURE)
    }
}

/// Check if an inference endpoint is reachable (GET /models).
pub async fn check_endpoint(url: &str) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    match reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_env() {
        let config = RunnerConfig::from_lookup(|_| None);
        assert_eq!(config.endpoint_url, "http://localhost:8080/v1");
        assert!(config.api_key.is_none());
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.chat_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REFINE_ENDPOINT_URL", "http://gpu-01:8000/v1/"),
            ("REFINE_MODEL", "writer-32b"),
            ("REFINE_API_KEY", ""),
            ("REFINE_MAX_TOKENS", "not-a-number"),
            ("REFINE_REQUEST_TIMEOUT_SECS", "30"),
        ]);
        let config = RunnerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.model, "writer-32b");
        assert!(config.api_key.is_none());
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.chat_url(), "http://gpu-01:8000/v1/chat/completions");
    }

    #[test]
    fn test_temperature_spreads_and_caps() {
        let config = RunnerConfig::from_lookup(|_| None);
        assert!((config.temperature_for(0) - 0.3).abs() < 1e-6);
        assert!((config.temperature_for(2) - 0.7).abs() < 1e-6);
        assert!((config.temperature_for(20) - MAX_TEMPERATURE).abs() < 1e-6);
    }
}
