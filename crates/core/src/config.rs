use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub api: ApiConfig,
    pub channel: ChannelConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ENROLL_PROFILE`. When set (e.g. `STAGING`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ENROLL_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            api: ApiConfig::from_env_profiled(p),
            channel: ChannelConfig::from_env_profiled(p),
            session: SessionConfig::from_env_profiled(p),
            cache: CacheConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  api:      url={}, push={}", self.api.base_url, self.api.push_url);
        tracing::info!(
            "  channel:  poll={}ms, limit={}, reconnect={}..{}ms, push_idle={}ms",
            self.channel.poll_interval_ms,
            self.channel.poll_limit,
            self.channel.reconnect_initial_ms,
            self.channel.reconnect_max_ms,
            self.channel.push_idle_timeout_ms
        );
        tracing::info!(
            "  session:  timeout={}ms, grace={}ms, tick={}ms",
            self.session.timeout_window_ms,
            self.session.progress_grace_ms,
            self.session.tick_interval_ms
        );
        tracing::info!("  cache:    capacity={}", self.cache.capacity);
    }

    /// Return a JSON view of the resolved config.
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "api": {
                "base_url": self.api.base_url,
                "push_url": self.api.push_url,
                "request_timeout_ms": self.api.request_timeout_ms,
            },
            "channel": {
                "poll_interval_ms": self.channel.poll_interval_ms,
                "poll_limit": self.channel.poll_limit,
                "reconnect_initial_ms": self.channel.reconnect_initial_ms,
                "reconnect_max_ms": self.channel.reconnect_max_ms,
                "push_idle_timeout_ms": self.channel.push_idle_timeout_ms,
            },
            "session": {
                "timeout_window_ms": self.session.timeout_window_ms,
                "progress_grace_ms": self.session.progress_grace_ms,
                "tick_interval_ms": self.session.tick_interval_ms,
            },
            "cache": { "capacity": self.cache.capacity },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            api: ApiConfig::default(),
            channel: ChannelConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

// ── Collaborator API ──────────────────────────────────────────

const DEFAULT_API_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the REST API (no trailing slash).
    pub base_url: String,
    /// Long-lived push stream endpoint.
    pub push_url: String,
    pub request_timeout_ms: u64,
}

impl ApiConfig {
    fn from_env_profiled(p: &str) -> Self {
        let base_url = profiled_env_or(p, "ENROLL_API_URL", DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        let push_url = profiled_env_opt(p, "ENROLL_PUSH_URL")
            .unwrap_or_else(|| format!("{}/enrollment/stream", base_url));
        Self {
            base_url,
            push_url,
            request_timeout_ms: profiled_env_u64(p, "ENROLL_REQUEST_TIMEOUT_MS", 10_000),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            push_url: format!("{}/enrollment/stream", DEFAULT_API_URL),
            request_timeout_ms: 10_000,
        }
    }
}

// ── Notification channels ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Cadence of the event-log poll loop.
    pub poll_interval_ms: u64,
    /// Max rows requested per poll.
    pub poll_limit: u32,
    /// First push reconnect delay; doubles per failed attempt.
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// A push connection silent for this long is treated as lost.
    pub push_idle_timeout_ms: u64,
}

impl ChannelConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            poll_interval_ms: profiled_env_u64(p, "ENROLL_POLL_INTERVAL_MS", 2_000),
            poll_limit: profiled_env_u32(p, "ENROLL_POLL_LIMIT", 10),
            reconnect_initial_ms: profiled_env_u64(p, "ENROLL_RECONNECT_INITIAL_MS", 500),
            reconnect_max_ms: profiled_env_u64(p, "ENROLL_RECONNECT_MAX_MS", 30_000),
            push_idle_timeout_ms: profiled_env_u64(p, "ENROLL_PUSH_IDLE_TIMEOUT_MS", 90_000),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1))
    }

    pub fn push_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.push_idle_timeout_ms.max(1))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            poll_limit: 10,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            push_idle_timeout_ms: 90_000,
        }
    }
}

// ── Session lifecycle ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after the last progress (or start) before abandonment.
    pub timeout_window_ms: u64,
    /// A progress update within this trailing window suppresses timeout.
    pub progress_grace_ms: u64,
    /// Cadence of the timeout check.
    pub tick_interval_ms: u64,
}

impl SessionConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            timeout_window_ms: profiled_env_u64(p, "ENROLL_TIMEOUT_WINDOW_MS", 180_000),
            progress_grace_ms: profiled_env_u64(p, "ENROLL_PROGRESS_GRACE_MS", 60_000),
            tick_interval_ms: profiled_env_u64(p, "ENROLL_TICK_INTERVAL_MS", 5_000),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_window_ms: 180_000,
            progress_grace_ms: 60_000,
            tick_interval_ms: 5_000,
        }
    }
}

// ── Event cache ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl CacheConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            capacity: profiled_env_u32(p, "ENROLL_CACHE_CAPACITY", 10).max(1) as usize,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.channel.poll_interval_ms, 2_000);
        assert_eq!(cfg.session.timeout_window_ms, 180_000);
        assert_eq!(cfg.session.progress_grace_ms, 60_000);
        assert_eq!(cfg.cache.capacity, 10);
        assert_eq!(cfg.profile_label(), "default");
    }

    #[test]
    fn reconnect_max_never_below_initial() {
        let cfg = ChannelConfig {
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 10,
            ..ChannelConfig::default()
        };
        assert_eq!(cfg.reconnect_max(), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_channel_timings_are_clamped() {
        let cfg = ChannelConfig {
            poll_interval_ms: 0,
            reconnect_initial_ms: 0,
            reconnect_max_ms: 0,
            push_idle_timeout_ms: 0,
            ..ChannelConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1));
        assert_eq!(cfg.reconnect_initial(), Duration::from_millis(1));
        assert_eq!(cfg.reconnect_max(), Duration::from_millis(1));
        assert_eq!(cfg.push_idle_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        // Unique key names so parallel tests don't collide.
        env::set_var("CFGTEST_ENROLL_POLL_LIMIT_PROBE", "42");
        env::set_var("ENROLL_POLL_LIMIT_PROBE", "7");
        assert_eq!(profiled_env_u32("CFGTEST", "ENROLL_POLL_LIMIT_PROBE", 1), 42);
        assert_eq!(profiled_env_u32("", "ENROLL_POLL_LIMIT_PROBE", 1), 7);
        assert_eq!(profiled_env_u32("CFGTEST", "ENROLL_MISSING_PROBE", 3), 3);
    }

    #[test]
    fn redacted_summary_has_sections() {
        let summary = Config::default().redacted_summary();
        assert_eq!(summary["profile"], "default");
        assert_eq!(summary["channel"]["poll_interval_ms"], 2_000);
        assert_eq!(summary["cache"]["capacity"], 10);
    }
}
