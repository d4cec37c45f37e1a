//! Client configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff;
use crate::types::TokenProvider;

pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
pub(crate) const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
pub(crate) const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub(crate) const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
pub(crate) const DEFAULT_ACK_TIMEOUT_MS: u64 = 5000;
pub(crate) const DEFAULT_ACK_MAX_RETRIES: u32 = 3;

/// Who is connecting. Sent as `userId` / `role` query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

/// Reconnection policy handed to the transport and mirrored by the client's
/// own attempt accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` means unlimited (`-1` on the wire).
    #[serde(with = "unlimited_as_negative")]
    pub max_attempts: Option<u32>,
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Fraction of each delay added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            cap_ms: DEFAULT_RECONNECT_CAP_MS,
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff::delay(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
            attempt,
        )
    }

    /// Delay before attempt `attempt` with the configured jitter applied.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        backoff::jittered(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
            attempt,
            self.jitter,
        )
    }

    /// Whether attempt number `attempt` is beyond the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Ack tracking for publishes that require acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AckPolicy {
    pub timeout_ms: u64,
    /// Total number of sends before giving up.
    pub max_retries: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_retries: DEFAULT_ACK_MAX_RETRIES,
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            cap_ms: DEFAULT_RECONNECT_CAP_MS,
        }
    }
}

impl AckPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait after the `attempt`-th timed-out send before resending.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff::delay(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
            attempt,
        )
    }
}

/// Configuration for [`RealtimeClient`](crate::RealtimeClient).
#[derive(Clone)]
pub struct RealtimeOptions {
    /// Server endpoint, e.g. `wss://realtime.example.com/socket`.
    pub url: String,
    /// Bearer token provider. `None` connects anonymously.
    pub auth: Option<TokenProvider>,
    pub user: UserIdentity,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub ack: AckPolicy,
    pub max_queue_size: usize,
}

impl RealtimeOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            user: UserIdentity::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            ack: AckPolicy::default(),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }

    /// Build the handshake URL with identity query parameters attached.
    pub(crate) fn handshake_url(&self) -> Result<url::Url, url::ParseError> {
        let mut u = url::Url::parse(&self.url)?;
        {
            let mut q = u.query_pairs_mut();
            if let Some(user_id) = &self.user.user_id {
                q.append_pair("userId", user_id);
            }
            if let Some(role) = &self.user.role {
                q.append_pair("role", role);
            }
        }
        // query_pairs_mut leaves a dangling '?' when nothing was appended
        if u.query() == Some("") {
            u.set_query(None);
        }
        Ok(u)
    }
}

impl fmt::Debug for RealtimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeOptions")
            .field("url", &self.url)
            .field("auth", &self.auth.is_some())
            .field("user", &self.user)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect", &self.reconnect)
            .field("ack", &self.ack)
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

mod unlimited_as_negative {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => s.serialize_i64(i64::from(*n)),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let n = i64::deserialize(d)?;
        if n < 0 {
            Ok(None)
        } else {
            u32::try_from(n).map(Some).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = RealtimeOptions::new("wss://rt.example.com/socket");
        assert_eq!(opts.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(opts.max_queue_size, 1000);
        assert!(opts.reconnect.enabled);
        assert_eq!(opts.reconnect.max_attempts, None);
        assert_eq!(opts.reconnect.base_ms, 1000);
        assert_eq!(opts.reconnect.cap_ms, 30_000);
    }

    #[test]
    fn reconnect_delays_follow_formula() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (1..=7).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn exhaustion_respects_unlimited() {
        let mut policy = ReconnectPolicy::default();
        assert!(!policy.is_exhausted(10_000));
        policy.max_attempts = Some(3);
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn reconnect_policy_from_json_with_minus_one() {
        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{"enabled": false, "maxAttempts": -1, "baseMs": 500}"#)
                .unwrap();
        assert!(!policy.enabled);
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.base_ms, 500);
        assert_eq!(policy.cap_ms, 30_000);

        let json = serde_json::to_value(ReconnectPolicy::default()).unwrap();
        assert_eq!(json["maxAttempts"], -1);
    }

    #[test]
    fn ack_policy_partial_json_uses_defaults() {
        let policy: AckPolicy = serde_json::from_str(r#"{"maxRetries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.timeout(), Duration::from_millis(5000));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn handshake_url_carries_identity() {
        let mut opts = RealtimeOptions::new("wss://rt.example.com/socket");
        opts.user = UserIdentity {
            user_id: Some("user 42".to_string()),
            role: Some("admin".to_string()),
        };
        let url = opts.handshake_url().unwrap().to_string();
        assert!(url.starts_with("wss://rt.example.com/socket?"));
        assert!(url.contains("userId=user+42"));
        assert!(url.contains("role=admin"));
    }

    #[test]
    fn handshake_url_without_identity_has_no_query() {
        let opts = RealtimeOptions::new("wss://rt.example.com/socket");
        assert_eq!(
            opts.handshake_url().unwrap().as_str(),
            "wss://rt.example.com/socket"
        );
    }

    #[test]
    fn handshake_url_rejects_garbage() {
        let opts = RealtimeOptions::new("not a url");
        assert!(opts.handshake_url().is_err());
    }
}
