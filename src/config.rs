//! Sync configuration.
//!
//! Every setting has a default so a session can start with no configuration;
//! `from_env` overrides individual values.

use std::env;
use std::time::Duration;

use crate::OwnerId;
use crate::transport::SubscriptionOptions;

/// What a failed client cascade does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeRetry {
    /// Return `PartialCascade` to the caller, who may retry.
    Surface,
    /// Re-run the whole cascade up to `attempts` times before surfacing the error.
    Automatic { attempts: u32 },
}

impl CascadeRetry {
    /// Parses `surface`, `auto` or `auto:<attempts>`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "surface" => Some(CascadeRetry::Surface),
            "auto" => Some(CascadeRetry::Automatic { attempts: 3 }),
            other => other
                .strip_prefix("auto:")
                .and_then(|n| n.parse().ok())
                .map(|attempts| CascadeRetry::Automatic { attempts }),
        }
    }

    pub(crate) fn max_runs(&self) -> u32 {
        match self {
            CascadeRetry::Surface => 1,
            CascadeRetry::Automatic { attempts } => (*attempts).max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How often a subscription checks its collection for changes.
    /// Env: `LACQUER_POLL_INTERVAL_MS`
    pub poll_interval: Duration,

    /// Buffered snapshots per subscription.
    /// Env: `LACQUER_CHANNEL_CAPACITY`
    pub channel_capacity: usize,

    /// Postgres channel writes notify on, waking subscriptions early.
    /// Env: `LACQUER_NOTIFY_CHANNEL`
    pub notify_channel: Option<String>,

    /// Env: `LACQUER_CASCADE_RETRY` (`surface`, `auto`, `auto:<n>`)
    pub cascade_retry: CascadeRetry,

    /// Owner used while nobody is signed in.
    /// Env: `LACQUER_FALLBACK_OWNER`
    pub fallback_owner: OwnerId,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            channel_capacity: 16,
            notify_channel: Some(crate::documents::DEFAULT_NOTIFY_CHANNEL.to_string()),
            cascade_retry: CascadeRetry::Surface,
            fallback_owner: OwnerId::fallback(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env::var("LACQUER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(cap) = env::var("LACQUER_CHANNEL_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.channel_capacity = cap.max(1);
        }
        if let Ok(channel) = env::var("LACQUER_NOTIFY_CHANNEL") {
            let channel = channel.trim();
            config.notify_channel = (!channel.is_empty()).then(|| channel.to_string());
        }
        if let Ok(raw) = env::var("LACQUER_CASCADE_RETRY") {
            match CascadeRetry::parse(&raw) {
                Some(policy) => config.cascade_retry = policy,
                None => tracing::warn!(target: "lacquer::config", value = %raw, "ignoring unrecognised LACQUER_CASCADE_RETRY"),
            }
        }
        if let Ok(owner) = env::var("LACQUER_FALLBACK_OWNER") {
            if !owner.trim().is_empty() {
                config.fallback_owner = OwnerId::new(owner.trim());
            }
        }

        config
    }

    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            poll_interval: self.poll_interval,
            channel_capacity: self.channel_capacity,
            notify_channel: self.notify_channel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cascade_retry() {
        assert_eq!(CascadeRetry::parse("surface"), Some(CascadeRetry::Surface));
        assert_eq!(
            CascadeRetry::parse(" AUTO "),
            Some(CascadeRetry::Automatic { attempts: 3 })
        );
        assert_eq!(
            CascadeRetry::parse("auto:5"),
            Some(CascadeRetry::Automatic { attempts: 5 })
        );
        assert_eq!(CascadeRetry::parse("auto:many"), None);
        assert_eq!(CascadeRetry::Automatic { attempts: 0 }.max_runs(), 1);
    }
}
