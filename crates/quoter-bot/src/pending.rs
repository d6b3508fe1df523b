//! Pending trade intents.
//!
//! Trades observed on the private stream but not yet reconciled into the
//! authoritative position. While any intent is live for a token, periodic
//! pulls must not overwrite that token's locally-accounted size. Entries
//! expire so a lost confirmation cannot wedge size accounting forever.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::info;

/// One observed-but-unconfirmed trade.
#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Concurrent set of pending intents keyed by exchange trade id.
#[derive(Debug)]
pub struct PendingIntents {
    intents: DashMap<String, PendingIntent>,
    ttl: Duration,
}

impl PendingIntents {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            intents: DashMap::new(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Register a trade id. Returns false if it was already tracked.
    pub fn insert(&self, trade_id: &str, token_id: &str) -> bool {
        self.intents
            .insert(
                trade_id.to_string(),
                PendingIntent {
                    token_id: token_id.to_string(),
                    expires_at: Utc::now() + self.ttl,
                },
            )
            .is_none()
    }

    /// Remove a trade id. Returns true if it was tracked.
    pub fn remove(&self, trade_id: &str) -> bool {
        self.intents.remove(trade_id).is_some()
    }

    /// Whether any intent is live for a token.
    pub fn has_pending(&self, token_id: &str) -> bool {
        self.intents.iter().any(|e| e.value().token_id == token_id)
    }

    /// Tokens with at least one live intent.
    pub fn pending_tokens(&self) -> HashSet<String> {
        self.intents
            .iter()
            .map(|e| e.value().token_id.clone())
            .collect()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.intents.len();
        self.intents.retain(|trade_id, intent| {
            let keep = intent.expires_at > now;
            if !keep {
                info!(trade_id, token_id = %intent.token_id, "sweeping stale pending trade");
            }
            keep
        });
        before - self.intents.len()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let pending = PendingIntents::new(60);
        assert!(pending.insert("t1", "token1"));
        assert!(!pending.insert("t1", "token1"));
        assert!(pending.has_pending("token1"));
        assert!(!pending.has_pending("token2"));

        assert!(pending.remove("t1"));
        assert!(!pending.remove("t1"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_tokens() {
        let pending = PendingIntents::new(60);
        pending.insert("t1", "token1");
        pending.insert("t2", "token1");
        pending.insert("t3", "token2");

        let tokens = pending.pending_tokens();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains("token1"));
        assert!(tokens.contains("token2"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let pending = PendingIntents::new(60);
        pending.insert("t1", "token1");
        pending.insert("t2", "token2");

        assert_eq!(pending.sweep(Utc::now()), 0);
        assert_eq!(pending.len(), 2);

        let later = Utc::now() + Duration::seconds(61);
        assert_eq!(pending.sweep(later), 2);
        assert!(pending.is_empty());
        assert!(!pending.has_pending("token1"));
    }
}
