//! Agent policy: a wallet blacklist plus an optional on-chain reputation
//! floor. Both checks are skipped when their request header is absent.

pub mod reputation;

use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::receipt::ReasonCode;
use crate::utils::clock::Clock;
pub use reputation::{EvmReputationOracle, ReputationOracle};

pub const REPUTATION_CACHE_TTL_MS: i64 = 60_000;

/// Concurrent set of blocked wallet addresses (stored lowercased).
#[derive(Default)]
pub struct Blacklist {
    addresses: RwLock<HashSet<String>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: &str) -> bool {
        self.addresses
            .write()
            .unwrap()
            .insert(address.trim().to_lowercase())
    }

    pub fn remove(&self, address: &str) -> bool {
        self.addresses
            .write()
            .unwrap()
            .remove(&address.trim().to_lowercase())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses
            .read()
            .unwrap()
            .contains(&address.trim().to_lowercase())
    }

    pub fn list(&self) -> Vec<String> {
        let mut addresses: Vec<String> =
            self.addresses.read().unwrap().iter().cloned().collect();
        addresses.sort();
        addresses
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allowed,
    Denied {
        reason: ReasonCode,
        explanation: String,
    },
}

pub struct AgentPolicy {
    pub blacklist: Blacklist,
    oracle: Option<Arc<dyn ReputationOracle>>,
    min_score: u64,
    cache: RwLock<HashMap<String, (i64, (u64, u64))>>,
    clock: Arc<dyn Clock>,
}

impl AgentPolicy {
    pub fn new(
        oracle: Option<Arc<dyn ReputationOracle>>,
        min_score: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blacklist: Blacklist::new(),
            oracle,
            min_score,
            cache: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Cached `(count, score)` for admin introspection and the check below.
    pub async fn reputation_of(&self, agent_id: &str) -> Option<(u64, u64)> {
        let oracle = self.oracle.as_ref()?;
        let now = self.clock.now_ms();

        if let Some((cached_at, value)) = self.cache.read().unwrap().get(agent_id) {
            if now - cached_at < REPUTATION_CACHE_TTL_MS {
                return Some(*value);
            }
        }

        match oracle.reputation(agent_id).await {
            Ok(value) => {
                self.cache
                    .write()
                    .unwrap()
                    .insert(agent_id.to_string(), (now, value));
                Some(value)
            }
            Err(e) => {
                // An unreachable oracle must not take the gateway down with it.
                warn!("reputation lookup for agent {} failed: {}", agent_id, e);
                None
            }
        }
    }

    pub fn reputation_enabled(&self) -> bool {
        self.oracle.is_some()
    }

    pub async fn check(
        &self,
        agent_address: Option<&str>,
        agent_id: Option<&str>,
    ) -> PolicyDecision {
        if let Some(address) = agent_address {
            if self.blacklist.contains(address) {
                return PolicyDecision::Denied {
                    reason: ReasonCode::AgentBlocked,
                    explanation: format!("agent wallet {} is blacklisted", address),
                };
            }
        }

        if let (Some(_), Some(agent_id)) = (&self.oracle, agent_id) {
            if let Some((count, score)) = self.reputation_of(agent_id).await {
                if count > 0 && score < self.min_score {
                    return PolicyDecision::Denied {
                        reason: ReasonCode::ReputationTooLow,
                        explanation: format!(
                            "agent {} score {} is below the minimum {}",
                            agent_id, score, self.min_score
                        ),
                    };
                }
            }
        }

        PolicyDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::FixedClock;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeOracle {
        count: u64,
        score: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReputationOracle for FakeOracle {
        async fn reputation(&self, _agent_id: &str) -> Result<(u64, u64)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.count, self.score))
        }
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn blacklist_is_case_insensitive() {
        let blacklist = Blacklist::new();
        blacklist.add("0xABCDEF0123456789abcdef0123456789ABCDEF01");
        assert!(blacklist.contains("0xabcdef0123456789abcdef0123456789abcdef01"));
        assert!(blacklist.remove("0xAbCdEf0123456789abcdef0123456789abcdef01"));
        assert!(!blacklist.contains("0xabcdef0123456789abcdef0123456789abcdef01"));
    }

    #[tokio::test]
    async fn blocked_agent_denied() {
        let policy = AgentPolicy::new(None, 0, clock());
        policy.blacklist.add("0xbad");
        match policy.check(Some("0xBAD"), None).await {
            PolicyDecision::Denied { reason, .. } => {
                assert_eq!(reason, ReasonCode::AgentBlocked)
            }
            _ => panic!("expected denial"),
        }
        assert_eq!(policy.check(Some("0xgood"), None).await, PolicyDecision::Allowed);
    }

    #[tokio::test]
    async fn low_score_denied_but_unknown_agents_pass() {
        let oracle = Arc::new(FakeOracle {
            count: 5,
            score: 10,
            calls: AtomicUsize::new(0),
        });
        let policy = AgentPolicy::new(Some(oracle), 50, clock());
        match policy.check(None, Some("7")).await {
            PolicyDecision::Denied { reason, .. } => {
                assert_eq!(reason, ReasonCode::ReputationTooLow)
            }
            _ => panic!("expected denial"),
        }

        // Zero interactions means no track record, not a bad one.
        let fresh = Arc::new(FakeOracle {
            count: 0,
            score: 0,
            calls: AtomicUsize::new(0),
        });
        let policy = AgentPolicy::new(Some(fresh), 50, clock());
        assert_eq!(policy.check(None, Some("7")).await, PolicyDecision::Allowed);
    }

    #[tokio::test]
    async fn reputation_results_are_cached_for_a_minute() {
        let oracle = Arc::new(FakeOracle {
            count: 1,
            score: 90,
            calls: AtomicUsize::new(0),
        });
        let clock = clock();
        let policy = AgentPolicy::new(Some(oracle.clone()), 50, clock.clone());

        policy.check(None, Some("7")).await;
        policy.check(None, Some("7")).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

        clock.advance_ms(REPUTATION_CACHE_TTL_MS + 1);
        policy.check(None, Some("7")).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_headers_skip_checks() {
        let policy = AgentPolicy::new(None, 0, clock());
        assert_eq!(policy.check(None, None).await, PolicyDecision::Allowed);
    }
}
