//! Token quota accounting.
//!
//! Streams check the quota before they open and record usage only after a
//! successful commit, so a failed generation never costs the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};

pub trait QuotaService: Send + Sync {
    /// Reject with [`GraphError::QuotaExceeded`] when the caller has no budget left.
    fn check(&self, caller: &str) -> GraphResult<()>;

    fn record(&self, caller: &str, tokens: u64);

    fn used(&self, caller: &str) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

impl QuotaService for UnlimitedQuota {
    fn check(&self, _caller: &str) -> GraphResult<()> {
        Ok(())
    }

    fn record(&self, _caller: &str, _tokens: u64) {}

    fn used(&self, _caller: &str) -> u64 {
        0
    }
}

/// Fixed token budget per caller, kept in process memory.
#[derive(Debug)]
pub struct InMemoryQuota {
    limit: u64,
    used: Mutex<HashMap<String, u64>>,
}

impl InMemoryQuota {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }
}

impl QuotaService for InMemoryQuota {
    fn check(&self, caller: &str) -> GraphResult<()> {
        let used = self.used(caller);
        if used >= self.limit {
            warn!(caller, used, limit = self.limit, "token quota exhausted");
            return Err(GraphError::QuotaExceeded {
                used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn record(&self, caller: &str, tokens: u64) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let total = used.entry(caller.to_string()).or_insert(0);
        *total = total.saturating_add(tokens);
        debug!(caller, tokens, total = *total, "recorded token usage");
    }

    fn used(&self, caller: &str) -> u64 {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.get(caller).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_fails_once_budget_is_spent() {
        let quota = InMemoryQuota::new(10);
        assert!(quota.check("alice").is_ok());
        quota.record("alice", 6);
        assert!(quota.check("alice").is_ok());
        quota.record("alice", 4);

        let err = quota.check("alice").unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(err.status_code(), 402);
        assert!(quota.check("bob").is_ok());
    }
}
