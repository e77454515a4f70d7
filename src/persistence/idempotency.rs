//! Durable request/response memo for mutating calls.
//!
//! The composite primary key (caller, method, path, token) is the only
//! guard against duplicate execution: racing stores resolve through
//! `ON CONFLICT DO NOTHING`, so the first stored response wins.

use chrono::Utc;
use duckdb::params;
use std::collections::HashMap;
use tracing::{debug, info};

use super::store::{format_ts, parse_ts};
use super::Persistence;
use crate::error::GraphResult;
use crate::types::IdempotencyRecord;

/// Key identifying one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub caller_id: String,
    pub method: String,
    pub path: String,
    pub token: String,
}

impl IdempotencyKey {
    pub fn new(
        caller_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            token: token.into(),
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyCache {
    persistence: Persistence,
}

impl IdempotencyCache {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    pub fn lookup(&self, key: &IdempotencyKey) -> GraphResult<Option<IdempotencyRecord>> {
        let conn = self.persistence.conn();
        let mut stmt = conn.prepare(
            "SELECT status, headers, body, created_at FROM idempotency_requests
             WHERE caller_id = ? AND method = ? AND path = ? AND token = ?",
        )?;
        let mut rows = stmt.query(params![key.caller_id, key.method, key.path, key.token])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let status: i32 = row.get(0)?;
        let headers_text: String = row.get(1)?;
        let body: String = row.get(2)?;
        let created_at: String = row.get(3)?;
        let headers: HashMap<String, String> =
            serde_json::from_str(&headers_text).unwrap_or_default();
        debug!(path = %key.path, token = %key.token, "idempotency cache hit");
        Ok(Some(IdempotencyRecord {
            caller_id: key.caller_id.clone(),
            method: key.method.clone(),
            path: key.path.clone(),
            token: key.token.clone(),
            status: status as u16,
            headers,
            body,
            created_at: parse_ts(&created_at),
        }))
    }

    /// Store a response. Returns `false` when an earlier response already
    /// holds the key; that earlier response stays authoritative.
    pub fn store(
        &self,
        key: &IdempotencyKey,
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
    ) -> GraphResult<bool> {
        let headers_text = serde_json::to_string(headers)?;
        let conn = self.persistence.conn();
        let inserted = conn.execute(
            "INSERT INTO idempotency_requests (caller_id, method, path, token, status, headers, body, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
            params![
                key.caller_id,
                key.method,
                key.path,
                key.token,
                status as i32,
                headers_text,
                body,
                format_ts(&Utc::now()),
            ],
        )?;
        if inserted == 0 {
            info!(path = %key.path, token = %key.token, "idempotency key already stored; keeping first response");
        }
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_store_wins() {
        let cache = Persistence::in_memory().unwrap().idempotency();
        let key = IdempotencyKey::new("alice", "post", "/branches/b1/append", "tok-1");
        let headers = HashMap::from([("content-type".to_string(), "application/json".to_string())]);

        assert!(cache.store(&key, 200, &headers, r#"{"a":1}"#).unwrap());
        assert!(!cache.store(&key, 201, &headers, r#"{"a":2}"#).unwrap());

        let record = cache.lookup(&key).unwrap().expect("stored");
        assert_eq!(record.status, 200);
        assert_eq!(record.body, r#"{"a":1}"#);
        assert_eq!(record.method, "POST");
        assert_eq!(record.headers["content-type"], "application/json");
    }

    #[test]
    fn keys_are_scoped_per_caller_and_path() {
        let cache = Persistence::in_memory().unwrap().idempotency();
        let key = IdempotencyKey::new("alice", "POST", "/graphs/start", "t");
        cache.store(&key, 200, &HashMap::new(), "{}").unwrap();

        let other_caller = IdempotencyKey::new("bob", "POST", "/graphs/start", "t");
        let other_path = IdempotencyKey::new("alice", "POST", "/branches/x/append", "t");
        assert!(cache.lookup(&other_caller).unwrap().is_none());
        assert!(cache.lookup(&other_path).unwrap().is_none());
        assert!(cache.lookup(&key).unwrap().is_some());
    }
}
