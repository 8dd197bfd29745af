// ============================================================================
// Idempotency Ledger
// ============================================================================
//
// Durable key-set answering "has event E been completed?" with TTL'd marks.
// The ledger is the single authority shared by every worker; the race where
// two workers both miss the mark is tolerated because the publish key
// collapses duplicates downstream and re-marking is idempotent.
//
// Redis contract: EXISTS event:{event_id} / SET event:{event_id} "1" EX ttl.
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// True iff a live completion mark exists for `event_id`.
    async fn is_processed(&self, event_id: &str) -> Result<bool>;

    /// Create or refresh the completion mark with the given TTL.
    async fn mark_processed(&self, event_id: &str, ttl: Duration) -> Result<()>;
}

/// Redis-backed ledger.
///
/// The connection manager reconnects on its own and is cheap to clone per
/// call, so no external locking is needed.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
}

impl RedisLedger {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to create redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        info!("connected to redis");
        Ok(Self { conn })
    }

    fn key(event_id: &str) -> String {
        format!("event:{event_id}")
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn is_processed(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(Self::key(event_id))
            .await
            .context("ledger EXISTS failed")?;
        Ok(exists)
    }

    async fn mark_processed(&self, event_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::key(event_id), "1", ttl.as_secs())
            .await
            .context("ledger SET EX failed")?;
        Ok(())
    }
}
