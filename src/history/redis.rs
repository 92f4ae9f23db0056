use async_trait::async_trait;
use crate::history::{ BackendError, DurableStore, EphemeralStore };
use log::debug;
use redis::{ Client, AsyncCommands };
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;

/// Redis serves both roles: plain keys for registered users, `SET EX` keys for guests.
pub struct RedisHistoryBackend {
    client: Client,
    conn: OnceCell<MultiplexedConnection>,
    scan_count: usize,
}

impl RedisHistoryBackend {
    pub fn new(host: &str, scan_count: usize) -> Result<Self, BackendError> {
        Ok(Self {
            client: Client::open(host)?,
            conn: OnceCell::new(),
            scan_count: scan_count.max(1),
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, BackendError> {
        let conn = self.conn.get_or_try_init(|| async {
            self.client.get_multiplexed_async_connection().await
        }).await?;
        Ok(conn.clone())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.get_connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

/// Escapes glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl DurableStore for RedisHistoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<bool, BackendError> {
        let mut conn = self.get_connection().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.delete_key(key).await
    }
}

#[async_trait]
impl EphemeralStore for RedisHistoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool, BackendError> {
        let mut conn = self.get_connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds.max(1)).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.delete_key(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.get_connection().await?;
        let pattern = match_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis
                ::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across batches.
        keys.sort();
        keys.dedup();
        debug!("SCAN {} returned {} keys", pattern, keys.len());
        Ok(keys)
    }
}
