// 键值缓存
// 会话存储的底层抽象，默认内存实现，可选 Redis 实现

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// 键值缓存 trait
///
/// 不同键之间的访问互不阻塞；不提供跨键事务。
#[async_trait]
pub trait Cache: Send + Sync {
    /// 读取，键不存在时返回 `None`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 无条件覆盖写入
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// 删除，返回键此前是否存在
    async fn del(&self, key: &str) -> Result<bool>;

    /// 单调递增序号（CSeq / SN）
    async fn next_seq(&self) -> Result<i64>;
}

/// 内存缓存（分片锁，用于单节点和测试）
pub struct MemoryCache {
    entries: DashMap<String, String>,
    seq: AtomicI64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicI64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn next_seq(&self) -> Result<i64> {
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Redis 缓存
#[cfg(feature = "redis-cache")]
pub struct RedisCache {
    client: redis::Client,
    seq_key: String,
}

#[cfg(feature = "redis-cache")]
impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| crate::GbError::cache(e.to_string()))?;
        Ok(Self {
            client,
            seq_key: "gb28181:cseq".to_string(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| crate::GbError::cache(e.to_string()))
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(|e| crate::GbError::cache(e.to_string()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        conn.set(key, value).await.map_err(|e| crate::GbError::cache(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| crate::GbError::cache(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn next_seq(&self) -> Result<i64> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        conn.incr(&self.seq_key, 1).await.map_err(|e| crate::GbError::cache(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryCache::new();

        assert_eq!(cache.get("stream_info:s1").await.unwrap(), None);

        cache.set("stream_info:s1", "a".to_string()).await.unwrap();
        cache.set("stream_info:s1", "b".to_string()).await.unwrap();
        assert_eq!(cache.get("stream_info:s1").await.unwrap().as_deref(), Some("b"));

        assert!(cache.del("stream_info:s1").await.unwrap());
        assert!(!cache.del("stream_info:s1").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_next_seq_is_unique_under_concurrency() {
        let cache = Arc::new(MemoryCache::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.next_seq().await.unwrap() })
            })
            .collect();

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        seqs.dedup();

        assert_eq!(seqs.len(), 16);
        assert_eq!(seqs[0], 1);
    }
}
