//! Ephemeral latest-value cache over Redis.
//!
//! Keys are `kind:symbol`, values are serialized bytes, every entry carries
//! a TTL. The cache is optional throughout the pipeline; when it is absent
//! the streaming collector simply skips the update. The connection manager
//! multiplexes commands over a self-healing connection.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, instrument};

use crate::config::CacheSettings;
use crate::error::Result;

/// Builds the canonical `kind:symbol` cache key.
pub fn cache_key(kind: &str, symbol: &str) -> String {
    format!("{kind}:{symbol}")
}

pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    #[instrument(skip(settings), fields(host = %settings.host, port = settings.port))]
    pub async fn connect(settings: &CacheSettings) -> Result<Self> {
        let client = redis::Client::open(settings.connection_url())?;
        let manager = ConnectionManager::new(client).await?;
        info!("cache connected");
        Ok(Self { manager })
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs as usize).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set_multi(&self, entries: &[(String, Vec<u8>)], ttl_secs: u64) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("EX")
                .arg(ttl_secs)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    /// Reachability probe for the health check.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("kline", "SOL/USDT"), "kline:SOL/USDT");
        assert_eq!(cache_key("mark_price", "BTC/USDT"), "mark_price:BTC/USDT");
    }
}
