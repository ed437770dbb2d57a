//! Distributed locks over Redis.
//!
//! A lock is a key holding a random token, taken with `SET NX PX` and
//! released by a script that deletes the key only when the token still
//! matches, so an expired lock can never be released out from under its
//! next holder. While held, a background task keeps extending the TTL; if
//! the process dies the TTL runs out and the lock frees itself.

use std::time::Duration;

use redis::{Script, aio::ConnectionManager};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::Error;

const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

const EXTEND_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end";

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Clone)]
pub struct LockManager {
    conn: ConnectionManager,
    ttl: Duration,
    retry_interval: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Take the lock if it is free, without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] if the command fails. A held lock is `Ok(None)`.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>, Error> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis(self.ttl))
            .query_async(&mut conn)
            .await?;
        if reply.is_none() {
            return Ok(None);
        }
        Ok(Some(LockGuard::held(
            self.conn.clone(),
            key.to_owned(),
            token,
            self.ttl,
        )))
    }

    /// Take the lock, waiting for the current holder if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] if a command fails.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, Error> {
        loop {
            if let Some(guard) = self.try_acquire(key).await? {
                return Ok(guard);
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// A held lock. Release it explicitly with [`release`](Self::release);
/// dropping it only stops the TTL renewal, leaving the key to expire.
pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
    renewal: JoinHandle<()>,
}

impl LockGuard {
    fn held(conn: ConnectionManager, key: String, token: String, ttl: Duration) -> Self {
        let renewal = tokio::spawn(renew(conn.clone(), key.clone(), token.clone(), ttl));
        Self {
            conn,
            key,
            token,
            renewal,
        }
    }

    /// Release the lock now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] if the release script fails; the key then
    /// frees itself when the TTL runs out.
    pub async fn release(self) -> Result<(), Error> {
        self.renewal.abort();
        let mut conn = self.conn.clone();
        Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew(mut conn: ConnectionManager, key: String, token: String, ttl: Duration) {
    let period = ttl / 3;
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.tick().await;
    loop {
        interval.tick().await;
        let extended: Result<i64, _> = Script::new(EXTEND_SCRIPT)
            .key(&key)
            .arg(&token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await;
        match extended {
            // Someone else owns the key now, stop renewing.
            Ok(0) => return,
            Ok(_) => {}
            Err(redis_error) => {
                warn!(key, %redis_error, "lock renewal failed");
            }
        }
    }
}
