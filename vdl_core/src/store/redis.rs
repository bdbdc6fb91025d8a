use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};

use crate::error::DownloadError;
use crate::store::kv::Kv;

/// Compare-and-delete as a Lua script so the check and the delete are one
/// atomic step on the server.
const CAD_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Redis-backed [`Kv`].
///
/// Regular commands go through a shared [`ConnectionManager`]. Blocking pops
/// and Pub/Sub need connections of their own: `BRPOP` would stall every
/// other command multiplexed on the shared connection, and subscriptions put
/// a connection into subscriber mode entirely.
pub struct RedisKv {
    manager: ConnectionManager,
    client: redis::Client,
    queue_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, DownloadError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            manager,
            client,
            queue_conn: Mutex::new(None),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, DownloadError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, DownloadError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        if if_absent {
            cmd.arg("NX");
        }
        let mut conn = self.conn();
        // SET returns nil instead of OK when NX found the key present.
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), DownloadError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DownloadError> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), DownloadError> {
        let mut conn = self.conn();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), DownloadError> {
        let mut conn = self.conn();
        let _: () = conn.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, DownloadError> {
        let mut conn = self.conn();
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, DownloadError> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DownloadError> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DownloadError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!("[store] undecodable pubsub payload: {err}");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Receiver gone — subscriber disconnected.
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, DownloadError> {
        let mut conn = self.conn();
        let deleted: i64 = redis::Script::new(CAD_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn queue_push(&self, key: &str, value: &str) -> Result<(), DownloadError> {
        let mut conn = self.conn();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn queue_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DownloadError> {
        let mut guard = self.queue_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let conn = guard.as_mut().expect("connection just created");

        let reply: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(conn)
            .await;
        match reply {
            Ok(popped) => Ok(popped.map(|(_, value)| value)),
            Err(err) => {
                // Drop the broken connection; the next pop reconnects.
                *guard = None;
                Err(err.into())
            }
        }
    }
}
