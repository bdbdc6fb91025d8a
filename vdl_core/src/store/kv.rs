use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DownloadError;

/// Capability set the task store is written against.
///
/// The production backend is Redis; tests use [`super::memory::MemoryKv`].
/// Semantics follow the Redis commands of the same name: `set` with
/// `if_absent` is `SET NX`, `compare_and_delete` only removes the key when
/// its current value matches, `queue_pop` is a blocking right-pop with a
/// timeout and at-most-one delivery per pushed item.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, DownloadError>;

    /// Returns `false` only when `if_absent` was requested and the key
    /// already existed.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, DownloadError>;

    async fn del(&self, key: &str) -> Result<(), DownloadError>;

    async fn exists(&self, key: &str) -> Result<bool, DownloadError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), DownloadError>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), DownloadError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, DownloadError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, DownloadError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DownloadError>;

    /// Subscribe to a channel; messages published after this call arrive on
    /// the returned receiver. Dropping the receiver ends the subscription.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DownloadError>;

    /// Delete `key` only if its current value equals `expected`; returns
    /// whether a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str)
        -> Result<bool, DownloadError>;

    async fn queue_push(&self, key: &str, value: &str) -> Result<(), DownloadError>;

    /// Pop one item, waiting up to `timeout`; `None` on timeout.
    async fn queue_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DownloadError>;
}
