use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::DownloadError;
use crate::store::kv::Kv;

/// In-process [`Kv`] with the same observable semantics as the Redis
/// backend. Serves the test suites; nothing stops a single-node deployment
/// from using it, but state dies with the process.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    queue_ready: Notify,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let resolve = |idx: i64| -> i64 {
        if idx < 0 {
            len as i64 + idx
        } else {
            idx
        }
    };
    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len as i64 - 1);
    if len == 0 || start > stop {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.strings.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        let occupied = inner.strings.get(key).map(|e| e.live()).unwrap_or(false);
        if if_absent && occupied {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DownloadError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.lists.get_mut(key) {
            match normalize_range(list.len(), start, stop) {
                Some((start, stop)) => {
                    let kept: VecDeque<String> =
                        list.iter().skip(start).take(stop - start + 1).cloned().collect();
                    *list = kept;
                }
                None => {
                    list.clear();
                }
            }
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, DownloadError> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(list.len(), start, stop) {
            Some((start, stop)) => list.iter().skip(start).take(stop - start + 1).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, DownloadError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .strings
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), DownloadError> {
        let senders = {
            let mut inner = self.inner.lock().unwrap();
            let Some(senders) = inner.subscribers.get_mut(channel) else {
                return Ok(());
            };
            senders.retain(|tx| !tx.is_closed());
            senders.clone()
        };
        for tx in senders {
            let _ = tx.send(payload.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, DownloadError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, DownloadError> {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .strings
            .get(key)
            .map(|entry| entry.live() && entry.value == expected)
            .unwrap_or(false);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn queue_push(&self, key: &str, value: &str) -> Result<(), DownloadError> {
        self.lpush(key, value).await?;
        self.queue_ready.notify_one();
        Ok(())
    }

    async fn queue_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DownloadError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(list) = inner.lists.get_mut(key) {
                    if let Some(value) = list.pop_back() {
                        return Ok(Some(value));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.queue_ready.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_value() {
        let kv = MemoryKv::new();
        assert!(kv.set("k", "a", None, true).await.unwrap());
        assert!(!kv.set("k", "b", None, true).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(5)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn ltrim_keeps_window() {
        let kv = MemoryKv::new();
        for i in 0..8 {
            kv.lpush("l", &i.to_string()).await.unwrap();
        }
        kv.ltrim("l", 0, 2).await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["7", "6", "5"]);
    }

    #[tokio::test]
    async fn compare_and_delete_only_on_match() {
        let kv = MemoryKv::new();
        kv.set("k", "mine", None, false).await.unwrap();
        assert!(!kv.compare_and_delete("k", "other").await.unwrap());
        assert!(kv.compare_and_delete("k", "mine").await.unwrap());
        assert!(!kv.compare_and_delete("k", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_live_subscribers() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("ch").await.unwrap();
        kv.publish("ch", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn queue_pop_waits_for_push() {
        let kv = std::sync::Arc::new(MemoryKv::new());
        let popper = {
            let kv = kv.clone();
            tokio::spawn(async move { kv.queue_pop("q", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        kv.queue_push("q", "job-1").await.unwrap();
        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn queue_pop_times_out_empty() {
        let kv = MemoryKv::new();
        let popped = kv.queue_pop("q", Duration::from_millis(30)).await.unwrap();
        assert_eq!(popped, None);
    }
}
