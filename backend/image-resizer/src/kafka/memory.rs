//! Scripted in-memory message bus for tests and local runs
//!
//! Deliveries are queued up front; `redeliver` puts the rewound message back
//! at the head of the queue, mirroring a partition seek.

use super::{BusError, CommitToken, Delivery, MessageBus, TopicSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// A record captured by `publish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl PublishedRecord {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.value).unwrap_or(serde_json::Value::Null)
    }
}

pub struct InMemoryBus {
    topic: String,
    next_offset: AtomicUsize,
    queue: Mutex<VecDeque<Delivery>>,
    /// Fetched but not yet committed, for rewinds
    fetched: Mutex<Vec<Delivery>>,
    arrivals: Notify,
    commits: Mutex<Vec<CommitToken>>,
    redeliveries: Mutex<Vec<CommitToken>>,
    published: Mutex<Vec<PublishedRecord>>,
    ensured: Mutex<Vec<TopicSpec>>,
    failing_publishes: AtomicUsize,
    publish_calls: AtomicUsize,
    /// 1-based index of the `publish` call that fails, if any
    fail_publish_at: Mutex<Option<usize>>,
    failing_seeks: AtomicUsize,
    fail_commits: AtomicBool,
    fail_admin: AtomicBool,
}

impl InMemoryBus {
    /// Bus whose deliveries appear on partition 0 of `topic`
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            next_offset: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            fetched: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            commits: Mutex::new(Vec::new()),
            redeliveries: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            ensured: Mutex::new(Vec::new()),
            failing_publishes: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            fail_publish_at: Mutex::new(None),
            failing_seeks: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
            fail_admin: AtomicBool::new(false),
        }
    }

    /// Enqueue a raw payload keyed by `key`, returning its position
    pub fn push(&self, key: Option<&str>, payload: impl AsRef<[u8]>) -> CommitToken {
        self.enqueue(key, Some(payload.as_ref().to_vec()))
    }

    /// Enqueue a message without a payload
    pub fn push_tombstone(&self, key: Option<&str>) -> CommitToken {
        self.enqueue(key, None)
    }

    fn enqueue(&self, key: Option<&str>, payload: Option<Vec<u8>>) -> CommitToken {
        let token = CommitToken {
            topic: self.topic.clone(),
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst) as i64,
        };

        self.queue.lock().push_back(Delivery {
            key: key.map(|k| k.as_bytes().to_vec()),
            payload,
            token: token.clone(),
        });
        self.arrivals.notify_one();
        token
    }

    /// Enqueue a JSON payload
    pub fn push_json(&self, value: &serde_json::Value) -> CommitToken {
        let payload = value.to_string();
        let key = value.get("image_id").and_then(|v| v.as_str());
        self.push(key, payload)
    }

    /// Fail the next `n` publish calls
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the n-th `publish` (1-based, counted from now on) fail
    pub fn fail_publish_at(&self, nth: Option<usize>) {
        let base = self.publish_calls.load(Ordering::SeqCst);
        *self.fail_publish_at.lock() = nth.map(|n| base + n);
    }

    /// Fail the next `n` redeliver calls
    pub fn fail_next_seeks(&self, n: usize) {
        self.failing_seeks.store(n, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_admin(&self, fail: bool) {
        self.fail_admin.store(fail, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Deliveries fetched and not yet committed
    pub fn in_flight(&self) -> usize {
        self.fetched.lock().len()
    }

    pub fn commits(&self) -> Vec<CommitToken> {
        self.commits.lock().clone()
    }

    pub fn is_committed(&self, token: &CommitToken) -> bool {
        self.commits.lock().contains(token)
    }

    pub fn redeliveries(&self) -> Vec<CommitToken> {
        self.redeliveries.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedRecord> {
        self.published
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn ensured_topics(&self) -> Vec<TopicSpec> {
        self.ensured.lock().clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn fetch_next(&self) -> Result<Delivery, BusError> {
        loop {
            let next = self.queue.lock().pop_front();
            if let Some(delivery) = next {
                let mut fetched = self.fetched.lock();
                fetched.retain(|d| d.token != delivery.token);
                fetched.push(delivery.clone());
                return Ok(delivery);
            }
            self.arrivals.notified().await;
        }
    }

    async fn commit(&self, token: &CommitToken) -> Result<(), BusError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(BusError::Commit("injected commit failure".to_string()));
        }
        // A commit covers every earlier offset of the partition
        self.fetched.lock().retain(|d| {
            d.token.topic != token.topic
                || d.token.partition != token.partition
                || d.token.offset > token.offset
        });
        self.commits.lock().push(token.clone());
        Ok(())
    }

    async fn redeliver(&self, token: &CommitToken) -> Result<(), BusError> {
        let should_fail = self
            .failing_seeks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BusError::Seek("injected seek failure".to_string()));
        }

        let delivery = self
            .fetched
            .lock()
            .iter()
            .rev()
            .find(|d| &d.token == token)
            .cloned()
            .ok_or_else(|| BusError::Seek(format!("offset {} was never fetched", token.offset)))?;

        self.redeliveries.lock().push(token.clone());
        self.queue.lock().push_front(delivery);
        self.arrivals.notify_one();
        Ok(())
    }

    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BusError> {
        let should_fail = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let call = self.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if should_fail || *self.fail_publish_at.lock() == Some(call) {
            return Err(BusError::Publish("injected publish failure".to_string()));
        }

        self.published.lock().push(PublishedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError> {
        if self.fail_admin.load(Ordering::SeqCst) {
            return Err(BusError::Admin("injected admin failure".to_string()));
        }

        let mut ensured = self.ensured.lock();
        if !ensured.iter().any(|t| t.name == spec.name) {
            ensured.push(spec.clone());
        }
        Ok(())
    }
}
