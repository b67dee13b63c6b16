//! In-process topic service (feature `transport-memory`).
//!
//! Every client handed out by one [`MemoryBroker`] sees the same topics, so
//! workers can each hold their own "connection" while sharing state the way
//! they would against a real broker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use once_cell::sync::Lazy;
use tokio::sync::{Notify, RwLock};

use crate::transport::{
    ClientFactory, ConnectOptions, ProduceMsg, Subscription, Topic, TopicClient, TopicFilter,
    TransportError,
};

static DEFAULT_BROKER: Lazy<MemoryBroker> = Lazy::new(MemoryBroker::new);

pub async fn connect(_opts: ConnectOptions) -> Result<Box<dyn TopicClient>, TransportError> {
    Ok(Box::new(DEFAULT_BROKER.client()))
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<RwLock<BTreeMap<Topic, Arc<TopicLog>>>>,
}

#[derive(Default)]
struct TopicLog {
    messages: RwLock<Vec<Bytes>>,
    watchers: Mutex<Vec<Weak<Notify>>>,
}

impl TopicLog {
    fn notify_watchers(&self) {
        let mut watchers = match self.watchers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.retain(|w| match w.upgrade() {
            Some(n) => {
                n.notify_one();
                true
            }
            None => false,
        });
    }

    fn register(&self, notify: &Arc<Notify>) {
        let mut watchers = match self.watchers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.push(Arc::downgrade(notify));
    }

    fn unregister(&self, notify: &Arc<Notify>) {
        let mut watchers = match self.watchers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.retain(|w| w.upgrade().is_some_and(|n| !Arc::ptr_eq(&n, notify)));
    }

    fn watcher_count(&self) -> usize {
        match self.watchers.lock() {
            Ok(w) => w.iter().filter(|w| w.strong_count() > 0).count(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            broker: self.clone(),
        }
    }

    async fn log(&self, topic: &[u8]) -> Result<Arc<TopicLog>, TransportError> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or(TransportError::TopicNotFound)
    }

    async fn append(&self, topic: &[u8], payload: Bytes) -> Result<(), TransportError> {
        let log = self.log(topic).await?;
        log.messages.write().await.push(payload);
        log.notify_watchers();
        Ok(())
    }

    /// Number of live subscriptions on `topic`; zero for unknown topics.
    pub async fn subscriber_count(&self, topic: &[u8]) -> usize {
        match self.log(topic).await {
            Ok(log) => log.watcher_count(),
            Err(_) => 0,
        }
    }
}

#[async_trait::async_trait]
impl ClientFactory for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn TopicClient>, TransportError> {
        Ok(Arc::new(self.client()))
    }
}

#[derive(Clone)]
pub struct MemoryClient {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl TopicClient for MemoryClient {
    async fn create_topic(&self, topic: &[u8]) -> Result<(), TransportError> {
        if topic.is_empty() {
            return Err(TransportError::Other("empty topic name".into()));
        }
        let mut topics = self.broker.topics.write().await;
        if topics.contains_key(topic) {
            return Err(TransportError::TopicExists);
        }
        topics.insert(Bytes::copy_from_slice(topic), Arc::new(TopicLog::default()));
        Ok(())
    }

    async fn delete_topic(&self, topic: &[u8]) -> Result<(), TransportError> {
        self.broker
            .topics
            .write()
            .await
            .remove(topic)
            .map(|_| ())
            .ok_or(TransportError::TopicNotFound)
    }

    async fn list_topics(&self, filter: &TopicFilter) -> Result<Vec<Topic>, TransportError> {
        Ok(self
            .broker
            .topics
            .read()
            .await
            .keys()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn offsets(&self, topic: &[u8]) -> Result<(i64, i64), TransportError> {
        let log = self.broker.log(topic).await?;
        let len = log.messages.read().await.len();
        Ok((0, len as i64))
    }

    async fn append(&self, topic: &[u8], payload: Bytes) -> Result<(), TransportError> {
        self.broker.append(topic, payload).await
    }

    async fn append_stream(
        &self,
        topic: &[u8],
        pipe: flume::Receiver<ProduceMsg>,
    ) -> Result<(), TransportError> {
        while let Ok(ProduceMsg { msg, result }) = pipe.recv_async().await {
            let outcome = self.broker.append(topic, msg).await;
            // The producer may have stopped listening; nothing to do then.
            let _ = result.send(outcome);
        }
        Ok(())
    }

    async fn pull(
        &self,
        topic: &[u8],
        offset: i64,
        limit: usize,
        buf: &mut Vec<Bytes>,
    ) -> Result<usize, TransportError> {
        buf.clear();
        if offset < 0 {
            return Err(TransportError::InvalidOffset(offset));
        }
        let log = self.broker.log(topic).await?;
        let messages = log.messages.read().await;
        let start = (offset as usize).min(messages.len());
        let end = start.saturating_add(limit).min(messages.len());
        buf.extend(messages[start..end].iter().cloned());
        Ok(buf.len())
    }

    async fn subscribe(&self, topic: &[u8]) -> Result<Box<dyn Subscription>, TransportError> {
        let log = self.broker.log(topic).await?;
        let notify = Arc::new(Notify::new());
        log.register(&notify);
        Ok(Box::new(MemorySubscription {
            notify,
            log: Some(log),
        }))
    }
}

struct MemorySubscription {
    notify: Arc<Notify>,
    log: Option<Arc<TopicLog>>,
}

impl MemorySubscription {
    fn release(&mut self) {
        if let Some(log) = self.log.take() {
            log.unregister(&self.notify);
        }
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn changed(&mut self) -> Result<(), TransportError> {
        if self.log.is_none() {
            return Err(TransportError::Disconnected);
        }
        self.notify.notified().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
