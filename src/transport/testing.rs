//! Scripted client for exercising workers against exact service behaviour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::transport::{
    ProduceMsg, Subscription, Topic, TopicClient, TopicFilter, TransportError,
};

#[derive(Default)]
pub struct ScriptedClient {
    /// Taken by the first `create_topic`; later calls report `TopicExists`.
    pub create_error: Mutex<Option<TransportError>>,
    created: AtomicBool,
    /// Counts returned by successive pulls; `Ok(0)` once exhausted.
    pub pulls: Mutex<VecDeque<Result<usize, TransportError>>>,
    pub pull_offsets: Mutex<Vec<i64>>,
    pub offsets: Mutex<(i64, i64)>,
    /// Outcomes for successive streamed messages; success once exhausted.
    pub append_results: Mutex<VecDeque<Result<(), TransportError>>>,
    /// Keep streamed messages without ever answering them.
    pub hold_acks: AtomicBool,
    held: Mutex<Vec<ProduceMsg>>,
    /// Returned by `append_stream` before it reads anything.
    pub stream_failure: Mutex<Option<TransportError>>,
    pub streamed: AtomicUsize,
    pub wake: Arc<Notify>,
    pub live_subscriptions: Arc<AtomicUsize>,
    /// Make `Subscription::shutdown` fail; the registration is still dropped.
    pub fail_release: AtomicBool,
}

impl ScriptedClient {
    pub fn with_pulls(counts: impl IntoIterator<Item = usize>) -> Self {
        let client = Self::default();
        client
            .pulls
            .lock()
            .unwrap()
            .extend(counts.into_iter().map(Ok));
        client
    }

    pub fn pull_count(&self) -> usize {
        self.pull_offsets.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl TopicClient for ScriptedClient {
    async fn create_topic(&self, _topic: &[u8]) -> Result<(), TransportError> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        if self.created.swap(true, Ordering::SeqCst) {
            return Err(TransportError::TopicExists);
        }
        Ok(())
    }

    async fn delete_topic(&self, _topic: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn list_topics(&self, _filter: &TopicFilter) -> Result<Vec<Topic>, TransportError> {
        Ok(Vec::new())
    }

    async fn offsets(&self, _topic: &[u8]) -> Result<(i64, i64), TransportError> {
        Ok(*self.offsets.lock().unwrap())
    }

    async fn append(&self, _topic: &[u8], _payload: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn append_stream(
        &self,
        _topic: &[u8],
        pipe: flume::Receiver<ProduceMsg>,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.stream_failure.lock().unwrap().take() {
            return Err(err);
        }
        while let Ok(msg) = pipe.recv_async().await {
            self.streamed.fetch_add(1, Ordering::SeqCst);
            if self.hold_acks.load(Ordering::SeqCst) {
                self.held.lock().unwrap().push(msg);
                continue;
            }
            let outcome = self
                .append_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            let _ = msg.result.send(outcome);
        }
        Ok(())
    }

    async fn pull(
        &self,
        _topic: &[u8],
        offset: i64,
        limit: usize,
        buf: &mut Vec<Bytes>,
    ) -> Result<usize, TransportError> {
        buf.clear();
        self.pull_offsets.lock().unwrap().push(offset);
        let n = self.pulls.lock().unwrap().pop_front().unwrap_or(Ok(0))?;
        buf.extend(std::iter::repeat_n(Bytes::from_static(b"m\n"), n.min(limit)));
        Ok(buf.len())
    }

    async fn subscribe(&self, _topic: &[u8]) -> Result<Box<dyn Subscription>, TransportError> {
        self.live_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSubscription {
            wake: self.wake.clone(),
            live: Some(self.live_subscriptions.clone()),
            fail_release: self.fail_release.load(Ordering::SeqCst),
        }))
    }
}

struct ScriptedSubscription {
    wake: Arc<Notify>,
    live: Option<Arc<AtomicUsize>>,
    fail_release: bool,
}

#[async_trait::async_trait]
impl Subscription for ScriptedSubscription {
    async fn changed(&mut self) -> Result<(), TransportError> {
        self.wake.notified().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.fail_release {
            return Err(TransportError::Subscribe("release refused".into()));
        }
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for ScriptedSubscription {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
