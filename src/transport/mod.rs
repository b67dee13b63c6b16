//! Topic service abstraction: client trait, types, and builder factory.

pub mod config;
#[cfg(any(test, feature = "transport-memory"))]
pub mod memory;
#[cfg(feature = "transport-nats")]
pub mod nats;
#[cfg(test)]
pub mod testing;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;

/// Topics are opaque byte strings on the wire.
pub type Topic = Bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Engine {
    Memory,
    Nats,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("topic already exists")]
    TopicExists,
    #[error("topic not found")]
    TopicNotFound,
    #[error("invalid offset {0}")]
    InvalidOffset(i64),
    #[error("connect: {0}")]
    Connect(String),
    #[error("append: {0}")]
    Append(String),
    #[error("pull: {0}")]
    Pull(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("disconnected")]
    Disconnected,
    #[error("other: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_topic_exists(&self) -> bool {
        matches!(self, Self::TopicExists)
    }
}

/// One in-flight message handed to [`TopicClient::append_stream`].
///
/// The stream sends exactly one outcome on `result` once the service accepts
/// or rejects `msg`. Dropping it unanswered closes the receiver instead.
#[derive(Debug)]
pub struct ProduceMsg {
    pub msg: Bytes,
    pub result: oneshot::Sender<Result<(), TransportError>>,
}

/// Topic selection for [`TopicClient::list_topics`]. Every criterion that is
/// set must match.
#[derive(Clone, Debug, Default)]
pub struct TopicFilter {
    pub prefix: Option<Bytes>,
    pub suffix: Option<Bytes>,
    pub pattern: Option<regex::bytes::Regex>,
}

impl TopicFilter {
    pub fn new(prefix: &str, suffix: &str, pattern: &str) -> Result<Self, regex::Error> {
        let non_empty = |s: &str| (!s.is_empty()).then(|| Bytes::copy_from_slice(s.as_bytes()));
        let pattern = if pattern.is_empty() {
            None
        } else {
            Some(regex::bytes::Regex::new(pattern)?)
        };
        Ok(Self {
            prefix: non_empty(prefix),
            suffix: non_empty(suffix),
            pattern,
        })
    }

    pub fn matches(&self, topic: &[u8]) -> bool {
        if let Some(p) = &self.prefix {
            if !topic.starts_with(p) {
                return false;
            }
        }
        if let Some(s) = &self.suffix {
            if !topic.ends_with(s) {
                return false;
            }
        }
        match &self.pattern {
            Some(re) => re.is_match(topic),
            None => true,
        }
    }
}

#[async_trait::async_trait]
pub trait TopicClient: Send + Sync {
    /// Fails with [`TransportError::TopicExists`] when the topic is already there.
    async fn create_topic(&self, topic: &[u8]) -> Result<(), TransportError>;
    async fn delete_topic(&self, topic: &[u8]) -> Result<(), TransportError>;
    async fn list_topics(&self, filter: &TopicFilter) -> Result<Vec<Topic>, TransportError>;
    /// Returns `(min, max)`; `max` is one past the newest message.
    async fn offsets(&self, topic: &[u8]) -> Result<(i64, i64), TransportError>;
    async fn append(&self, topic: &[u8], payload: Bytes) -> Result<(), TransportError>;
    // Drives the pipe until every sender is dropped. Per-message outcomes go
    // back through `ProduceMsg::result`; only stream-level failures are returned.
    async fn append_stream(
        &self,
        topic: &[u8],
        pipe: flume::Receiver<ProduceMsg>,
    ) -> Result<(), TransportError>;
    /// Clears `buf`, fills it with up to `limit` messages starting at `offset`
    /// and returns how many were read.
    async fn pull(
        &self,
        topic: &[u8],
        offset: i64,
        limit: usize,
        buf: &mut Vec<Bytes>,
    ) -> Result<usize, TransportError>;
    async fn subscribe(&self, topic: &[u8]) -> Result<Box<dyn Subscription>, TransportError>;
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Live "new data committed" registration on one topic.
#[async_trait::async_trait]
pub trait Subscription: Send + Sync {
    /// Suspends until at least one commit happened since the previous wakeup.
    /// Bursts of commits collapse into a single pending wakeup.
    async fn changed(&mut self) -> Result<(), TransportError>;
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Hands out one fresh client per worker.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TopicClient>, TransportError>;
}

/// [`ClientFactory`] backed by [`TransportBuilder`].
#[derive(Clone, Debug)]
pub struct EngineFactory {
    pub engine: Engine,
    pub opts: ConnectOptions,
}

#[async_trait::async_trait]
impl ClientFactory for EngineFactory {
    async fn connect(&self) -> Result<Arc<dyn TopicClient>, TransportError> {
        TransportBuilder::connect(self.engine.clone(), self.opts.clone())
            .await
            .map(Arc::from)
    }
}

pub struct TransportBuilder;

impl TransportBuilder {
    pub async fn connect(
        engine: Engine,
        opts: ConnectOptions,
    ) -> Result<Box<dyn TopicClient>, TransportError> {
        match engine {
            Engine::Memory => {
                #[cfg(any(test, feature = "transport-memory"))]
                {
                    return crate::transport::memory::connect(opts).await;
                }
                #[cfg(not(any(test, feature = "transport-memory")))]
                {
                    let _ = opts;
                    Err(TransportError::Connect("memory feature disabled".into()))
                }
            }
            Engine::Nats => {
                #[cfg(feature = "transport-nats")]
                {
                    return crate::transport::nats::connect(opts).await;
                }
                #[cfg(not(feature = "transport-nats"))]
                {
                    let _ = opts;
                    Err(TransportError::Connect("nats feature disabled".into()))
                }
            }
        }
    }
}

/// Drive an append pipe against a service that acknowledges asynchronously.
///
/// `publish` hands one message to the service and resolves to a future for
/// its acknowledgement. Acknowledgements are awaited concurrently while the
/// pipe keeps being read, so the number of unacknowledged messages is
/// bounded by whoever feeds the pipe, not by this loop. A publish that fails
/// with [`TransportError::Disconnected`] ends the stream; any other failure
/// is reported on that message only. Returns once every sender is gone and
/// all outstanding acknowledgements have been delivered.
pub async fn pipelined_append<P, Fut, Ack>(
    pipe: flume::Receiver<ProduceMsg>,
    mut publish: P,
) -> Result<(), TransportError>
where
    P: FnMut(Bytes) -> Fut,
    Fut: Future<Output = Result<Ack, TransportError>>,
    Ack: Future<Output = Result<(), TransportError>>,
{
    let mut acks = FuturesUnordered::new();
    loop {
        tokio::select! {
            next = pipe.recv_async() => {
                let Ok(ProduceMsg { msg, result }) = next else {
                    break;
                };
                match publish(msg).await {
                    Ok(ack) => acks.push(async move {
                        let _ = result.send(ack.await);
                    }),
                    Err(TransportError::Disconnected) => {
                        let _ = result.send(Err(TransportError::Disconnected));
                        return Err(TransportError::Disconnected);
                    }
                    Err(e) => {
                        let _ = result.send(Err(e));
                    }
                }
            }
            Some(()) = acks.next(), if !acks.is_empty() => {}
        }
    }
    while acks.next().await.is_some() {}
    Ok(())
}

/// Lossy display form of a topic for logs and reports.
pub fn topic_display(topic: &[u8]) -> String {
    String::from_utf8_lossy(topic).into_owned()
}
