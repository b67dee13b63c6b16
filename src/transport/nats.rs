//! NATS JetStream adapter (feature `transport-nats`).
//!
//! One stream per topic, named and bound to a subject equal to the topic.
//! Stream sequence numbers start at 1, so sequence = offset + 1. Commit
//! notifications come from a plain core-NATS subscription on the subject.

use std::ops::RangeInclusive;
use std::sync::Arc;

use async_nats::connection::State;
use async_nats::jetstream::{self, context::GetStreamErrorKind, stream, ErrorCode};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::transport::{
    ConnectOptions, ProduceMsg, Subscription, Topic, TopicClient, TopicFilter, TransportError,
    pipelined_append,
};

pub async fn connect(opts: ConnectOptions) -> Result<Box<dyn TopicClient>, TransportError> {
    let url = opts
        .params
        .get("url")
        .cloned()
        .unwrap_or_else(|| "nats://127.0.0.1:4222".into());
    let client = async_nats::connect(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let js = jetstream::new(client.clone());
    Ok(Box::new(NatsClient { client, js }))
}

pub struct NatsClient {
    client: async_nats::Client,
    js: jetstream::Context,
}

fn stream_name(topic: &[u8]) -> Result<String, TransportError> {
    let name = std::str::from_utf8(topic)
        .map_err(|_| TransportError::Other("topic must be valid UTF-8 for nats".into()))?;
    if name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
    {
        return Err(TransportError::Other(format!(
            "topic {name:?} is not a valid stream name"
        )));
    }
    Ok(name.to_string())
}

/// Direct gets kept in flight per pull.
const PULL_CONCURRENCY: usize = 32;

/// Stream sequences covering `limit` messages from `offset`, or `None` when
/// the offset is at or past the end. Offsets are `sequence - 1`; anything
/// below the oldest retained message has been purged and is rejected.
fn pull_range(
    first_sequence: u64,
    last_sequence: u64,
    offset: i64,
    limit: usize,
) -> Result<Option<RangeInclusive<u64>>, TransportError> {
    let min = first_sequence.saturating_sub(1) as i64;
    if offset < 0 || offset < min {
        return Err(TransportError::InvalidOffset(offset));
    }
    let first = offset as u64 + 1;
    let end = last_sequence.min(first.saturating_add(limit as u64).saturating_sub(1));
    Ok((first <= end).then_some(first..=end))
}

impl NatsClient {
    async fn stream(&self, name: &str) -> Result<stream::Stream, TransportError> {
        self.js.get_stream(name).await.map_err(|e| match e.kind() {
            GetStreamErrorKind::JetStream(source)
                if source.error_code() == ErrorCode::STREAM_NOT_FOUND =>
            {
                TransportError::TopicNotFound
            }
            _ => TransportError::Other(e.to_string()),
        })
    }

    async fn append_one(&self, name: &str, payload: Bytes) -> Result<(), TransportError> {
        self.js
            .publish(name.to_string(), payload)
            .await
            .map_err(|e| TransportError::Append(e.to_string()))?
            .await
            .map_err(|e| TransportError::Append(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TopicClient for NatsClient {
    async fn create_topic(&self, topic: &[u8]) -> Result<(), TransportError> {
        let name = stream_name(topic)?;
        match self.stream(&name).await {
            Ok(_) => return Err(TransportError::TopicExists),
            Err(TransportError::TopicNotFound) => {}
            Err(e) => return Err(e),
        }
        self.js
            .create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![name],
                allow_direct: true,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(())
    }

    async fn delete_topic(&self, topic: &[u8]) -> Result<(), TransportError> {
        let name = stream_name(topic)?;
        self.stream(&name).await?;
        self.js
            .delete_stream(&name)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(())
    }

    async fn list_topics(&self, filter: &TopicFilter) -> Result<Vec<Topic>, TransportError> {
        let mut names: Vec<String> = self
            .js
            .stream_names()
            .try_collect()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        names.sort();
        Ok(names
            .into_iter()
            .map(Bytes::from)
            .filter(|t| filter.matches(t))
            .collect())
    }

    async fn offsets(&self, topic: &[u8]) -> Result<(i64, i64), TransportError> {
        let name = stream_name(topic)?;
        let stream = self.stream(&name).await?;
        let state = &stream.cached_info().state;
        let min = state.first_sequence.saturating_sub(1) as i64;
        let max = state.last_sequence as i64;
        Ok((min, max.max(min)))
    }

    async fn append(&self, topic: &[u8], payload: Bytes) -> Result<(), TransportError> {
        let name = stream_name(topic)?;
        self.append_one(&name, payload).await
    }

    async fn append_stream(
        &self,
        topic: &[u8],
        pipe: flume::Receiver<ProduceMsg>,
    ) -> Result<(), TransportError> {
        let subject = stream_name(topic)?;
        let js = &self.js;
        let client = &self.client;
        pipelined_append(pipe, move |msg| {
            let subject = subject.clone();
            async move {
                match js.publish(subject, msg).await {
                    Ok(ack) => Ok(async move {
                        ack.await
                            .map(|_| ())
                            .map_err(|e| TransportError::Append(e.to_string()))
                    }),
                    Err(_) if client.connection_state() == State::Disconnected => {
                        Err(TransportError::Disconnected)
                    }
                    Err(e) => Err(TransportError::Append(e.to_string())),
                }
            }
        })
        .await
    }

    async fn pull(
        &self,
        topic: &[u8],
        offset: i64,
        limit: usize,
        buf: &mut Vec<Bytes>,
    ) -> Result<usize, TransportError> {
        buf.clear();
        let name = stream_name(topic)?;
        let stream = self.stream(&name).await?;
        let state = &stream.cached_info().state;
        let Some(seqs) = pull_range(state.first_sequence, state.last_sequence, offset, limit)?
        else {
            return Ok(0);
        };
        let stream = &stream;
        let messages: Vec<Bytes> = futures::stream::iter(seqs)
            .map(move |seq| async move {
                stream
                    .direct_get(seq)
                    .await
                    .map(|m| m.payload)
                    .map_err(|e| TransportError::Pull(e.to_string()))
            })
            .buffered(PULL_CONCURRENCY)
            .try_collect()
            .await?;
        buf.extend(messages);
        Ok(buf.len())
    }

    async fn subscribe(&self, topic: &[u8]) -> Result<Box<dyn Subscription>, TransportError> {
        let name = stream_name(topic)?;
        let mut subscriber = self
            .client
            .subscribe(name)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let notify = Arc::new(Notify::new());
        let forward = notify.clone();
        let handle = tokio::spawn(async move {
            while subscriber.next().await.is_some() {
                forward.notify_one();
            }
        });
        Ok(Box::new(NatsSubscription {
            notify,
            handle: Some(handle),
        }))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

struct NatsSubscription {
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl Subscription for NatsSubscription {
    async fn changed(&mut self) -> Result<(), TransportError> {
        match &self.handle {
            Some(h) if !h.is_finished() => {
                self.notify.notified().await;
                Ok(())
            }
            _ => Err(TransportError::Disconnected),
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        // Dropping the subscriber inside the task unsubscribes on the server.
        if let Some(h) = self.handle.take() {
            h.abort();
        }
        Ok(())
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}
