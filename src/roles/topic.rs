//! One-shot topic administration.

use std::io::Write;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::debug;

use crate::transport::{TopicClient, TopicFilter, topic_display};

pub async fn create(client: &dyn TopicClient, topic: &str) -> Result<()> {
    client
        .create_topic(topic.as_bytes())
        .await
        .with_context(|| format!("unable to create topic {topic:?}"))?;
    debug!(topic, "created topic");
    Ok(())
}

pub async fn delete(client: &dyn TopicClient, topic: &str) -> Result<()> {
    debug!(topic, "deleting topic");
    client
        .delete_topic(topic.as_bytes())
        .await
        .with_context(|| format!("unable to delete topic {topic:?}"))?;
    debug!(topic, "deleted topic");
    Ok(())
}

pub async fn list<W: Write>(client: &dyn TopicClient, filter: &TopicFilter, out: &mut W) -> Result<usize> {
    let topics = client
        .list_topics(filter)
        .await
        .context("unable to list topics")?;
    if topics.is_empty() {
        writeln!(out, "No topics found.")?;
        return Ok(0);
    }
    writeln!(out, "Found topics:")?;
    for t in &topics {
        writeln!(out, "\t{}", topic_display(t))?;
    }
    Ok(topics.len())
}

pub async fn offsets<W: Write>(client: &dyn TopicClient, topic: &str, out: &mut W) -> Result<(i64, i64)> {
    let (min, max) = client
        .offsets(topic.as_bytes())
        .await
        .with_context(|| format!("unable to get topic offsets for {topic:?}"))?;
    writeln!(out, "min: {min}, max: {max}")?;
    Ok((min, max))
}

/// Append each message in order, stopping at the first failure.
pub async fn produce(client: &dyn TopicClient, topic: &str, msgs: &[String]) -> Result<usize> {
    for (i, m) in msgs.iter().enumerate() {
        client
            .append(topic.as_bytes(), Bytes::copy_from_slice(m.as_bytes()))
            .await
            .with_context(|| format!("unable to produce message {} to {topic:?}", i + 1))?;
    }
    debug!(topic, count = msgs.len(), "produced");
    Ok(msgs.len())
}
