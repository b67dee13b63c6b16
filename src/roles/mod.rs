pub mod consumer;
pub mod load;
pub mod producer;
pub mod topic;

use crate::transport::{TopicClient, TransportError};

/// Create `topic`, treating "already exists" as success.
pub async fn ensure_topic(client: &dyn TopicClient, topic: &[u8]) -> Result<(), TransportError> {
    match client.create_topic(topic).await {
        Err(e) if e.is_topic_exists() => Ok(()),
        other => other,
    }
}
