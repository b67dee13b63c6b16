use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

use crate::config::{LoadConfig, NEWEST_OFFSET};
use crate::metrics::report::{Role, WorkerReport};
use crate::payload::RECORD_DELIMITER;
use crate::rate::{Pacer, deadline_after};
use crate::roles::ensure_topic;
use crate::transport::{Subscription, Topic, TopicClient, TransportError, topic_display};

/// Turn a requested start offset into a concrete one; `-1` means the newest
/// available message (or the end of an empty topic). Offsets below the
/// oldest retained message start at that message.
pub async fn resolve_start(
    client: &dyn TopicClient,
    topic: &[u8],
    requested: i64,
) -> Result<i64, TransportError> {
    let (min, max) = client.offsets(topic).await?;
    if requested == NEWEST_OFFSET {
        return Ok(if max > min { max - 1 } else { max });
    }
    Ok(requested.max(min))
}

enum Stop {
    Deadline,
    EndOfData,
}

/// Sequential cursor over one topic.
struct Cursor {
    start: i64,
    offset: i64,
}

impl Cursor {
    fn advance(&mut self, n: usize) {
        self.offset += n as i64;
    }

    fn consumed(&self) -> u64 {
        (self.offset - self.start) as u64
    }
}

/// Pull batches from `topic` until the run deadline, advancing the offset by
/// exactly what each pull returned.
///
/// An empty pull ends the run unless `cfg.follow` is set, in which case the
/// worker parks on a subscription until the service reports a commit. The
/// subscription is released on every exit path.
pub async fn run_consumer(
    client: Arc<dyn TopicClient>,
    topic: Topic,
    cfg: &LoadConfig,
) -> WorkerReport {
    let name = topic_display(&topic);
    let mut report = WorkerReport::new(Role::Consumer, name.clone());
    let start = Instant::now();
    let deadline = deadline_after(start, cfg.duration);
    let client = client.as_ref();

    if let Err(e) = ensure_topic(client, &topic).await {
        error!(topic = %name, error = %e, "error creating topic");
        report.failure = Some(format!("create topic: {e}"));
        return finish(report, start);
    }

    let first = match resolve_start(client, &topic, cfg.start_offset).await {
        Ok(o) => o,
        Err(e) => {
            error!(topic = %name, error = %e, "could not resolve start offset");
            report.failure = Some(format!("offsets: {e}"));
            return finish(report, start);
        }
    };
    let mut cursor = Cursor {
        start: first,
        offset: first,
    };

    let mut subscription = if cfg.follow {
        match client.subscribe(&topic).await {
            Ok(s) => Some(s),
            Err(e) => {
                error!(topic = %name, error = %e, "subscribe failed");
                report.failure = Some(format!("subscribe: {e}"));
                return finish(report, start);
            }
        }
    } else {
        None
    };

    debug!(topic = %name, offset = first, follow = cfg.follow, "consuming");
    let outcome = consume(
        client,
        &topic,
        cfg,
        deadline,
        &mut subscription,
        &mut cursor,
    )
    .await;

    if let Some(mut s) = subscription.take() {
        if let Err(e) = s.shutdown().await {
            warn!(topic = %name, error = %e, "releasing subscription failed");
        }
    }

    report.total = cursor.consumed();
    report.final_offset = Some(cursor.offset);
    match outcome {
        Ok(Stop::Deadline) => debug!(topic = %name, "run duration elapsed"),
        Ok(Stop::EndOfData) => debug!(topic = %name, offset = cursor.offset, "end of data"),
        Err(e) => {
            error!(topic = %name, error = %e, "client consume error");
            report.errors += 1;
            report.failure = Some(e.to_string());
        }
    }
    finish(report, start)
}

async fn consume(
    client: &dyn TopicClient,
    topic: &[u8],
    cfg: &LoadConfig,
    deadline: Instant,
    subscription: &mut Option<Box<dyn Subscription>>,
    cursor: &mut Cursor,
) -> Result<Stop, TransportError> {
    let mut pacer = Pacer::new(cfg.pacing);
    let mut buf: Vec<Bytes> = Vec::with_capacity(cfg.batch_size);
    let expired = sleep_until(deadline);
    tokio::pin!(expired);

    loop {
        if Instant::now() >= deadline {
            return Ok(Stop::Deadline);
        }
        if pacer.is_paced() {
            tokio::select! {
                _ = &mut expired => return Ok(Stop::Deadline),
                _ = pacer.wait() => {}
            }
        }

        let n = client
            .pull(topic, cursor.offset, cfg.batch_size, &mut buf)
            .await?;
        cursor.advance(n);
        if n > 0 {
            continue;
        }

        match subscription.as_mut() {
            Some(sub) => {
                tokio::select! {
                    _ = &mut expired => return Ok(Stop::Deadline),
                    changed = sub.changed() => changed?,
                }
            }
            None => return Ok(Stop::EndOfData),
        }
    }
}

fn finish(mut report: WorkerReport, start: Instant) -> WorkerReport {
    report.elapsed = start.elapsed();
    report.finished_at = chrono::Utc::now();
    debug!(topic = %report.topic, total = report.total, "finished consuming");
    report
}

/// Options for printing a topic to a writer.
#[derive(Clone, Debug)]
pub struct TailOptions {
    pub offset: i64,
    pub limit: usize,
    pub follow: bool,
}

/// Print messages from `topic` to `out`, one per line. Without `follow` this
/// is a single pull; with it the call runs until the returned future is
/// dropped or the service fails. Returns the number of messages printed.
pub async fn tail<W: Write>(
    client: &dyn TopicClient,
    topic: &[u8],
    opts: &TailOptions,
    out: &mut W,
) -> anyhow::Result<u64> {
    let mut offset = resolve_start(client, topic, opts.offset).await?;
    let mut subscription = if opts.follow {
        Some(client.subscribe(topic).await?)
    } else {
        None
    };
    let result = tail_loop(client, topic, opts, &mut offset, &mut subscription, out).await;
    if let Some(mut s) = subscription {
        if let Err(e) = s.shutdown().await {
            warn!(topic = %topic_display(topic), error = %e, "releasing subscription failed");
        }
    }
    result
}

async fn tail_loop<W: Write>(
    client: &dyn TopicClient,
    topic: &[u8],
    opts: &TailOptions,
    offset: &mut i64,
    subscription: &mut Option<Box<dyn Subscription>>,
    out: &mut W,
) -> anyhow::Result<u64> {
    let mut buf = Vec::with_capacity(opts.limit);
    let mut printed = 0u64;
    loop {
        debug!(topic = %topic_display(topic), offset = *offset, "consuming");
        let n = client.pull(topic, *offset, opts.limit, &mut buf).await?;
        for msg in &buf {
            out.write_all(msg)?;
            if msg.last() != Some(&RECORD_DELIMITER) {
                out.write_all(&[RECORD_DELIMITER])?;
            }
        }
        out.flush()?;
        printed += n as u64;
        *offset += n as i64;
        let Some(sub) = subscription.as_mut() else {
            return Ok(printed);
        };
        if n == 0 {
            sub.changed().await?;
        }
    }
}
