use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinError;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, warn};

use crate::config::LoadConfig;
use crate::metrics::report::{Role, WorkerReport};
use crate::payload::synthesize;
use crate::rate::{Pacer, deadline_after};
use crate::roles::ensure_topic;
use crate::transport::{ProduceMsg, Topic, TopicClient, TransportError, topic_display};

type Outcome = Result<(), TransportError>;

/// One reusable position in the producer's in-flight window. Holds the
/// receiving end of the single-slot result channel for the message it tracks.
#[derive(Default)]
struct Slot {
    pending: Option<oneshot::Receiver<Outcome>>,
}

impl Slot {
    fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Non-blocking: take the outcome if it already arrived.
    fn try_settle(&mut self) -> Option<Outcome> {
        let rx = self.pending.as_mut()?;
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(TransportError::Disconnected),
        };
        self.pending = None;
        Some(outcome)
    }

    async fn settle(&mut self) -> Outcome {
        match self.pending.as_mut() {
            Some(rx) => {
                let outcome = rx.await.unwrap_or(Err(TransportError::Disconnected));
                self.pending = None;
                outcome
            }
            None => Ok(()),
        }
    }
}

struct Tally<'a> {
    topic: &'a str,
    acked: u64,
    errors: u64,
}

impl Tally<'_> {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Ok(()) => self.acked += 1,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "append failed");
                self.errors += 1;
            }
        }
    }
}

enum Stop {
    Deadline,
    Stream(Result<Outcome, JoinError>),
    PipeClosed,
}

/// Drive one topic with a continuous stream of synthesized messages until the
/// run deadline passes or the append stream dies.
///
/// At most `batch_size` messages are ever unacknowledged: each message is
/// tracked by a slot in a fixed window, and a slot is only reused once the
/// outcome of its previous message has been folded into the totals. Only
/// explicit acknowledgements count towards the total. Outcomes still in
/// flight when the worker stops are picked up by one last non-blocking pass
/// and otherwise dropped, so the total can under-report.
pub async fn run_producer(
    client: Arc<dyn TopicClient>,
    topic: Topic,
    cfg: &LoadConfig,
) -> WorkerReport {
    let name = topic_display(&topic);
    let mut report = WorkerReport::new(Role::Producer, name.clone());
    let start = Instant::now();
    let deadline = deadline_after(start, cfg.duration);

    if let Err(e) = ensure_topic(client.as_ref(), &topic).await {
        error!(topic = %name, error = %e, "error creating topic");
        report.failure = Some(format!("create topic: {e}"));
        return finish(report, start);
    }

    let msg = synthesize(cfg.payload_size);
    let (tx, rx) = flume::bounded::<ProduceMsg>(cfg.batch_size);
    let mut stream = {
        let client = client.clone();
        let topic = topic.clone();
        tokio::spawn(async move { client.append_stream(&topic, rx).await })
    };

    let mut slots: Vec<Slot> = (0..cfg.batch_size).map(|_| Slot::default()).collect();
    let mut tally = Tally {
        topic: &name,
        acked: 0,
        errors: 0,
    };
    let mut pacer = Pacer::new(cfg.pacing);
    let expired = sleep_until(deadline);
    tokio::pin!(expired);

    debug!(topic = %name, batch = cfg.batch_size, size = cfg.payload_size, "producing");
    let stop = 'run: loop {
        for slot in slots.iter_mut() {
            if pacer.is_paced() {
                tokio::select! {
                    _ = &mut expired => break 'run Stop::Deadline,
                    _ = pacer.wait() => {}
                }
            }

            if let Some(outcome) = slot.try_settle() {
                tally.record(outcome);
            }
            if slot.is_pending() {
                // Window is full; this slot's message must resolve first.
                tokio::select! {
                    _ = &mut expired => break 'run Stop::Deadline,
                    res = &mut stream => break 'run Stop::Stream(res),
                    outcome = slot.settle() => tally.record(outcome),
                }
            }

            let (result, pending) = oneshot::channel();
            let next = ProduceMsg {
                msg: msg.clone(),
                result,
            };
            tokio::select! {
                _ = &mut expired => break 'run Stop::Deadline,
                res = &mut stream => break 'run Stop::Stream(res),
                sent = tx.send_async(next) => match sent {
                    Ok(()) => slot.pending = Some(pending),
                    Err(_) => break 'run Stop::PipeClosed,
                },
            }
        }
    };

    for slot in slots.iter_mut() {
        if let Some(outcome) = slot.try_settle() {
            tally.record(outcome);
        }
    }
    report.total = tally.acked;
    report.errors = tally.errors;
    drop(tx);

    let stream_result = match stop {
        Stop::Deadline => {
            stream.abort();
            None
        }
        Stop::Stream(res) => Some(res),
        Stop::PipeClosed => Some(stream.await),
    };
    match stream_result {
        None => debug!(topic = %name, "run duration elapsed"),
        Some(Ok(Ok(()))) => {
            warn!(topic = %name, "append stream ended early");
            report.failure = Some("append stream ended".into());
        }
        Some(Ok(Err(e))) => {
            error!(topic = %name, error = %e, "append stream error");
            report.failure = Some(format!("append stream: {e}"));
        }
        Some(Err(e)) => {
            error!(topic = %name, error = %e, "append stream task failed");
            report.failure = Some(format!("append stream task: {e}"));
        }
    }
    finish(report, start)
}

fn finish(mut report: WorkerReport, start: Instant) -> WorkerReport {
    report.elapsed = start.elapsed();
    report.finished_at = chrono::Utc::now();
    debug!(topic = %report.topic, total = report.total, "finished producing");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::testing::ScriptedClient;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn cfg(batch_size: usize, duration_ms: u64) -> LoadConfig {
        LoadConfig {
            batch_size,
            payload_size: 16,
            duration: Duration::from_millis(duration_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn counts_only_acknowledged_messages() {
        let broker = MemoryBroker::new();
        let client = Arc::new(broker.client());
        let report = run_producer(client.clone(), Topic::from_static(b"p1"), &cfg(8, 50)).await;
        assert!(report.failure.is_none(), "{:?}", report.failure);
        assert!(report.total > 0);
        let (_, max) = client.offsets(b"p1").await.unwrap();
        // Anything committed but not yet drained is not counted.
        assert!(report.total <= max as u64);
        assert!(max as u64 - report.total <= 8 + 1);
    }

    #[tokio::test]
    async fn existing_topic_is_fine() {
        let client = Arc::new(ScriptedClient::default());
        client.create_topic(b"t").await.unwrap();
        let report = run_producer(client, Topic::from_static(b"t"), &cfg(4, 20)).await;
        assert!(report.failure.is_none());
        assert!(report.total > 0);
    }

    #[tokio::test]
    async fn create_failure_stops_only_this_worker() {
        let client = Arc::new(ScriptedClient::default());
        *client.create_error.lock().unwrap() = Some(TransportError::Other("denied".into()));
        let report = run_producer(client.clone(), Topic::from_static(b"t"), &cfg(4, 1_000)).await;
        assert_eq!(report.total, 0);
        assert_eq!(report.failure.as_deref(), Some("create topic: other: denied"));
        assert_eq!(client.streamed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unacknowledged_window_never_exceeds_batch() {
        let client = Arc::new(ScriptedClient::default());
        client.hold_acks.store(true, Ordering::SeqCst);
        let start = Instant::now();
        let report = run_producer(client.clone(), Topic::from_static(b"t"), &cfg(5, 100)).await;
        assert_eq!(client.streamed.load(Ordering::SeqCst), 5);
        assert_eq!(report.total, 0);
        assert!(report.failure.is_none());
        assert!(start.elapsed() < Duration::from_millis(100 + 200));
    }

    #[tokio::test]
    async fn per_message_errors_keep_the_worker_going() {
        let client = Arc::new(ScriptedClient::default());
        client.append_results.lock().unwrap().extend([
            Err(TransportError::Append("full".into())),
            Ok(()),
            Err(TransportError::Append("full".into())),
        ]);
        let report = run_producer(client.clone(), Topic::from_static(b"t"), &cfg(2, 50)).await;
        assert!(report.failure.is_none());
        assert_eq!(report.errors, 2);
        assert!(report.total >= 1);
    }

    #[tokio::test]
    async fn stream_failure_winds_down_early() {
        let client = Arc::new(ScriptedClient::default());
        *client.stream_failure.lock().unwrap() = Some(TransportError::Disconnected);
        let start = Instant::now();
        let report = run_producer(client, Topic::from_static(b"t"), &cfg(3, 5_000)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.total, 0);
        assert_eq!(report.failure.as_deref(), Some("append stream: disconnected"));
    }

    #[tokio::test]
    async fn pacing_caps_throughput() {
        let client = Arc::new(ScriptedClient::default());
        let cfg = LoadConfig {
            pacing: Duration::from_millis(20),
            ..cfg(4, 110)
        };
        let report = run_producer(client.clone(), Topic::from_static(b"t"), &cfg).await;
        // Ticks at 20, 40, 60, 80, 100ms.
        assert!(client.streamed.load(Ordering::SeqCst) <= 5);
        assert!(report.total <= 5);
    }

    #[tokio::test]
    async fn deadline_is_respected() {
        let broker = MemoryBroker::new();
        let start = Instant::now();
        let report =
            run_producer(Arc::new(broker.client()), Topic::from_static(b"d"), &cfg(16, 80)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(80 + 250), "{elapsed:?}");
        assert!(report.elapsed >= Duration::from_millis(80));
    }
}
