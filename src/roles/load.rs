use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, LoadConfig, Topology};
use crate::metrics::report::{Role, WorkerReport};
use crate::output::OutputWriter;
use crate::roles::consumer::run_consumer;
use crate::roles::producer::run_producer;
use crate::transport::{ClientFactory, Topic, topic_display};

/// The explicit topic when one was configured, otherwise a fresh UUID.
fn unit_topic(cfg: &LoadConfig) -> Topic {
    cfg.topic
        .clone()
        .unwrap_or_else(|| Bytes::from(Uuid::new_v4().to_string()))
}

fn roles(topology: Topology) -> &'static [Role] {
    match topology {
        Topology::Producer => &[Role::Producer],
        Topology::Consumer => &[Role::Consumer],
        Topology::Paired => &[Role::Producer, Role::Consumer],
    }
}

fn spawn_worker(
    set: &mut JoinSet<WorkerReport>,
    role: Role,
    topic: Topic,
    cfg: Arc<LoadConfig>,
    factory: Arc<dyn ClientFactory>,
) {
    set.spawn(async move {
        // Every worker gets its own connection.
        let client = match factory.connect().await {
            Ok(c) => c,
            Err(e) => {
                let mut report = WorkerReport::new(role, topic_display(&topic));
                error!(topic = %report.topic, %role, error = %e, "unable to connect");
                report.failure = Some(format!("connect: {e}"));
                return report;
            }
        };
        let report = match role {
            Role::Producer => run_producer(client.clone(), topic, &cfg).await,
            Role::Consumer => run_consumer(client.clone(), topic, &cfg).await,
        };
        if let Err(e) = client.shutdown().await {
            debug!(topic = %report.topic, %role, error = %e, "client shutdown failed");
        }
        report
    });
}

/// Spawn `cfg.workers` units of work and wait for every worker to finish.
///
/// Configuration is checked before anything starts. After that no worker can
/// fail the run: each one logs its own trouble, and its report is written to
/// `out` as soon as it joins. Reports come back in completion order.
pub async fn run_load(
    cfg: &LoadConfig,
    factory: Arc<dyn ClientFactory>,
    out: &mut OutputWriter,
) -> Result<Vec<WorkerReport>, ConfigError> {
    cfg.validate()?;
    let shared = Arc::new(cfg.clone());

    let mut set = JoinSet::new();
    for _ in 0..cfg.workers {
        let topic = unit_topic(cfg);
        for &role in roles(cfg.topology) {
            spawn_worker(
                &mut set,
                role,
                topic.clone(),
                shared.clone(),
                factory.clone(),
            );
        }
    }
    info!(
        workers = set.len(),
        topology = %cfg.topology,
        duration = ?cfg.duration,
        "load started"
    );

    let mut reports = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => {
                if let Err(e) = out.write_report(&report) {
                    warn!(error = %e, "writing report failed");
                }
                reports.push(report);
            }
            Err(e) => error!(error = %e, "worker task failed"),
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::testing::ScriptedClient;
    use crate::transport::{TopicClient, TransportError};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn quick(topology: Topology, workers: usize) -> LoadConfig {
        LoadConfig {
            workers,
            topology,
            batch_size: 8,
            payload_size: 16,
            duration: Duration::from_millis(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn paired_without_topic_uses_distinct_topics() {
        let broker = MemoryBroker::new();
        let mut out = OutputWriter::new_stdout();
        let reports = run_load(&quick(Topology::Paired, 2), Arc::new(broker.clone()), &mut out)
            .await
            .unwrap();
        assert_eq!(reports.len(), 4);

        let topics: BTreeSet<&str> = reports.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics.len(), 2);
        for t in &topics {
            let roles: BTreeSet<String> = reports
                .iter()
                .filter(|r| r.topic == *t)
                .map(|r| r.role.to_string())
                .collect();
            assert_eq!(roles.len(), 2, "topic {t} should have a producer and a consumer");
            assert!(Uuid::parse_str(t).is_ok());
        }
    }

    #[tokio::test]
    async fn explicit_topic_is_shared() {
        let broker = MemoryBroker::new();
        let cfg = quick(Topology::Producer, 3).with_topic("shared");
        let mut out = OutputWriter::new_stdout();
        let reports = run_load(&cfg, Arc::new(broker.clone()), &mut out).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.topic == "shared" && r.role == Role::Producer));
        assert!(reports.iter().all(|r| r.failure.is_none()));
        let acked: u64 = reports.iter().map(|r| r.total).sum();
        let (_, max) = broker.client().offsets(b"shared").await.unwrap();
        assert!(acked <= max as u64);
    }

    #[tokio::test]
    async fn invalid_config_starts_nothing() {
        let broker = MemoryBroker::new();
        let cfg = LoadConfig {
            payload_size: 0,
            ..quick(Topology::Consumer, 2)
        };
        let mut out = OutputWriter::new_stdout();
        let err = run_load(&cfg, Arc::new(broker.clone()), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositive(_)));
        let all = crate::transport::TopicFilter::default();
        assert!(broker.client().list_topics(&all).await.unwrap().is_empty());
    }

    struct FlakyFactory {
        broker: MemoryBroker,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClientFactory for FlakyFactory {
        async fn connect(&self) -> Result<Arc<dyn TopicClient>, TransportError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                return Err(TransportError::Connect("refused".into()));
            }
            Ok(Arc::new(self.broker.client()))
        }
    }

    #[tokio::test]
    async fn one_failing_worker_does_not_stop_siblings() {
        let factory = Arc::new(FlakyFactory {
            broker: MemoryBroker::new(),
            calls: Default::default(),
        });
        let mut out = OutputWriter::new_stdout();
        let reports = run_load(&quick(Topology::Producer, 3), factory, &mut out)
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        let failed: Vec<_> = reports.iter().filter(|r| r.failure.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure.as_deref(), Some("connect: connect: refused"));
        assert!(reports.iter().filter(|r| r.failure.is_none()).all(|r| r.total > 0));
    }

    struct ScriptedFactory(Arc<ScriptedClient>);

    #[async_trait::async_trait]
    impl ClientFactory for ScriptedFactory {
        async fn connect(&self) -> Result<Arc<dyn TopicClient>, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn unrepresentable_duration_still_reports_every_worker() {
        let huge = humantime::parse_duration("300000000000years").unwrap();
        let producer_client = Arc::new(ScriptedClient::default());
        *producer_client.stream_failure.lock().unwrap() = Some(TransportError::Disconnected);
        let cfg = LoadConfig {
            duration: huge,
            ..quick(Topology::Producer, 1)
        };
        let mut out = OutputWriter::new_stdout();
        let reports = run_load(&cfg, Arc::new(ScriptedFactory(producer_client)), &mut out)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failure.as_deref(), Some("append stream: disconnected"));

        let consumer_client = Arc::new(ScriptedClient::with_pulls([3]));
        let cfg = LoadConfig {
            duration: huge,
            ..quick(Topology::Consumer, 1)
        };
        let reports = run_load(&cfg, Arc::new(ScriptedFactory(consumer_client)), &mut out)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total, 3);
    }

    #[tokio::test]
    async fn consumer_only_reports_end_of_data() {
        let client = Arc::new(ScriptedClient::with_pulls([5]));
        let cfg = LoadConfig {
            batch_size: 10,
            ..quick(Topology::Consumer, 1)
        };
        let mut out = OutputWriter::new_stdout();
        let reports = run_load(&cfg, Arc::new(ScriptedFactory(client)), &mut out)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total, 5);
        assert_eq!(reports[0].final_offset, Some(5));
    }
}
