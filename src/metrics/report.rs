use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        })
    }
}

/// What one worker did, written only by that worker and read after it joins.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerReport {
    pub role: Role,
    pub topic: String,
    /// Messages the service acknowledged (producer) or messages pulled (consumer).
    pub total: u64,
    pub errors: u64,
    /// Consumer only: offset after the last successful pull.
    pub final_offset: Option<i64>,
    #[serde(serialize_with = "ser_secs")]
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
    /// Why the worker stopped early, if it did.
    pub failure: Option<String>,
}

fn ser_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl WorkerReport {
    pub fn new(role: Role, topic: String) -> Self {
        Self {
            role,
            topic,
            total: 0,
            errors: 0,
            final_offset: None,
            elapsed: Duration::ZERO,
            finished_at: Utc::now(),
            failure: None,
        }
    }

    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.total as f64 / secs } else { 0.0 }
    }

    /// The one-line summary printed when the worker completes.
    pub fn summary(&self) -> String {
        let verb = match self.role {
            Role::Producer => "producing to",
            Role::Consumer => "consuming from",
        };
        let noun = match self.role {
            Role::Producer => "produced",
            Role::Consumer => "consumed",
        };
        let mut line = format!(
            "Finished {verb} {}, total {noun}: {} ({:.2} msg/s",
            self.topic,
            self.total,
            self.rate()
        );
        if self.errors > 0 {
            line.push_str(&format!(", errors: {}", self.errors));
        }
        line.push(')');
        if let Some(f) = &self.failure {
            line.push_str(&format!(" [stopped: {f}]"));
        }
        line
    }
}
