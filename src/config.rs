//! Run configuration, built once and handed to every worker by reference.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::transport::config::parse_engine;
use crate::transport::{ConnectOptions, EngineFactory};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid type: {0:?}, valid options are producer, consumer, or paired")]
    InvalidTopology(String),
    #[error("{0} must be at least 1")]
    NonPositive(&'static str),
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("start offset must be -1 (newest) or non-negative, got {0}")]
    InvalidStartOffset(i64),
    #[error("unknown engine: {0:?}")]
    UnknownEngine(String),
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Which workers one unit of work spawns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Producer,
    Consumer,
    /// One producer and one consumer on the same topic.
    Paired,
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "producer" => Ok(Self::Producer),
            "consumer" => Ok(Self::Consumer),
            "paired" | "prodcon" => Ok(Self::Paired),
            other => Err(ConfigError::InvalidTopology(other.to_string())),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Paired => "paired",
        })
    }
}

/// Start the consumer at the newest available message.
pub const NEWEST_OFFSET: i64 = -1;

#[derive(Clone, Debug)]
pub struct LoadConfig {
    pub workers: usize,
    pub topology: Topology,
    /// Shared by every unit of work when set; otherwise each unit gets a fresh UUID.
    pub topic: Option<Bytes>,
    /// Producer in-flight window and consumer pull size.
    pub batch_size: usize,
    pub payload_size: usize,
    pub duration: Duration,
    /// Zero runs unpaced.
    pub pacing: Duration,
    pub follow: bool,
    pub start_offset: i64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            topology: Topology::Paired,
            topic: None,
            batch_size: 100,
            payload_size: 100,
            duration: Duration::from_secs(30),
            pacing: Duration::ZERO,
            follow: false,
            start_offset: 0,
        }
    }
}

impl LoadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NonPositive("worker count"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive("batch size"));
        }
        // The trailing delimiter needs at least one byte.
        if self.payload_size == 0 {
            return Err(ConfigError::NonPositive("payload size"));
        }
        if self.topic.as_ref().is_some_and(|t| t.is_empty()) {
            return Err(ConfigError::EmptyTopic);
        }
        if self.start_offset < NEWEST_OFFSET {
            return Err(ConfigError::InvalidStartOffset(self.start_offset));
        }
        Ok(())
    }

    /// Treats an empty topic string as "generate one per unit of work".
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = (!topic.is_empty()).then(|| Bytes::copy_from_slice(topic.as_bytes()));
        self
    }
}

/// How to reach the topic service. Loadable from YAML:
///
/// ```yaml
/// engine: nats
/// params:
///   url: nats://127.0.0.1:4222
/// verbose: true
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    pub engine: String,
    pub params: BTreeMap<String, String>,
    pub verbose: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            engine: "memory".into(),
            params: BTreeMap::new(),
            verbose: false,
        }
    }
}

impl ClientSettings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Command-line values win over file values.
    pub fn merge(mut self, engine: Option<String>, params: ConnectOptions, verbose: bool) -> Self {
        if let Some(engine) = engine {
            self.engine = engine;
        }
        self.params.extend(params.params);
        self.verbose |= verbose;
        self
    }

    pub fn factory(&self) -> Result<EngineFactory, ConfigError> {
        let engine = parse_engine(&self.engine)
            .ok_or_else(|| ConfigError::UnknownEngine(self.engine.clone()))?;
        Ok(EngineFactory {
            engine,
            opts: ConnectOptions {
                params: self.params.clone(),
            },
        })
    }
}
