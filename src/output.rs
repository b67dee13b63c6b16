use crate::metrics::report::WorkerReport;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;

/// Where finished worker reports go. The summary line always reaches stdout;
/// the CSV variant also appends one row per worker.
pub enum OutputWriter {
    Csv(csv::Writer<File>),
    Stdout,
}

impl OutputWriter {
    pub fn new_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self::Csv(writer))
    }

    pub fn new_stdout() -> Self {
        Self::Stdout
    }

    pub fn write_report(&mut self, report: &WorkerReport) -> Result<()> {
        println!("{}", report.summary());
        if let Self::Csv(writer) = self {
            writer.serialize(report)?;
            // Flush so external tail/readers see progress promptly
            writer.flush()?;
        }
        Ok(())
    }
}
