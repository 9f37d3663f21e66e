//! File-based experiment tracking
//!
//! Each run gets its own directory under `<tracking_dir>/<experiment>/`
//! holding the run metadata, parameters, metrics and a copy of the model.

use crate::models::ensemble::TreeEnsemble;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Metadata written to `run.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Root of the run store
pub struct ExperimentTracker {
    root: PathBuf,
    experiment: String,
}

impl ExperimentTracker {
    pub fn new(root: impl Into<PathBuf>, experiment: &str) -> Self {
        Self {
            root: root.into(),
            experiment: experiment.to_string(),
        }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join(&self.experiment)
    }

    /// Create the directory for a new run
    pub fn start_run(&self) -> std::io::Result<TrackedRun> {
        let info = RunInfo {
            run_id: Uuid::new_v4().simple().to_string(),
            experiment: self.experiment.clone(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let dir = self.experiment_dir().join(&info.run_id);
        std::fs::create_dir_all(&dir)?;

        let run = TrackedRun {
            dir,
            info,
            params: Map::new(),
            metrics: Map::new(),
        };
        run.write_json("run.json", &run.info)?;
        info!(run_id = %run.info.run_id, experiment = %self.experiment, "Tracking run started");
        Ok(run)
    }
}

/// An open run; parameters and metrics are flushed on every log call
pub struct TrackedRun {
    dir: PathBuf,
    info: RunInfo,
    params: Map<String, Value>,
    metrics: Map<String, Value>,
}

impl TrackedRun {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_params<I, K, V>(&mut self, params: I) -> std::io::Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in params {
            self.params.insert(key.into(), value.into());
        }
        self.write_json("params.json", &self.params)
    }

    pub fn log_metric(&mut self, key: &str, value: f64) -> std::io::Result<()> {
        self.metrics.insert(key.to_string(), Value::from(value));
        self.write_json("metrics.json", &self.metrics)
    }

    pub fn log_model(&self, model: &TreeEnsemble) -> std::io::Result<()> {
        model.save(self.dir.join("model.json"))
    }

    /// Store any serializable artifact next to the run's metrics
    pub fn log_artifact<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<()> {
        self.write_json(name, value)
    }

    pub fn finish(mut self) -> std::io::Result<RunInfo> {
        self.info.finished_at = Some(Utc::now());
        self.write_json("run.json", &self.info)?;
        Ok(self.info)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(self.dir.join(name), json)
    }
}
