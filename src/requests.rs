//! Typed payloads for requests that carry more than a job id.

use serde::Serialize;
use serde_json::{json, Value};

use crate::events;

/// Slurm `time_limit` in the REST API's `{set, number}` form (minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeLimit {
    pub set: bool,
    pub number: u64,
}

impl TimeLimit {
    pub fn minutes(number: u64) -> Self {
        Self { set: true, number }
    }
}

/// SBATCH options sent as the `job` object of `submit_job`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<TimeLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ntasks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_per_task: Option<u32>,
    /// Memory per node, e.g. `4G`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitJob {
    pub name: String,
    pub script: String,
    /// Defaults server-side to the logged-in user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub job: JobOptions,
}

impl SubmitJob {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            username: None,
            job: JobOptions::default(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_options(mut self, job: JobOptions) -> Self {
        self.job = job;
        self
    }
}

pub fn job_id(job_id: &str) -> Value {
    json!({ "job_id": job_id })
}

pub fn job_output(job_id: &str, tail_lines: Option<u64>) -> Value {
    json!({
        "job_id": job_id,
        "tail_lines": tail_lines.unwrap_or(events::DEFAULT_TAIL_LINES),
    })
}

pub fn jobs_for_user(user: Option<&str>) -> Value {
    match user {
        Some(user) => json!({ "user": user }),
        None => Value::Null,
    }
}

pub fn metrics_history(hours: u32, downsample_minutes: u32) -> Value {
    json!({ "hours": hours, "downsample_minutes": downsample_minutes })
}

pub fn metrics_statistics(hours: u32) -> Value {
    json!({ "hours": hours })
}
