//! Precompute jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usage::ParameterCombination;

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not admitted before the cycle budget ran out; reconsidered next cycle
    Deferred,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One combination scheduled for precomputation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputeJob {
    pub id: Uuid,
    pub combination: ParameterCombination,
    /// Access count at scheduling time; higher runs first
    pub priority: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Cache key of the stored result
    pub result_key: Option<String>,
}

impl PrecomputeJob {
    pub fn new(combination: ParameterCombination) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: combination.access_count,
            combination,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result_key: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result_key: String) {
        self.status = JobStatus::Completed;
        self.result_key = Some(result_key);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_deferred(&mut self) {
        self.status = JobStatus::Deferred;
    }

    /// Wall time from start to completion
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
