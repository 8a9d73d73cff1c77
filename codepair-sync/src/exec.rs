//! Remote code execution against a Judge0-style sandbox.
//!
//! Submit the document, then poll the returned token until the sandbox
//! reports a terminal status or the poll budget runs out.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::MIN_TIMER_PERIOD;
use crate::error::SyncError;
use crate::language::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Queued or still running.
    Pending,
    Accepted,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
}

impl ExecutionStatus {
    /// Map a Judge0 status description. Unrecognized values count as pending.
    pub fn from_description(description: &str) -> Self {
        match description.trim() {
            "Accepted" => Self::Accepted,
            "Compilation Error" => Self::CompilationError,
            "Time Limit Exceeded" => Self::TimeLimitExceeded,
            "Memory Limit Exceeded" => Self::MemoryLimitExceeded,
            d if d.starts_with("Runtime Error") => Self::RuntimeError,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Opaque handle returned by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionToken(pub String);

impl SubmissionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ExecutionReport {
    pub fn pending() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            stdout: None,
            stderr: None,
        }
    }

    /// Text shown to the user for a finished run.
    pub fn output_text(&self) -> String {
        let non_empty = |s: &Option<String>| s.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        match self.status {
            ExecutionStatus::Accepted => non_empty(&self.stdout).unwrap_or_else(|| "No output".to_string()),
            ExecutionStatus::TimeLimitExceeded | ExecutionStatus::MemoryLimitExceeded => {
                "Code execution exceeded limits".to_string()
            }
            ExecutionStatus::CompilationError | ExecutionStatus::RuntimeError => non_empty(&self.stderr)
                .or_else(|| non_empty(&self.stdout))
                .unwrap_or_else(|| "Error executing code".to_string()),
            ExecutionStatus::Pending => "Running...".to_string(),
        }
    }
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn submit(&self, source: &str, language: Language) -> Result<SubmissionToken, SyncError>;

    async fn poll(&self, token: &SubmissionToken) -> Result<ExecutionReport, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 30,
        }
    }
}

/// Submit `source` and poll until the run reaches a terminal status.
pub async fn run_to_completion(
    sandbox: &dyn ExecutionSandbox,
    source: &str,
    language: Language,
    policy: &PollPolicy,
) -> Result<ExecutionReport, SyncError> {
    let token = sandbox.submit(source, language).await?;
    log::debug!("Submitted {language} run as {}", token.as_str());

    let period = policy.interval.max(MIN_TIMER_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for poll in 1..=policy.max_polls {
        ticker.tick().await;
        let report = sandbox.poll(&token).await?;
        if report.status.is_terminal() {
            log::debug!("Run {} finished after {poll} poll(s): {:?}", token.as_str(), report.status);
            return Ok(report);
        }
    }
    log::warn!("Run {} still pending after {} polls", token.as_str(), policy.max_polls);
    Err(SyncError::ExecutionStalled {
        polls: policy.max_polls,
    })
}
