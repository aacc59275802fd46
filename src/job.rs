use crate::analyzer::Script;
use crate::config::ResourceLimits;
use crate::errors::{Result, SandboxError};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one execution attempt.
///
/// ```text
/// Created -> Prepared -> Running -> {Completed, Failed, TimedOut} -> Cleaned
///                  \-> Failed (launch error)
/// ```
/// `Cleaned` is reachable from every other state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Prepared,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cleaned,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Cleaned, _) => false,
            (_, Cleaned) => true,
            (Created, Prepared) => true,
            (Prepared, Running) | (Prepared, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, TimedOut) => true,
            _ => false,
        }
    }

    /// Completed, Failed or TimedOut
    pub fn is_outcome(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::TimedOut)
    }
}

/// One sandboxed execution of an accepted script
#[derive(Debug)]
pub struct Job {
    id: JobId,
    script: Script,
    dataset: Option<Vec<u8>>,
    limits: ResourceLimits,
    state: JobState,
    outcome: Option<JobState>,
    history: Vec<JobState>,
    created_at: Instant,
}

impl Job {
    pub fn new(script: Script, dataset: Option<Vec<u8>>, limits: ResourceLimits) -> Self {
        Self {
            id: JobId::new(),
            script,
            dataset,
            limits,
            state: JobState::Created,
            outcome: None,
            history: vec![JobState::Created],
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn dataset(&self) -> Option<&[u8]> {
        self.dataset.as_deref()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The Completed/Failed/TimedOut state the job ended in, if it got that far
    pub fn outcome(&self) -> Option<JobState> {
        self.outcome
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("[JOB] {} {:?} -> {:?}", self.id, self.state, next);
        if next.is_outcome() {
            self.outcome = Some(next);
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Cleaned` from wherever the job is. No-op when already cleaned.
    pub fn mark_cleaned(&mut self) {
        if self.state != JobState::Cleaned {
            self.state = JobState::Cleaned;
            self.history.push(JobState::Cleaned);
        }
    }
}

/// Internal diagnostic record of a finished job; never returned to callers verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: Option<JobState>,
    pub history: Vec<JobState>,
    pub exit_code: Option<i64>,
    pub stderr_tail: String,
    pub elapsed_ms: u128,
    pub cleanup_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(Script::new("x = 1"), None, ResourceLimits::default())
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        job.transition(JobState::Prepared).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Completed).unwrap();
        job.mark_cleaned();

        assert_eq!(job.state(), JobState::Cleaned);
        assert_eq!(job.outcome(), Some(JobState::Completed));
        assert_eq!(
            job.history(),
            &[
                JobState::Created,
                JobState::Prepared,
                JobState::Running,
                JobState::Completed,
                JobState::Cleaned
            ]
        );
    }

    #[test]
    fn test_cannot_skip_preparation() {
        let mut job = job();
        let err = job.transition(JobState::Running).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::InvalidTransition {
                from: JobState::Created,
                to: JobState::Running
            }
        ));
        assert_eq!(job.state(), JobState::Created);
    }

    #[test]
    fn test_cleaned_reachable_from_every_state() {
        use JobState::*;
        for state in [Created, Prepared, Running, Completed, Failed, TimedOut] {
            assert!(state.can_transition_to(Cleaned), "{state:?}");
        }
        for state in [Created, Prepared, Running, Completed, Failed, TimedOut, Cleaned] {
            assert!(!Cleaned.can_transition_to(state));
        }
    }

    #[test]
    fn test_mark_cleaned_is_idempotent() {
        let mut job = job();
        job.mark_cleaned();
        job.mark_cleaned();
        assert_eq!(job.history(), &[JobState::Created, JobState::Cleaned]);
        assert_eq!(job.outcome(), None);
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(job().id(), job().id());
    }
}
