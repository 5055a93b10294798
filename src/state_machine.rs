use thiserror::Error;

use crate::task_store::TaskStatus;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from:?} to {to:?}")]
    Invalid { from: TaskStatus, to: TaskStatus },
}

/// The task lifecycle guard rules from SPEC_FULL.md §4.2, generalizing the
/// teacher's `ProcessingStatus::mark_*`/`should_retry`/`is_final_state` idiom
/// (`events/types.rs`) into a single validated transition function instead of
/// scattering guard checks across call sites.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    use TaskStatus::*;

    let allowed = match (from, to) {
        (Queued, Downloading) => true,
        (Downloading, Completed) => true, // sec-transfer shortcut
        (Downloading, Downloaded) => true,
        (Downloading, Failed) => true,
        (Downloading, Cancelled) => true,
        (Downloaded, Uploading) => true,
        (Uploading, Completed) => true,
        (Uploading, Failed) => true,
        (Uploading, Cancelled) => true,
        // A row already in a terminal state never transitions further; this is
        // not an error, callers should simply no-op (see
        // `Task::is_final_state` usage in `scheduler`).
        _ if from.is_terminal() => false,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}

pub fn is_final_state(status: TaskStatus) -> bool {
    status.is_terminal()
}

/// Whether a worker that just failed should retry the task rather than mark it
/// permanently failed. Used by the in-place retry loops in
/// `scheduler::download_body`/`upload_body`, bounded by
/// `SchedulerConfig::max_task_retries`, matching the teacher's
/// `Event::should_retry(max_retries)` shape.
pub fn should_retry(attempts: u32, max_retries: u32) -> bool {
    attempts < max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn test_queued_to_downloading_allowed() {
        assert!(validate_transition(Queued, Downloading).is_ok());
    }

    #[test]
    fn test_sec_transfer_shortcut_allowed() {
        assert!(validate_transition(Downloading, Completed).is_ok());
    }

    #[test]
    fn test_terminal_states_reject_further_transitions() {
        assert!(validate_transition(Completed, Downloading).is_err());
        assert!(validate_transition(Failed, Uploading).is_err());
        assert!(validate_transition(Cancelled, Completed).is_err());
    }

    #[test]
    fn test_skip_from_queued_to_uploading_rejected() {
        assert!(validate_transition(Queued, Uploading).is_err());
    }

    #[test]
    fn test_should_retry_respects_max() {
        assert!(should_retry(0, 3));
        assert!(!should_retry(3, 3));
    }
}
