//! Research task tracking: the external-backend client and the poll
//! governor that rate-limits status checks against it.

pub mod client;
pub mod governor;

pub use client::{
    BackendError, HttpResearchBackend, Interaction, InteractionOutput, ResearchBackend,
};
pub use governor::{
    CheckResult, PollGovernor, ResearchTask, TaskStatus, TaskSummary, EMPTY_RESULT_PLACEHOLDER,
    INITIAL_WAIT_SECS, MIN_CHECK_INTERVAL_SECS, UNKNOWN_ERROR,
};
