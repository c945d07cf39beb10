// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid repair status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Job {job_id} is already {status}")]
    TerminalJob { job_id: String, status: String },

    #[error("Job {job_id} does not own range {range}")]
    RangeNotOwned { job_id: String, range: String },

    #[error("Job {job_id} cannot finish with {remaining} ranges remaining")]
    IncompleteJob { job_id: String, remaining: usize },

    #[error("Unknown repair status: {0}")]
    UnknownStatus(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
