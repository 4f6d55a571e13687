//! Background execution of user routines over session datasets.
mod pool;
mod routine;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::results::{ExperimentResult, ProcessedResult};

pub use pool::{JobEvent, JobHandle, JobInfo, WorkerPool, RETAINED_FINISHED};
pub use routine::{
    ExperimentFn, NativeModule, ProcessingFn, RoutineInputs, RoutineModule, SharedLibraryModule,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Processing,
    Experiment,
}

impl JobKind {
    /// Entry point a routine must export for this kind.
    pub fn entry_point(self) -> &'static str {
        match self {
            JobKind::Processing => "processing_function",
            JobKind::Experiment => "experiment_function",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Processing => f.write_str("processing"),
            JobKind::Experiment => f.write_str("experiment"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    /// Cancellation was asked for; the job has not stopped yet.
    CancelRequested,
    Succeeded,
    Failed(JobError),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

/// Cooperative cancellation flag shared with a running routine.
///
/// Routines are expected to check it between units of work. Nothing stops a
/// routine that ignores it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Raw flag for routines behind the C ABI.
    pub(crate) fn as_ptr(&self) -> *const bool {
        self.0.as_ptr() as *const bool
    }
}

/// What a successful job hands back to its requester.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutput {
    Processed(ProcessedResult),
    Experiment(ExperimentResult),
}
