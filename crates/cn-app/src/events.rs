use crate::job::{JobId, JobStatus};

/// What a committed store mutation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    DraftReset,
    DraftUpdated,

    JobAppended(JobId),
    JobPatched {
        job_id: JobId,
        status: JobStatus,
    },
    HistoryMerged {
        added: usize,
    },
}

impl StoreEvent {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::JobAppended(id) | Self::JobPatched { job_id: id, .. } => Some(id),
            _ => None,
        }
    }
}
