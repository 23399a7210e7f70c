use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of one supervised process.
///
/// Within a single start/stop cycle the state is monotonic:
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`. A launch failure
/// falls back from `Starting` straight to `Stopped`; `Running` is never
/// reached without passing through `Starting` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessStatus, ProcessStatus),
}

#[derive(Default)]
pub struct StatusCell {
    pub status: ProcessStatus,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self.status, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped) // launch failure / immediate exit
                | (Starting, Stopping) // stop requested before the port showed up
                | (Running, Stopping)
                | (Running, Stopped) // crash observed without a stop request
                | (Stopping, Stopped)
        )
    }

    pub fn transition(&mut self, to: ProcessStatus) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Status transition: {:?} -> {:?}", self.status, to);
            self.status = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.status, to))
        }
    }
}
