//! Health status reported by gateway and runner.

use serde::{Deserialize, Serialize};

use crate::runnable::ProcessState;
use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Warm process not up yet
    #[default]
    Starting,
    /// Accepting calls
    Ready,
    /// Cannot serve calls (supervisor gone)
    Defunct,
}

impl From<ProcessState> for Health {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Running { .. } => Health::Ready,
            ProcessState::Starting | ProcessState::Dead { .. } => Health::Starting,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: Health,
    pub version: VersionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}
