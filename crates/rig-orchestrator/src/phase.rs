//! One service's position in the lifecycle state machine (spec §4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Published,
    WiringResolved,
    Prestart,
    Starting,
    Healthy,
    Init,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Published => "published",
            Phase::WiringResolved => "wiring_resolved",
            Phase::Prestart => "prestart",
            Phase::Starting => "starting",
            Phase::Healthy => "healthy",
            Phase::Init => "init",
            Phase::Ready => "ready",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
