//! Outcome of tearing a VM down.

use serde::Serialize;
use std::fmt;

/// One cleanup step of VM deletion, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    DisconnectSsh,
    Shutdown,
    KillProcess,
    RemoveSocket,
    RemoveRootfs,
    DeleteTap,
    ReleaseIp,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DisconnectSsh => "disconnect SSH",
            Self::Shutdown => "guest shutdown",
            Self::KillProcess => "kill hypervisor",
            Self::RemoveSocket => "remove socket",
            Self::RemoveRootfs => "remove rootfs",
            Self::DeleteTap => "delete TAP",
            Self::ReleaseIp => "release IP",
        };
        f.write_str(name)
    }
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: TeardownStep,
    /// `None` when the step succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every step attempted during a teardown and how it went.
///
/// Teardown never stops early; a failed step is recorded here and the
/// next one runs anyway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub vm_id: String,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            steps: Vec::new(),
        }
    }

    /// Record the outcome of `step`, logging failures.
    pub fn record<E: fmt::Display>(&mut self, step: TeardownStep, result: Result<(), E>) {
        let error = match result {
            Ok(()) => {
                tracing::debug!(vm_id = %self.vm_id, %step, "Teardown step done");
                None
            }
            Err(e) => {
                tracing::warn!(vm_id = %self.vm_id, %step, error = %e, "Teardown step failed");
                Some(e.to_string())
            }
        };
        self.steps.push(StepOutcome { step, error });
    }

    /// Whether every attempted step succeeded.
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    /// Whether `step` was attempted.
    pub fn attempted(&self, step: TeardownStep) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}
