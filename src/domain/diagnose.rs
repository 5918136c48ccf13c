//! Failure-signature classification for remote script errors.
//!
//! A non-zero script exit surfaces here before reaching the caller: the tail
//! of the captured stderr is matched against known failure signatures and
//! turned into a [`Diagnosis`] with a suggested, potentially automatable fix.

use serde::{Deserialize, Serialize};

/// How many bytes of stderr tail are considered for classification.
const STDERR_WINDOW: usize = 500;

/// Structured classification of a remote failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub reason: String,
    pub message: String,
    pub suggested_fix: String,
    pub fix_action: FixAction,
}

/// Identifier naming an idempotent remote remediation routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    FixDpkgLock,
    FixSwapOff,
    FixKubeReset,
    RetryConnection,
    RetryStep,
}

impl FixAction {
    /// Parse a wire identifier; unknown identifiers are a caller-side no-op.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fix_dpkg_lock" => Some(Self::FixDpkgLock),
            "fix_swap_off" => Some(Self::FixSwapOff),
            "fix_kube_reset" => Some(Self::FixKubeReset),
            "retry_connection" => Some(Self::RetryConnection),
            "retry_step" => Some(Self::RetryStep),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixDpkgLock => "fix_dpkg_lock",
            Self::FixSwapOff => "fix_swap_off",
            Self::FixKubeReset => "fix_kube_reset",
            Self::RetryConnection => "retry_connection",
            Self::RetryStep => "retry_step",
        }
    }
}

impl std::fmt::Display for FixAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify captured stderr into a [`Diagnosis`].
///
/// Only the last [`STDERR_WINDOW`] bytes are inspected; earlier output is
/// usually routine package-manager chatter.
pub fn analyze(stderr: &str) -> Diagnosis {
    let tail_start = stderr.len().saturating_sub(STDERR_WINDOW);
    // Avoid slicing inside a UTF-8 sequence.
    let tail_start = (tail_start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(0);
    let tail = stderr[tail_start..].to_lowercase();

    if tail.contains("could not get lock") || tail.contains("resource temporarily unavailable") {
        return Diagnosis {
            reason: "Package Manager Locked".into(),
            message: "Another process is using apt/dpkg. This often happens if an auto-update is running in background.".into(),
            suggested_fix: "Kill background apt processes and remove lock files.".into(),
            fix_action: FixAction::FixDpkgLock,
        };
    }

    if tail.contains("running with swap on is not supported") {
        return Diagnosis {
            reason: "Swap Memory Enabled".into(),
            message: "Kubernetes requires swap memory to be disabled, but swap is currently active.".into(),
            suggested_fix: "Disable swap immediately.".into(),
            fix_action: FixAction::FixSwapOff,
        };
    }

    if tail.contains("port 6443 is already in use") || tail.contains("address already in use") {
        return Diagnosis {
            reason: "Port Conflict".into(),
            message: "Port 6443 is already in use. A previous partial installation might be running.".into(),
            suggested_fix: "Reset Kubernetes configuration and kill conflicting processes.".into(),
            fix_action: FixAction::FixKubeReset,
        };
    }

    if tail.contains("connection timed out") || tail.contains("connection refused") {
        return Diagnosis {
            reason: "Network Timeout".into(),
            message: "SSH or Network connection timed out. Firewall might be blocking keys.".into(),
            suggested_fix: "Retry connection and check Firewall settings.".into(),
            fix_action: FixAction::RetryConnection,
        };
    }

    Diagnosis {
        reason: "Unknown execution error".into(),
        message: "An unexpected script error occurred.".into(),
        suggested_fix: "Review logs and Retry Step.".into(),
        fix_action: FixAction::RetryStep,
    }
}
