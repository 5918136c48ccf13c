//! Data model shared across the registry, engine, store and API.
//!
//! Wire and persisted shapes use camelCase field names; that is the external
//! data format the frontend and existing `clusters.json` stores expect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::diagnose::Diagnosis;

/// A target machine reachable over SSH.
///
/// Nodes are value objects passed by clone; the engine records a discovered
/// hostname on its own copy during pre-flight but never mutates the caller's
/// list otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub ip: String,
    pub username: String,
    pub auth_secret: AuthSecret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Opaque credential: either a password or a PEM private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthSecret {
    Password(String),
    PrivateKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMode {
    #[default]
    Install,
    Scale,
    AddonOnly,
    Upgrade,
}

/// Named add-on flags, installed on the first master after networking settles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Addons {
    #[serde(default)]
    pub ingress: bool,
    #[serde(default)]
    pub monitoring: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub dashboard: bool,
}

impl Addons {
    pub fn any(&self) -> bool {
        self.ingress || self.monitoring || self.logging || self.dashboard
    }

    /// Selected add-on identifiers in installation order.
    pub fn selected(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.ingress {
            out.push("ingress");
        }
        if self.monitoring {
            out.push("monitoring");
        }
        if self.logging {
            out.push("logging");
        }
        if self.dashboard {
            out.push("dashboard");
        }
        out
    }
}

/// Everything a caller supplies to start an installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationRequest {
    pub cluster_name: String,
    pub k8s_version: String,
    pub network_plugin: String,
    pub master_nodes: Vec<Node>,
    #[serde(default)]
    pub worker_nodes: Vec<Node>,
    #[serde(default)]
    pub addons: Addons,
    #[serde(default)]
    pub mode: InstallMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_cluster_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstallationStatus {
    /// Terminal states are absorbing; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One tracked orchestration run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: String,
    #[serde(flatten)]
    pub request: InstallationRequest,
    pub status: InstallationStatus,
    pub progress: u8,
    pub current_step: String,
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_info: Option<ClusterDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Installation {
    pub fn new(id: String, request: InstallationRequest) -> Self {
        Self {
            id,
            request,
            status: InstallationStatus::Pending,
            progress: 0,
            current_step: String::new(),
            logs: Vec::new(),
            cluster_info: None,
            error: None,
            diagnosis: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// All nodes of the request, masters first.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = self.request.master_nodes.clone();
        nodes.extend(self.request.worker_nodes.iter().cloned());
        nodes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub name: String,
    pub ip: String,
    pub role: NodeRole,
    pub status: String,
}

/// Final result of a successful pipeline run.
///
/// `simulation_mode` is the authoritative marker distinguishing a synthetic
/// run from a real cluster; it is persisted alongside the cluster record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescriptor {
    pub name: String,
    pub version: String,
    pub nodes: Vec<ClusterNode>,
    pub node_count: usize,
    pub endpoint: String,
    pub simulation_mode: bool,
}

/// Persisted cluster record. Node credential fields are encrypted at rest;
/// identity for merge purposes is id match OR first-master address match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub cluster_name: String,
    pub k8s_version: String,
    pub network_plugin: String,
    pub master_nodes: Vec<Node>,
    #[serde(default)]
    pub worker_nodes: Vec<Node>,
    #[serde(default)]
    pub addons: Addons,
    pub status: String,
    pub endpoint: String,
    pub node_count: usize,
    #[serde(default)]
    pub simulation_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Point-in-time health sample of a persisted cluster, taken over SSH from
/// its first master. Synthetic for simulated clusters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub nodes: Vec<NodeHealth>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// One event on an installation's ordered stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Status {
        status: InstallationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        cluster_info: Option<ClusterDescriptor>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        diagnosis: Option<Diagnosis>,
    },
    Progress {
        progress: u8,
        step: String,
    },
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}
