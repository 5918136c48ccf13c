//! Automation Engine — the phased pipeline turning an installation request
//! into a running Kubernetes cluster.
//!
//! The engine owns no state between runs. It reports everything through a
//! single event channel (logs, progress, terminal outcome) and never panics
//! past its boundary; the registry on the other end decides what to record,
//! broadcast and persist. When the first master is unreachable the whole run
//! switches to simulation mode and emits a synthetic but structurally
//! complete event stream without touching any machine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::EngineConfig;
use crate::domain::diagnose::{analyze, Diagnosis, FixAction};
use crate::domain::types::{
    ClusterDescriptor, ClusterHealth, ClusterNode, InstallMode, InstallationRequest, LogLevel,
    Node, NodeHealth, NodeRole,
};
use crate::shell::{ExecResult, OutputStream, RemoteSession, RemoteShell, ShellError};

/// Everything the engine has to say about a run.
#[derive(Debug)]
pub enum EngineEvent {
    Log { level: LogLevel, message: String },
    Progress { progress: u8, step: String },
    Completed(ClusterDescriptor),
    Failed(InstallError),
}

/// Terminal failure of a pipeline run, optionally classified.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InstallError {
    pub message: String,
    pub diagnosis: Option<Diagnosis>,
}

impl InstallError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnosis: None,
        }
    }
}

impl From<ShellError> for InstallError {
    fn from(e: ShellError) -> Self {
        Self::new(e.to_string())
    }
}

pub struct AutomationEngine {
    shell: Arc<dyn RemoteShell>,
    config: EngineConfig,
}

impl AutomationEngine {
    pub fn new(shell: Arc<dyn RemoteShell>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { shell, config })
    }

    /// Run the full pipeline. All outcomes, including failure, are delivered
    /// through `events`; this function itself never errors.
    pub async fn run(&self, request: InstallationRequest, events: UnboundedSender<EngineEvent>) {
        let pipeline = Pipeline {
            engine: self,
            events: &events,
            masters: request.master_nodes.clone(),
            workers: request.worker_nodes.clone(),
            request: &request,
            simulation: false,
        };
        match pipeline.execute().await {
            Ok(descriptor) => {
                let _ = events.send(EngineEvent::Completed(descriptor));
            }
            Err(err) => {
                let _ = events.send(EngineEvent::Log {
                    level: LogLevel::Error,
                    message: format!("❌ Installation failed: {}", err.message),
                });
                let _ = events.send(EngineEvent::Failed(err));
            }
        }
    }

    /// Apply a named remediation routine on one node, reporting through `log`.
    pub async fn run_fix(
        &self,
        action: &str,
        node: &Node,
        log: &(dyn Fn(LogLevel, String) + Send + Sync),
    ) -> Result<()> {
        let mut session = self
            .shell
            .connect(node, Duration::from_secs(self.config.connect_timeout_secs))
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let (plan, done): (&[FixStep], &str) = match FixAction::parse(action) {
            Some(FixAction::FixDpkgLock) => (
                DPKG_LOCK_FIX,
                "✓ Package manager locks removed and database repaired.",
            ),
            Some(FixAction::FixSwapOff) => (SWAP_OFF_FIX, "✓ Swap disabled."),
            Some(FixAction::FixKubeReset) => (
                KUBE_RESET_FIX,
                "✓ Kubernetes state reset; node is ready for a clean install.",
            ),
            _ => {
                log(
                    LogLevel::Info,
                    format!("No automated fix for '{action}'; retry the step from the dashboard."),
                );
                session.close().await;
                return Ok(());
            }
        };

        log(
            LogLevel::Info,
            format!("Applying {action} on {}...", node.ip),
        );
        for step in plan {
            log(LogLevel::Info, format!("$ {}", step.command));
            let result = session
                .run(step.command, None)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            if result.exit_code != 0 && !step.ignore_failure {
                log(
                    LogLevel::Error,
                    format!(
                        "Fix command failed ({}): {}",
                        result.exit_code,
                        result.stderr.trim()
                    ),
                );
                session.close().await;
                anyhow::bail!(
                    "fix command '{}' exited with {}",
                    step.command,
                    result.exit_code
                );
            }
        }
        session.close().await;
        log(LogLevel::Success, done.to_string());
        Ok(())
    }

    /// Read the admin kubeconfig from a cluster's first master.
    pub async fn fetch_kubeconfig(&self, master: &Node) -> Result<String> {
        let mut session = self
            .shell
            .connect(master, Duration::from_secs(self.config.connect_timeout_secs))
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let result = session
            .run("sudo cat /etc/kubernetes/admin.conf", None)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"));
        session.close().await;
        let result = result?;
        if result.stdout.trim().is_empty() {
            anyhow::bail!("reading kubeconfig: {}", result.stderr.trim());
        }
        Ok(result.stdout)
    }

    /// Sample resource usage and node readiness on a cluster's first master.
    /// An empty node list means kubectl had nothing to say; the caller falls
    /// back to the stored topology.
    pub async fn probe_health(&self, master: &Node) -> Result<ClusterHealth> {
        let mut session = self
            .shell
            .connect(master, Duration::from_secs(self.config.connect_timeout_secs))
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let cpu = session
            .run("top -bn1 | grep 'Cpu(s)' | awk '{print $2 + $4}'", None)
            .await;
        let ram = session
            .run(r#"free -m | awk 'NR==2{printf "%.2f", $3*100/$2 }'"#, None)
            .await;
        let disk = session
            .run("df -h / | awk 'NR==2 {print $5}' | sed 's/%//'", None)
            .await;
        let nodes = session
            .run(
                "export KUBECONFIG=/etc/kubernetes/admin.conf; \
                 kubectl get nodes --no-headers | awk '{print $1,$2}'",
                None,
            )
            .await;
        session.close().await;

        let parse = |r: Result<ExecResult, ShellError>| {
            r.ok()
                .and_then(|r| r.stdout.trim().parse().ok())
                .unwrap_or(0.0)
        };
        let nodes = nodes
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some(NodeHealth {
                    name: parts.next()?.to_string(),
                    status: parts.next().unwrap_or("Unknown").to_string(),
                    ip: None,
                })
            })
            .collect();

        Ok(ClusterHealth {
            cpu: parse(cpu),
            ram: parse(ram),
            disk: parse(disk),
            nodes,
            timestamp: Utc::now(),
        })
    }
}

/// One command of a remediation routine. Cleanup-style steps tolerate
/// failure (the lock file may simply not exist); repair steps do not.
struct FixStep {
    command: &'static str,
    ignore_failure: bool,
}

const DPKG_LOCK_FIX: &[FixStep] = &[
    FixStep {
        command: "sudo killall apt apt-get",
        ignore_failure: true,
    },
    FixStep {
        command: "sudo rm -f /var/lib/apt/lists/lock /var/cache/apt/archives/lock /var/lib/dpkg/lock*",
        ignore_failure: true,
    },
    FixStep {
        command: "sudo dpkg --configure -a",
        ignore_failure: false,
    },
];

const SWAP_OFF_FIX: &[FixStep] = &[
    FixStep {
        command: "sudo swapoff -a",
        ignore_failure: false,
    },
    FixStep {
        command: r"sudo sed -i '/ swap / s/^\(.*\)$/#\1/g' /etc/fstab",
        ignore_failure: true,
    },
];

const KUBE_RESET_FIX: &[FixStep] = &[
    FixStep {
        command: "sudo kubeadm reset -f",
        ignore_failure: true,
    },
    FixStep {
        command: "sudo rm -rf /etc/cni/net.d $HOME/.kube/config",
        ignore_failure: true,
    },
];

/// Join artifacts read back from the first master after control plane setup.
struct JoinData {
    join_command: String,
    cert_key: String,
}

struct Pipeline<'a> {
    engine: &'a AutomationEngine,
    events: &'a UnboundedSender<EngineEvent>,
    request: &'a InstallationRequest,
    // Engine-local copies; pre-flight records discovered hostnames here.
    masters: Vec<Node>,
    workers: Vec<Node>,
    simulation: bool,
}

impl Pipeline<'_> {
    async fn execute(mut self) -> Result<ClusterDescriptor, InstallError> {
        if self.masters.is_empty() {
            return Err(InstallError::new("at least one master node is required"));
        }
        let scale = self.request.mode == InstallMode::Scale;

        self.log(
            LogLevel::Info,
            format!(
                "🚀 Starting Kubernetes installation for cluster '{}'",
                self.request.cluster_name
            ),
        );
        self.progress(0, "Checking environment...");

        self.simulation = !self.probe().await;
        if self.simulation {
            return self.simulate().await;
        }

        self.progress(5, "Checking node connectivity...");
        self.check_connectivity().await?;

        self.progress(8, "Running pre-flight checks...");
        self.preflight().await?;

        self.progress(12, "Synchronizing hostnames, kernel and clocks...");
        self.sync_hosts().await?;

        self.progress(15, "Configuring firewalls...");
        self.configure_firewalls().await?;

        self.progress(20, "Installing container runtime...");
        self.install_runtime(scale).await?;

        self.progress(35, "Installing Kubernetes components...");
        self.install_kubernetes(scale).await?;

        self.progress(
            50,
            if scale {
                "Preparing cluster for expansion..."
            } else {
                "Initializing Kubernetes control plane..."
            },
        );
        let join = self.control_plane(scale).await?;

        self.progress(65, "Deploying network plugin...");
        self.install_network(scale).await?;

        self.progress(75, "Joining nodes to the cluster...");
        self.join_nodes(&join).await?;

        self.progress(85, "Installing addons...");
        self.install_addons(scale).await?;

        self.progress(95, "Validating cluster health...");
        self.validate().await;

        self.progress(100, "Installation complete");
        Ok(self.descriptor())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.events.send(EngineEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn progress(&self, progress: u8, step: &str) {
        let _ = self.events.send(EngineEvent::Progress {
            progress,
            step: step.to_string(),
        });
    }

    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>, InstallError> {
        Ok(self
            .engine
            .shell
            .connect(
                node,
                Duration::from_secs(self.engine.config.connect_timeout_secs),
            )
            .await?)
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.masters.iter().chain(self.workers.iter())
    }

    /// Nodes a per-node install phase targets. In scale mode the first
    /// master already runs the cluster and is left alone.
    fn target_nodes(&self, skip_bridge: bool) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .masters
            .iter()
            .enumerate()
            .filter(|(i, _)| !(skip_bridge && *i == 0))
            .map(|(_, n)| n)
            .collect();
        nodes.extend(self.workers.iter());
        nodes
    }

    /// Probe the first master. An unreachable first master flips the whole
    /// run into simulation mode instead of failing it.
    async fn probe(&self) -> bool {
        let first = &self.masters[0];
        self.log(
            LogLevel::Info,
            format!("Testing connectivity to {}...", first.ip),
        );
        match self.connect(first).await {
            Ok(mut session) => {
                session.close().await;
                true
            }
            Err(e) => {
                self.log(
                    LogLevel::Warning,
                    format!("⚠️ Cannot reach {}: {}", first.ip, e.message),
                );
                self.log(
                    LogLevel::Warning,
                    "Switching to simulation mode. No machines will be modified.",
                );
                false
            }
        }
    }

    /// Synthetic run: same phases, same progress milestones, no sessions.
    async fn simulate(mut self) -> Result<ClusterDescriptor, InstallError> {
        let pace = Duration::from_millis(self.engine.config.simulation_step_ms);
        let phases: &[(u8, &str, &str)] = &[
            (5, "Checking node connectivity...", "All nodes reachable"),
            (8, "Running pre-flight checks...", "Pre-flight checks passed on all nodes"),
            (12, "Synchronizing hostnames, kernel and clocks...", "Hostnames, kernel modules and clocks synchronized"),
            (15, "Configuring firewalls...", "Firewall rules applied"),
            (20, "Installing container runtime...", "containerd installed on all nodes"),
            (35, "Installing Kubernetes components...", "kubeadm, kubelet and kubectl installed"),
            (50, "Initializing Kubernetes control plane...", "Control plane initialized"),
            (65, "Deploying network plugin...", "Network plugin deployed"),
            (75, "Joining nodes to the cluster...", "All nodes joined the cluster"),
            (85, "Installing addons...", "Selected addons installed"),
            (95, "Validating cluster health...", "All nodes report Ready"),
        ];
        for (progress, step, message) in phases {
            self.progress(*progress, step);
            self.log(LogLevel::Info, format!("[SIMULATION] {message}"));
            tokio::time::sleep(pace).await;
        }
        for node in self.masters.iter_mut().chain(self.workers.iter_mut()) {
            node.hostname = Some(default_hostname(&node.ip));
        }
        self.progress(100, "Installation complete");
        self.log(
            LogLevel::Success,
            "[SIMULATION] Cluster created in simulation mode; no machines were modified.",
        );
        Ok(self.descriptor())
    }

    async fn check_connectivity(&self) -> Result<(), InstallError> {
        let checks = self
            .masters
            .iter()
            .map(|n| self.check_node("master", n))
            .chain(self.workers.iter().map(|n| self.check_node("worker", n)));
        for result in join_all(checks).await {
            result?;
        }
        Ok(())
    }

    async fn check_node(&self, role: &'static str, node: &Node) -> Result<(), InstallError> {
        let mut session = self.connect(node).await.map_err(|e| {
            InstallError::new(format!(
                "Failed to connect to {role} node {}: {}",
                node.ip, e.message
            ))
        })?;
        let os = session.run("cat /etc/os-release", None).await?;
        let distro = os
            .stdout
            .lines()
            .find_map(|l| l.strip_prefix("ID="))
            .unwrap_or("unknown")
            .trim_matches('"');
        self.log(
            LogLevel::Success,
            format!("✓ Connected to {role} node {} ({distro})", node.ip),
        );
        session.close().await;
        Ok(())
    }

    /// Sequential on purpose: discovered hostnames feed the host table built
    /// in the next phase.
    async fn preflight(&mut self) -> Result<(), InstallError> {
        for i in 0..self.masters.len() {
            let node = self.masters[i].clone();
            let hostname = self.preflight_node(&node).await?;
            self.masters[i].hostname = Some(hostname);
        }
        for i in 0..self.workers.len() {
            let node = self.workers[i].clone();
            let hostname = self.preflight_node(&node).await?;
            self.workers[i].hostname = Some(hostname);
        }
        Ok(())
    }

    async fn preflight_node(&self, node: &Node) -> Result<String, InstallError> {
        let mut session = self.connect(node).await?;
        let hostname = session.run("hostname", None).await?.stdout.trim().to_string();
        self.execute_script(&mut session, "preflight-checks.sh", &[])
            .await?;
        self.log(
            LogLevel::Success,
            format!("✓ Pre-flight checks passed on {}", node.ip),
        );
        session.close().await;
        Ok(if hostname.is_empty() {
            default_hostname(&node.ip)
        } else {
            hostname
        })
    }

    /// Host table, kernel modules, sysctl, SELinux and clock sync on every
    /// node, using the first master's clock as the reference.
    async fn sync_hosts(&self) -> Result<(), InstallError> {
        let mut session = self.connect(&self.masters[0]).await?;
        let reference_time = session
            .run(r#"date +"%m%d%H%M%Y.%S""#, None)
            .await?
            .stdout
            .trim()
            .to_string();
        session.close().await;

        let hosts_block = self
            .nodes()
            .map(|n| {
                format!(
                    "{} {} # kubeforge managed",
                    n.ip,
                    n.hostname.clone().unwrap_or_else(|| default_hostname(&n.ip))
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        for node in self.nodes() {
            let hostname = node
                .hostname
                .clone()
                .unwrap_or_else(|| default_hostname(&node.ip));
            // The managed block is stripped before re-appending so repeated
            // runs and retries do not accumulate duplicate entries.
            let command = format!(
                "sudo hostnamectl set-hostname {hostname} && \
                 sudo sed -i '/# kubeforge managed/d' /etc/hosts && \
                 printf '%s\n' '{hosts_block}' | sudo tee -a /etc/hosts > /dev/null && \
                 sudo modprobe overlay && sudo modprobe br_netfilter && \
                 printf 'net.bridge.bridge-nf-call-iptables = 1\nnet.bridge.bridge-nf-call-ip6tables = 1\nnet.ipv4.ip_forward = 1\n' | sudo tee /etc/sysctl.d/k8s.conf > /dev/null && \
                 sudo sysctl --system > /dev/null 2>&1 && \
                 sudo setenforce 0 2>/dev/null; \
                 sudo date {reference_time} > /dev/null 2>&1; true"
            );
            let mut session = self.connect(node).await?;
            session.run(&command, None).await?;
            session.close().await;
        }
        self.log(
            LogLevel::Success,
            "✓ Hostnames, kernel modules and clocks synchronized",
        );
        Ok(())
    }

    async fn configure_firewalls(&self) -> Result<(), InstallError> {
        let tasks = self
            .masters
            .iter()
            .map(|n| self.firewall_node(n, "master"))
            .chain(self.workers.iter().map(|n| self.firewall_node(n, "worker")));
        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn firewall_node(&self, node: &Node, role: &'static str) -> Result<(), InstallError> {
        let mut session = self.connect(node).await?;
        self.execute_script(&mut session, "configure-firewall.sh", &[role])
            .await?;
        self.log(
            LogLevel::Success,
            format!("✓ Firewall configured on {}", node.ip),
        );
        session.close().await;
        Ok(())
    }

    async fn install_runtime(&self, scale: bool) -> Result<(), InstallError> {
        let tasks = self
            .target_nodes(scale)
            .into_iter()
            .map(|n| self.runtime_node(n));
        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn runtime_node(&self, node: &Node) -> Result<(), InstallError> {
        let mut session = self.connect(node).await?;
        self.execute_script(&mut session, "install-containerd.sh", &[])
            .await?;
        self.log(
            LogLevel::Success,
            format!("✓ Container runtime installed on {}", node.ip),
        );
        session.close().await;
        Ok(())
    }

    async fn install_kubernetes(&self, scale: bool) -> Result<(), InstallError> {
        // Package repositories are keyed by major.minor.
        let version = self
            .request
            .k8s_version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".");
        let tasks = self
            .target_nodes(scale)
            .into_iter()
            .map(|n| self.kubernetes_node(n, &version));
        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn kubernetes_node(&self, node: &Node, version: &str) -> Result<(), InstallError> {
        let mut session = self.connect(node).await?;
        self.execute_script(&mut session, "install-kubernetes.sh", &[version])
            .await?;
        self.log(
            LogLevel::Success,
            format!("✓ Kubernetes components installed on {}", node.ip),
        );
        session.close().await;
        Ok(())
    }

    async fn control_plane(&self, scale: bool) -> Result<JoinData, InstallError> {
        let master = &self.masters[0];
        let mut session = self.connect(master).await?;
        if scale {
            self.execute_script(&mut session, "patch-cluster-ha.sh", &[&master.ip])
                .await?;
        } else {
            let cidr = self.pod_cidr();
            self.execute_script(
                &mut session,
                "init-control-plane.sh",
                &[&master.ip, cidr, &self.request.k8s_version],
            )
            .await?;
        }
        let join_command = session
            .run("cat /tmp/kubeadm-join-command.txt", None)
            .await?
            .stdout
            .trim()
            .to_string();
        let cert_key = session
            .run("cat /tmp/kubeadm-cert-key.txt", None)
            .await?
            .stdout
            .trim()
            .to_string();
        session.close().await;

        if join_command.is_empty() {
            return Err(InstallError::new(
                "control plane did not produce a join command",
            ));
        }
        self.log(
            LogLevel::Success,
            if scale {
                "✓ Existing cluster prepared for new nodes"
            } else {
                "✓ Control plane initialized"
            },
        );
        Ok(JoinData {
            join_command,
            cert_key,
        })
    }

    fn pod_cidr(&self) -> &'static str {
        if self.request.network_plugin == "calico" {
            "192.168.0.0/16"
        } else {
            "10.244.0.0/16"
        }
    }

    async fn install_network(&self, scale: bool) -> Result<(), InstallError> {
        if scale {
            self.log(
                LogLevel::Info,
                "Network plugin already present on the cluster, skipping",
            );
            return Ok(());
        }
        let mut session = self.connect(&self.masters[0]).await?;
        self.execute_script(
            &mut session,
            "install-network-plugin.sh",
            &[&self.request.network_plugin, self.pod_cidr()],
        )
        .await?;
        self.log(
            LogLevel::Success,
            format!("✓ Network plugin '{}' deployed", self.request.network_plugin),
        );
        session.close().await;
        Ok(())
    }

    /// Additional masters first (they extend the control plane), then
    /// workers. Every node is attempted even after earlier failures so the
    /// final error names each node that did not make it.
    async fn join_nodes(&self, join: &JoinData) -> Result<(), InstallError> {
        let mut failures: Vec<String> = Vec::new();
        let mut diagnosis: Option<Diagnosis> = None;

        for node in self.masters.iter().skip(1) {
            match self
                .join_node(node, "join-master.sh", &[&join.join_command, &join.cert_key])
                .await
            {
                Ok(()) => self.log(
                    LogLevel::Success,
                    format!("✓ Master {} joined the control plane", node.ip),
                ),
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("✗ Master {} failed to join: {}", node.ip, e.message),
                    );
                    if diagnosis.is_none() {
                        diagnosis = e.diagnosis;
                    }
                    failures.push(format!("master {}", node.ip));
                }
            }
        }
        for node in &self.workers {
            match self
                .join_node(node, "join-worker.sh", &[&join.join_command])
                .await
            {
                Ok(()) => self.log(
                    LogLevel::Success,
                    format!("✓ Worker {} joined the cluster", node.ip),
                ),
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("✗ Worker {} failed to join: {}", node.ip, e.message),
                    );
                    if diagnosis.is_none() {
                        diagnosis = e.diagnosis;
                    }
                    failures.push(format!("worker {}", node.ip));
                }
            }
        }

        if !failures.is_empty() {
            return Err(InstallError {
                message: format!(
                    "{} node(s) failed to join: {}",
                    failures.len(),
                    failures.join(", ")
                ),
                diagnosis,
            });
        }
        Ok(())
    }

    async fn join_node(
        &self,
        node: &Node,
        script: &str,
        args: &[&str],
    ) -> Result<(), InstallError> {
        let mut session = self.connect(node).await?;
        let result = self.execute_script(&mut session, script, args).await;
        session.close().await;
        result.map(|_| ())
    }

    async fn install_addons(&self, scale: bool) -> Result<(), InstallError> {
        if scale {
            self.log(LogLevel::Info, "Addon installation skipped for scale run");
            return Ok(());
        }
        if !self.request.addons.any() {
            self.log(LogLevel::Info, "No addons selected");
            return Ok(());
        }
        let selected = self.request.addons.selected();

        self.log(
            LogLevel::Info,
            format!(
                "Waiting {}s for the cluster to settle before installing addons...",
                self.engine.config.addon_settle_secs
            ),
        );
        tokio::time::sleep(Duration::from_secs(self.engine.config.addon_settle_secs)).await;

        let mut session = self.connect(&self.masters[0]).await?;
        for addon in selected {
            self.execute_script(&mut session, "install-addons.sh", &[addon])
                .await?;
            self.log(LogLevel::Success, format!("✓ Addon '{addon}' installed"));
        }
        session.close().await;
        Ok(())
    }

    /// Best effort: a slow node must not fail an otherwise complete install.
    async fn validate(&self) {
        tokio::time::sleep(Duration::from_secs(
            self.engine.config.validation_delay_secs,
        ))
        .await;
        if let Err(e) = self.try_validate().await {
            self.log(
                LogLevel::Warning,
                format!("⚠️ Validation incomplete: {}", e.message),
            );
        }
    }

    async fn try_validate(&self) -> Result<(), InstallError> {
        let expected = self.masters.len() + self.workers.len();
        let mut session = self.connect(&self.masters[0]).await?;
        let ready = session
            .run(
                "export KUBECONFIG=/etc/kubernetes/admin.conf && kubectl get nodes --no-headers | grep -c Ready",
                None,
            )
            .await?;
        let count: usize = ready.stdout.trim().parse().unwrap_or(0);
        if count >= expected {
            self.log(LogLevel::Success, format!("✓ All {count} nodes are Ready"));
        } else {
            self.log(
                LogLevel::Warning,
                format!("⚠️ {count}/{expected} nodes Ready; remaining nodes may still be starting"),
            );
        }

        let pending = session
            .run(
                "export KUBECONFIG=/etc/kubernetes/admin.conf && kubectl get pods -n kube-system --no-headers | grep -cv 'Running\\|Completed'",
                None,
            )
            .await?;
        session.close().await;
        let pending: usize = pending.stdout.trim().parse().unwrap_or(0);
        if pending > 0 {
            self.log(
                LogLevel::Warning,
                format!("⚠️ {pending} system workload(s) not yet running"),
            );
        }
        Ok(())
    }

    /// Upload a local automation script, run it with sudo, stream its output
    /// and clean it up. Non-zero exit gets a classified diagnosis attached.
    async fn execute_script(
        &self,
        session: &mut Box<dyn RemoteSession>,
        name: &str,
        args: &[&str],
    ) -> Result<ExecResult, InstallError> {
        let local = self.engine.config.scripts_dir.join(name);
        let content = tokio::fs::read_to_string(&local).await.map_err(|e| {
            InstallError::new(format!("reading automation script {name}: {e}"))
        })?;
        let stem = name.trim_end_matches(".sh");
        let remote = format!("/tmp/kubeforge-{stem}-{}.sh", Utc::now().timestamp_millis());

        session
            .run(
                &format!("cat > {remote} << 'KUBEFORGE_EOF'\n{content}\nKUBEFORGE_EOF"),
                None,
            )
            .await?;
        session.run(&format!("chmod +x {remote}"), None).await?;

        let quoted = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>();
        let command = if quoted.is_empty() {
            format!("sudo bash {remote}")
        } else {
            format!("sudo bash {remote} {}", quoted.join(" "))
        };

        self.log(LogLevel::Info, format!("Running {name}..."));
        let events = self.events.clone();
        let sink = move |stream: OutputStream, line: &str| {
            let level = match stream {
                OutputStream::Stdout => LogLevel::Info,
                OutputStream::Stderr => {
                    // Package managers write routine progress to stderr.
                    if line.contains("warning") || line.contains("Error") || line.contains("fail")
                    {
                        LogLevel::Warning
                    } else {
                        LogLevel::Info
                    }
                }
            };
            let _ = events.send(EngineEvent::Log {
                level,
                message: line.to_string(),
            });
        };

        let exec = session.run(&command, Some(&sink)).await;
        let _ = session.run(&format!("rm -f {remote}"), None).await;

        let result = exec?;
        if result.exit_code != 0 {
            return Err(InstallError {
                message: format!("{name} failed with exit code {}", result.exit_code),
                diagnosis: Some(analyze(&result.stderr)),
            });
        }
        Ok(result)
    }

    fn descriptor(&self) -> ClusterDescriptor {
        let mut nodes = Vec::new();
        for node in &self.masters {
            nodes.push(ClusterNode {
                name: node
                    .hostname
                    .clone()
                    .unwrap_or_else(|| default_hostname(&node.ip)),
                ip: node.ip.clone(),
                role: NodeRole::Master,
                status: "Ready".into(),
            });
        }
        for node in &self.workers {
            nodes.push(ClusterNode {
                name: node
                    .hostname
                    .clone()
                    .unwrap_or_else(|| default_hostname(&node.ip)),
                ip: node.ip.clone(),
                role: NodeRole::Worker,
                status: "Ready".into(),
            });
        }
        ClusterDescriptor {
            name: self.request.cluster_name.clone(),
            version: self.request.k8s_version.clone(),
            node_count: nodes.len(),
            endpoint: format!("https://{}:6443", self.masters[0].ip),
            nodes,
            simulation_mode: self.simulation,
        }
    }
}

fn default_hostname(ip: &str) -> String {
    format!("node-{}", ip.replace('.', "-"))
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use super::*;

    pub const SCRIPTS: &[&str] = &[
        "preflight-checks.sh",
        "configure-firewall.sh",
        "install-containerd.sh",
        "install-kubernetes.sh",
        "init-control-plane.sh",
        "patch-cluster-ha.sh",
        "install-network-plugin.sh",
        "join-master.sh",
        "join-worker.sh",
        "install-addons.sh",
    ];

    pub fn write_scripts(dir: &Path) {
        for name in SCRIPTS {
            std::fs::write(dir.join(name), "#!/bin/bash\nexit 0\n").unwrap();
        }
    }

    /// Zero-delay config pointing at `scripts_dir`.
    pub fn fast_config(scripts_dir: &Path) -> EngineConfig {
        EngineConfig {
            scripts_dir: scripts_dir.to_path_buf(),
            connect_timeout_secs: 1,
            addon_settle_secs: 0,
            validation_delay_secs: 0,
            simulation_step_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fast_config, write_scripts};
    use super::*;
    use crate::domain::types::{Addons, AuthSecret};
    use crate::shell::mock::MockShell;
    use std::sync::Mutex;

    fn node(ip: &str) -> Node {
        Node {
            ip: ip.into(),
            username: "root".into(),
            auth_secret: AuthSecret::Password("pw".into()),
            hostname: None,
        }
    }

    fn request(masters: &[&str], workers: &[&str], mode: InstallMode) -> InstallationRequest {
        InstallationRequest {
            cluster_name: "test".into(),
            k8s_version: "1.28.2".into(),
            network_plugin: "flannel".into(),
            master_nodes: masters.iter().map(|ip| node(ip)).collect(),
            worker_nodes: workers.iter().map(|ip| node(ip)).collect(),
            addons: Addons::default(),
            mode,
            original_cluster_id: None,
        }
    }

    async fn run_engine(
        shell: MockShell,
        request: InstallationRequest,
    ) -> (Vec<EngineEvent>, Vec<(String, String)>) {
        let dir = tempfile::tempdir().unwrap();
        write_scripts(dir.path());
        let commands = shell.commands.clone();
        let engine = AutomationEngine::new(std::sync::Arc::new(shell), fast_config(dir.path()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.run(request, tx).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let commands = commands.lock().unwrap().clone();
        (events, commands)
    }

    fn script_runs(commands: &[(String, String)]) -> Vec<(String, String)> {
        commands
            .iter()
            .filter(|(_, cmd)| cmd.starts_with("sudo bash /tmp/kubeforge-"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn unreachable_first_master_switches_to_simulation() {
        let shell = MockShell::new()
            .unreachable("10.0.0.1")
            .unreachable("10.0.0.11");
        let (events, commands) =
            run_engine(shell, request(&["10.0.0.1"], &["10.0.0.11"], InstallMode::Install)).await;

        assert!(commands.is_empty(), "no remote commands in simulation mode");
        let Some(EngineEvent::Completed(descriptor)) = events.last() else {
            panic!("expected completion, got {:?}", events.last());
        };
        assert!(descriptor.simulation_mode);
        assert_eq!(descriptor.node_count, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Log { message, .. } if message.contains("[SIMULATION]")
        )));
    }

    #[tokio::test]
    async fn connectivity_failure_names_the_unreachable_node() {
        let shell = MockShell::new().unreachable("10.0.0.2");
        let (events, _) = run_engine(
            shell,
            request(&["10.0.0.1", "10.0.0.2"], &[], InstallMode::Install),
        )
        .await;

        let Some(EngineEvent::Failed(err)) = events.last() else {
            panic!("expected failure");
        };
        assert!(err.message.contains("master node 10.0.0.2"), "{}", err.message);
    }

    #[tokio::test]
    async fn join_runs_masters_first_and_attempts_every_worker() {
        let shell = MockShell::new().fail(
            "10.0.0.12",
            "kubeforge-join-worker",
            "connection timed out",
        );
        let (events, commands) = run_engine(
            shell,
            request(
                &["10.0.0.1", "10.0.0.2"],
                &["10.0.0.11", "10.0.0.12", "10.0.0.13"],
                InstallMode::Install,
            ),
        )
        .await;

        let runs = script_runs(&commands);
        let master_join = runs
            .iter()
            .position(|(ip, cmd)| ip == "10.0.0.2" && cmd.contains("kubeforge-join-master"))
            .expect("second master joined");
        let worker_joins: Vec<usize> = runs
            .iter()
            .enumerate()
            .filter(|(_, (_, cmd))| cmd.contains("kubeforge-join-worker"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(worker_joins.len(), 3, "every worker must be attempted");
        assert!(worker_joins.iter().all(|i| *i > master_join));

        let Some(EngineEvent::Failed(err)) = events.last() else {
            panic!("expected failure");
        };
        assert!(err.message.contains("worker 10.0.0.12"), "{}", err.message);
        assert_eq!(
            err.diagnosis.as_ref().map(|d| d.fix_action),
            Some(FixAction::RetryConnection)
        );
    }

    #[tokio::test]
    async fn scale_mode_leaves_the_bridge_master_alone() {
        let mut req = request(&["10.0.0.1"], &["10.0.0.21"], InstallMode::Scale);
        req.addons.ingress = true;
        let (events, commands) = run_engine(MockShell::new(), req).await;

        assert!(matches!(events.last(), Some(EngineEvent::Completed(_))));
        let runs = script_runs(&commands);
        assert!(!runs
            .iter()
            .any(|(ip, cmd)| ip == "10.0.0.1" && cmd.contains("install-containerd")));
        assert!(!runs
            .iter()
            .any(|(ip, cmd)| ip == "10.0.0.1" && cmd.contains("install-kubernetes")));
        assert!(runs
            .iter()
            .any(|(ip, cmd)| ip == "10.0.0.21" && cmd.contains("install-containerd")));
        assert!(runs
            .iter()
            .any(|(ip, cmd)| ip == "10.0.0.1" && cmd.contains("patch-cluster-ha")));
        assert!(!runs.iter().any(|(_, cmd)| cmd.contains("install-network-plugin")));
        assert!(!runs.iter().any(|(_, cmd)| cmd.contains("install-addons")));
    }

    #[tokio::test]
    async fn script_failure_carries_a_diagnosis() {
        let shell = MockShell::new().fail(
            "10.0.0.1",
            "init-control-plane",
            "[ERROR Swap]: running with swap on is not supported",
        );
        let (events, _) = run_engine(shell, request(&["10.0.0.1"], &[], InstallMode::Install)).await;

        let Some(EngineEvent::Failed(err)) = events.last() else {
            panic!("expected failure");
        };
        assert_eq!(
            err.diagnosis.as_ref().map(|d| d.fix_action),
            Some(FixAction::FixSwapOff)
        );
    }

    #[tokio::test]
    async fn successful_install_reports_monotonic_progress_to_100() {
        let (events, _) = run_engine(
            MockShell::new(),
            request(&["10.0.0.1"], &["10.0.0.11"], InstallMode::Install),
        )
        .await;

        let milestones: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(milestones.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(milestones.last(), Some(&100));

        let Some(EngineEvent::Completed(descriptor)) = events.last() else {
            panic!("expected completion");
        };
        assert!(!descriptor.simulation_mode);
        assert_eq!(descriptor.endpoint, "https://10.0.0.1:6443");
        assert_eq!(descriptor.nodes[0].name, "host-10-0-0-1");
        assert_eq!(descriptor.nodes[1].role, NodeRole::Worker);
    }

    #[tokio::test]
    async fn stderr_progress_lines_surface_as_info_logs() {
        let shell = MockShell::new().respond(
            "10.0.0.1",
            "kubeforge-install-containerd",
            ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: "Selecting previously unselected package containerd.\n\
                         warning: config file changed\n"
                    .into(),
            },
        );
        let (events, _) =
            run_engine(shell, request(&["10.0.0.1"], &[], InstallMode::Install)).await;

        assert!(matches!(events.last(), Some(EngineEvent::Completed(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Log { level: LogLevel::Info, message }
                if message.contains("Selecting previously unselected package")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Log { level: LogLevel::Warning, message }
                if message.contains("config file changed")
        )));
    }

    #[tokio::test]
    async fn host_table_rewrite_strips_the_managed_block_first() {
        let (events, commands) = run_engine(
            MockShell::new(),
            request(&["10.0.0.1"], &["10.0.0.11"], InstallMode::Install),
        )
        .await;

        assert!(matches!(events.last(), Some(EngineEvent::Completed(_))));
        let sync: Vec<&(String, String)> = commands
            .iter()
            .filter(|(_, cmd)| cmd.contains("hostnamectl set-hostname"))
            .collect();
        assert_eq!(sync.len(), 2);
        for (_, cmd) in sync {
            let strip = cmd
                .find("sed -i '/# kubeforge managed/d' /etc/hosts")
                .unwrap();
            let append = cmd.find("tee -a /etc/hosts").unwrap();
            assert!(strip < append);
            assert!(cmd.contains("10.0.0.11 host-10-0-0-11 # kubeforge managed"));
        }
    }

    #[tokio::test]
    async fn addons_install_in_selection_order() {
        let mut req = request(&["10.0.0.1"], &[], InstallMode::Install);
        req.addons = Addons {
            ingress: true,
            dashboard: true,
            ..Default::default()
        };
        let (events, commands) = run_engine(MockShell::new(), req).await;

        assert!(matches!(events.last(), Some(EngineEvent::Completed(_))));
        let addon_args: Vec<String> = script_runs(&commands)
            .into_iter()
            .filter(|(_, cmd)| cmd.contains("install-addons"))
            .map(|(_, cmd)| cmd)
            .collect();
        assert_eq!(addon_args.len(), 2);
        assert!(addon_args[0].ends_with("'ingress'"));
        assert!(addon_args[1].ends_with("'dashboard'"));
    }

    #[tokio::test]
    async fn fix_dpkg_lock_runs_repair_sequence() {
        let shell = MockShell::new();
        let commands = shell.commands.clone();
        let engine = AutomationEngine::new(
            std::sync::Arc::new(shell),
            fast_config(std::path::Path::new(".")),
        );

        let logs: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());
        let log = |level: LogLevel, message: String| {
            logs.lock().unwrap().push((level, message));
        };
        engine
            .run_fix("fix_dpkg_lock", &node("10.0.0.1"), &log)
            .await
            .unwrap();

        let ran = commands.lock().unwrap().clone();
        assert!(ran.iter().any(|(_, cmd)| cmd == "sudo dpkg --configure -a"));
        let logs = logs.lock().unwrap();
        assert!(matches!(logs.last(), Some((LogLevel::Success, _))));
    }

    #[tokio::test]
    async fn unknown_fix_action_is_an_informational_noop() {
        let shell = MockShell::new();
        let commands = shell.commands.clone();
        let engine = AutomationEngine::new(
            std::sync::Arc::new(shell),
            fast_config(std::path::Path::new(".")),
        );

        let logs: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());
        let log = |level: LogLevel, message: String| {
            logs.lock().unwrap().push((level, message));
        };
        engine
            .run_fix("reinstall_the_internet", &node("10.0.0.1"), &log)
            .await
            .unwrap();

        assert!(commands.lock().unwrap().is_empty());
        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].1.contains("No automated fix"));
    }

    // Status transitions live in the registry; keep the engine's contract
    // here: a run always ends in exactly one terminal event.
    #[tokio::test]
    async fn every_run_ends_in_one_terminal_event() {
        let (events, _) = run_engine(
            MockShell::new().unreachable("10.0.0.2"),
            request(&["10.0.0.1", "10.0.0.2"], &[], InstallMode::Install),
        )
        .await;
        let terminal = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Completed(_) | EngineEvent::Failed(_)))
            .count();
        assert_eq!(terminal, 1);
    }
}
