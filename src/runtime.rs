//! Container runtime commands and the cluster container naming convention
//!
//! Cluster nodes run in containers named `<prefix>-<cluster>-node<N>`. The
//! runtime is only ever queried through its CLI (`ps` and `exec`).

use crate::exec::{command_line, ExecError, ShellExecutor};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Separator between fields in the `ps` output format
const PS_FIELD_SEPARATOR: char = '|';

/// Errors from runtime inspection commands
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{command} failed: {diagnostic}")]
    Command { command: String, diagnostic: String },
}

/// A container name following `<prefix>-<cluster>-node<N>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerName {
    pub cluster: String,
    pub node: u32,
}

impl ContainerName {
    /// Parse a container (or internal host) name.
    ///
    /// The cluster part may contain dashes; the node number is the digits
    /// after the last `-node`.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
        let (cluster, node) = rest.rsplit_once("-node")?;
        if cluster.is_empty() || node.is_empty() || !node.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !cluster
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return None;
        }
        Some(Self {
            cluster: cluster.to_string(),
            node: node.parse().ok()?,
        })
    }

    /// Name prefix shared by every node container of a cluster
    pub fn cluster_prefix(prefix: &str, cluster: &str) -> String {
        format!("{}-{}-node", prefix, cluster)
    }
}

/// One running container as reported by `ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
}

/// A node of a running cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeListing {
    pub container: String,
    pub node: u32,
    pub status: String,
}

/// A running cluster and its nodes, sorted by node number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterListing {
    pub name: String,
    pub nodes: Vec<NodeListing>,
}

impl fmt::Display for ClusterListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} nodes)", self.name, self.nodes.len())
    }
}

/// Runs container runtime CLI commands through a [`ShellExecutor`]
#[derive(Clone)]
pub struct ContainerRuntime {
    shell: Arc<dyn ShellExecutor>,
    command: String,
    prefix: String,
    exec_timeout: Duration,
}

impl ContainerRuntime {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        command: impl Into<String>,
        prefix: impl Into<String>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            shell,
            command: command.into(),
            prefix: prefix.into(),
            exec_timeout,
        }
    }

    pub fn shell(&self) -> &Arc<dyn ShellExecutor> {
        &self.shell
    }

    /// The runtime CLI, e.g. `docker`
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The container name prefix, e.g. `yb`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Command line listing running containers whose name starts with `name_prefix`.
    ///
    /// The runtime treats the name filter as a regex; results are re-checked
    /// with a literal prefix match when parsed.
    pub fn list_command(&self, name_prefix: &str) -> String {
        let name_filter = format!("name=^{}", name_prefix);
        let format = format!("{{{{.Names}}}}{}{{{{.Status}}}}", PS_FIELD_SEPARATOR);
        command_line([
            self.command.as_str(),
            "ps",
            "--filter",
            name_filter.as_str(),
            "--filter",
            "status=running",
            "--format",
            format.as_str(),
        ])
    }

    /// List running containers whose name starts with `name_prefix`
    pub async fn list_running(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let command = self.list_command(name_prefix);
        let output = self.shell.run(&command, self.exec_timeout).await?;
        if !output.success() {
            return Err(RuntimeError::Command {
                command: format!("{} ps", self.command),
                diagnostic: output.diagnostic(),
            });
        }

        let containers = parse_ps_output(&String::from_utf8_lossy(&output.stdout), name_prefix);
        debug!(name_prefix, count = containers.len(), "Listed running containers");
        Ok(containers)
    }

    /// Name of the first running container whose name starts with `name_prefix`
    pub async fn first_running(&self, name_prefix: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .list_running(name_prefix)
            .await?
            .into_iter()
            .next()
            .map(|c| c.name))
    }

    /// Running clusters grouped from the containers following the naming convention
    pub async fn list_clusters(&self) -> Result<Vec<ClusterListing>, RuntimeError> {
        let containers = self.list_running(&format!("{}-", self.prefix)).await?;
        Ok(group_clusters(containers, &self.prefix))
    }
}

/// Parse `name|status` lines, keeping only names that start with `name_prefix`
fn parse_ps_output(stdout: &str, name_prefix: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, status) = line
                .split_once(PS_FIELD_SEPARATOR)
                .unwrap_or((line, ""));
            let name = name.trim();
            name.starts_with(name_prefix).then(|| ContainerInfo {
                name: name.to_string(),
                status: status.trim().to_string(),
            })
        })
        .collect()
}

fn group_clusters(containers: Vec<ContainerInfo>, prefix: &str) -> Vec<ClusterListing> {
    let mut clusters: BTreeMap<String, Vec<NodeListing>> = BTreeMap::new();
    for container in containers {
        if let Some(parsed) = ContainerName::parse(&container.name, prefix) {
            clusters.entry(parsed.cluster).or_default().push(NodeListing {
                container: container.name,
                node: parsed.node,
                status: container.status,
            });
        }
    }

    clusters
        .into_iter()
        .map(|(name, mut nodes)| {
            nodes.sort_by_key(|n| n.node);
            ClusterListing { name, nodes }
        })
        .collect()
}
