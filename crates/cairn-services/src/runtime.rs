//! Container runtime seam and its Docker CLI implementation.
//!
//! Protocols only see `ContainerRuntime`. `DockerCli` shells out to the
//! `docker` binary with `tokio::process`, one command per call.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role a cluster join token grants. Recruitment only hands out `Worker`
/// tokens; `Manager` is there for runtimes shared with tooling that
/// promotes nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Worker,
    Manager,
}

impl ClusterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterRole::Worker => "worker",
            ClusterRole::Manager => "manager",
        }
    }
}

/// An image known to the local engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
}

/// Replicated service deployed across the cluster. Parsed from the task
/// JSON handed to `Node::run_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

fn default_replicas() -> u32 {
    1
}

/// Everything the protocols need from the local container engine.
///
/// `list_containers` and `remove_container` are only used to clean up jobs
/// on shutdown; finished jobs are kept so they can still be inspected.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Returns its id.
    async fn run_container(&self, image_id: &str) -> Result<String>;
    async fn is_running(&self, container_id: &str) -> Result<bool>;
    /// Raw JSON description of a container.
    async fn inspect_container(&self, container_id: &str) -> Result<String>;
    async fn list_containers(&self) -> Result<Vec<String>>;
    async fn remove_container(&self, container_id: &str) -> Result<()>;
    /// Load an image archive. Returns the image id.
    async fn load_image(&self, path: &Path) -> Result<String>;
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    async fn is_cluster_member(&self) -> Result<bool>;
    async fn init_cluster(&self) -> Result<()>;
    async fn join_cluster(&self, token: &str, address: &str) -> Result<()>;
    async fn leave_cluster(&self) -> Result<()>;
    async fn join_token(&self, role: ClusterRole) -> Result<String>;
    /// Address recruits dial to join this node's cluster.
    async fn cluster_address(&self) -> Result<String>;
    /// Returns the service id.
    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<String>;
    async fn remove_service(&self, name: &str) -> Result<()>;
}

// ── Docker CLI ────────────────────────────────────────────────────────────────

/// Swarm manager port appended to the node address.
const SWARM_PORT: u16 = 2377;

pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the CLI and return trimmed stdout, or fail with stderr.
    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn '{} {}'", self.binary, args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            bail!(
                "'{} {}' exited with {}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                code,
                if stderr.trim().is_empty() { stdout.as_str() } else { stderr.trim() }
            )
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run_container(&self, image_id: &str) -> Result<String> {
        let id = self.docker(&["run", "-d", image_id]).await?;
        tracing::info!(image_id, container_id = %short(&id), "container started");
        Ok(id)
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        let state = self
            .docker(&["inspect", "-f", "{{.State.Running}}", container_id])
            .await?;
        Ok(state == "true")
    }

    async fn inspect_container(&self, container_id: &str) -> Result<String> {
        self.docker(&["inspect", container_id]).await
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let out = self.docker(&["ps", "-aq", "--no-trunc"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.docker(&["rm", "-f", container_id]).await.map(|_| ())
    }

    async fn load_image(&self, path: &Path) -> Result<String> {
        let path_str = path.to_string_lossy();
        let out = self.docker(&["load", "-i", &*path_str]).await?;
        match parse_loaded_image(&out) {
            Some(LoadedImage::Id(id)) => Ok(id),
            Some(LoadedImage::Reference(reference)) => self
                .docker(&["image", "inspect", "-f", "{{.Id}}", reference.as_str()])
                .await
                .with_context(|| format!("failed to resolve loaded image {reference}")),
            None => bail!("unrecognised docker load output: {out}"),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let out = self
            .docker(&["images", "--no-trunc", "--format", "{{json .}}"])
            .await?;
        parse_image_lines(&out)
    }

    async fn is_cluster_member(&self) -> Result<bool> {
        let state = self
            .docker(&["info", "-f", "{{.Swarm.LocalNodeState}}"])
            .await?;
        Ok(state == "active")
    }

    async fn init_cluster(&self) -> Result<()> {
        self.docker(&["swarm", "init"]).await.map(|_| ())
    }

    async fn join_cluster(&self, token: &str, address: &str) -> Result<()> {
        self.docker(&["swarm", "join", "--token", token, address])
            .await
            .map(|_| ())
    }

    async fn leave_cluster(&self) -> Result<()> {
        self.docker(&["swarm", "leave", "--force"]).await.map(|_| ())
    }

    async fn join_token(&self, role: ClusterRole) -> Result<String> {
        self.docker(&["swarm", "join-token", "-q", role.as_str()]).await
    }

    async fn cluster_address(&self) -> Result<String> {
        let addr = self.docker(&["info", "-f", "{{.Swarm.NodeAddr}}"]).await?;
        if addr.is_empty() {
            bail!("node is not part of a swarm");
        }
        Ok(format!("{addr}:{SWARM_PORT}"))
    }

    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<String> {
        let replicas = spec.replicas.to_string();
        let mut args = vec![
            "service",
            "create",
            "--detach",
            "--name",
            spec.name.as_str(),
            "--replicas",
            replicas.as_str(),
        ];
        for e in &spec.env {
            args.push("--env");
            args.push(e);
        }
        args.push(&spec.image);
        args.extend(spec.command.iter().map(String::as_str));
        self.docker(&args).await
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.docker(&["service", "rm", name]).await.map(|_| ())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoadedImage {
    Id(String),
    Reference(String),
}

/// `docker load` prints either `Loaded image ID: sha256:...` or
/// `Loaded image: name:tag`. The last such line wins.
fn parse_loaded_image(out: &str) -> Option<LoadedImage> {
    out.lines().rev().find_map(|line| {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("Loaded image ID:") {
            Some(LoadedImage::Id(id.trim().to_string()))
        } else {
            line.strip_prefix("Loaded image:")
                .map(|r| LoadedImage::Reference(r.trim().to_string()))
        }
    })
}

/// One `{{json .}}` object per line.
fn parse_image_lines(out: &str) -> Result<Vec<ImageSummary>> {
    #[derive(Deserialize)]
    struct Line {
        #[serde(rename = "ID")]
        id: String,
        #[serde(rename = "Repository", default)]
        repository: String,
        #[serde(rename = "Tag", default)]
        tag: String,
    }

    let mut images: Vec<ImageSummary> = Vec::new();
    for raw in out.lines().filter(|l| !l.trim().is_empty()) {
        let line: Line =
            serde_json::from_str(raw).with_context(|| format!("bad image line: {raw}"))?;
        let tag = (line.repository != "<none>" && line.tag != "<none>")
            .then(|| format!("{}:{}", line.repository, line.tag));
        match images.iter_mut().find(|i| i.id == line.id) {
            Some(existing) => existing.tags.extend(tag),
            None => images.push(ImageSummary {
                id: line.id,
                tags: tag.into_iter().collect(),
            }),
        }
    }
    Ok(images)
}

fn short(id: &str) -> &str {
    &id[..12.min(id.len())]
}
