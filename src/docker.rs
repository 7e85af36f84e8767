//! Container runtime adapter.
//!
//! Thin capability over the `docker` CLI. Query verbs carry hard wall-clock
//! timeouts (2-5 s); `pull` and `run` are unbounded because image downloads
//! and model launches legitimately take minutes.
//!
//! Elevation: the daemon first tries the unprivileged client. If a plain
//! `docker ps` probe fails, every subsequent invocation is prefixed with
//! `sudo`. `USE_SUDO_DOCKER=true|1|yes` forces the elevated form.

use crate::env::EnvStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub const VLLM_IMAGE: &str = "vllm/vllm-openai:latest";
const NAME_PREFIX: &str = "vllm-";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime timed out running `{0}`")]
    Timeout(&'static str),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected runtime output: {0}")]
    UnexpectedOutput(String),
}

/// One row of `docker ps` output.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ports: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: i64,
    pub pid: u32,
}

/// Everything needed to launch one inference container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub container_name: String,
    pub host_port: u16,
    pub model_id: String,
    pub hf_token: String,
    pub config_path: PathBuf,
    pub tensor_parallel: usize,
}

impl LaunchSpec {
    /// Arguments for `docker run`, mirroring the flags vLLM needs: NVIDIA
    /// runtime, host IPC, the HF cache volume, and a read-only config mount.
    pub fn run_args(&self) -> Vec<String> {
        let cache = format!(
            "{}/.cache/huggingface:/root/.cache/huggingface",
            std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
        );
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--runtime".to_string(),
            "nvidia".to_string(),
            "--gpus".to_string(),
            "all".to_string(),
            "-p".to_string(),
            format!("0.0.0.0:{}:8000", self.host_port),
            "-v".to_string(),
            cache,
            "-v".to_string(),
            format!("{}:/tmp/config.yaml:ro", self.config_path.display()),
            "--env".to_string(),
            format!("HF_TOKEN={}", self.hf_token),
            "--ipc=host".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            self.image.clone(),
            "--model".to_string(),
            self.model_id.clone(),
            "--config".to_string(),
            "/tmp/config.yaml".to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--trust-remote-code".to_string(),
            "--tensor-parallel-size".to_string(),
            self.tensor_parallel.to_string(),
        ]
    }
}

pub struct StartOutput {
    /// Short (12-hex) container id extracted from stdout, or empty when the
    /// runtime printed no id.
    pub container_id: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers whose names begin with `vllm-`. Entries are
    /// re-verified with a separate inspect; `ps` has been observed to return
    /// recently exited containers.
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// `docker run -d ...`. Unbounded.
    async fn start(&self, spec: &LaunchSpec) -> Result<StartOutput, RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    async fn logs(&self, id: &str, tail: usize) -> Result<String, RuntimeError>;

    /// `docker pull`. Unbounded.
    async fn pull(&self, tag: &str) -> Result<(), RuntimeError>;

    /// Image id for a tag, empty when the image is absent.
    async fn image_id(&self, tag: &str) -> Result<String, RuntimeError>;

    /// Container id for a name, including stopped containers. Empty when no
    /// such container exists.
    async fn container_id_for(&self, name: &str) -> Result<String, RuntimeError>;

    /// `(name, ports)` pairs for every running container, used for the
    /// host-port clash pre-check.
    async fn port_bindings(&self) -> Result<Vec<(String, String)>, RuntimeError>;
}

/// `docker` CLI adapter.
pub struct DockerCli {
    use_sudo: bool,
}

impl DockerCli {
    /// Decide once whether invocations need `sudo`.
    pub async fn resolve(env: &EnvStore) -> Self {
        if env.use_sudo_docker() {
            debug!("USE_SUDO_DOCKER set, using elevated docker invocations");
            return Self { use_sudo: true };
        }

        let probe = tokio::time::timeout(
            INSPECT_TIMEOUT,
            Command::new("docker").arg("ps").output(),
        )
        .await;

        let use_sudo = match probe {
            Ok(Ok(output)) => !output.status.success(),
            _ => true,
        };
        if use_sudo {
            warn!("unprivileged `docker ps` failed, falling back to sudo");
        }
        Self { use_sudo }
    }

    fn command(&self) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("docker");
            cmd
        } else {
            Command::new("docker")
        }
    }

    async fn invoke(
        &self,
        verb: &'static str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<Output, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(args);
        cmd.kill_on_drop(true);

        let run = cmd.output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| RuntimeError::Timeout(verb))?,
            None => run.await,
        };
        output.map_err(|e| RuntimeError::Unavailable(format!("{verb}: {e}")))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={NAME_PREFIX}"),
            "--filter".to_string(),
            "status=running".to_string(),
            "--format".to_string(),
            "{{.ID}}|{{.Names}}|{{.Status}}|{{.Ports}}".to_string(),
        ];
        let output = self.invoke("ps", &args, Some(QUERY_TIMEOUT)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut verified = Vec::new();
        for summary in stdout.lines().filter_map(parse_ps_line) {
            match self.inspect(&summary.id).await {
                Ok(state) if state.running => verified.push(summary),
                Ok(_) => debug!(name = %summary.name, "dropping container that is no longer running"),
                Err(e) => debug!(name = %summary.name, error = %e, "dropping unverifiable container"),
            }
        }
        Ok(verified)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}|{{.State.ExitCode}}|{{.State.Pid}}".to_string(),
            id.to_string(),
        ];
        let output = self.invoke("inspect", &args, Some(INSPECT_TIMEOUT)).await?;
        if !output.status.success() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_inspect_line(stdout.trim())
            .ok_or_else(|| RuntimeError::UnexpectedOutput(stdout.trim().to_string()))
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<StartOutput, RuntimeError> {
        let output = self.invoke("run", &spec.run_args(), None).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(StartOutput {
            container_id: extract_container_id(&stdout).unwrap_or_default(),
            stderr,
        })
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["stop".to_string(), name.to_string()];
        let output = self.invoke("stop", &args, Some(STOP_TIMEOUT)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["rm".to_string(), name.to_string()];
        let output = self.invoke("rm", &args, Some(QUERY_TIMEOUT)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, RuntimeError> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            id.to_string(),
        ];
        let output = self.invoke("logs", &args, Some(QUERY_TIMEOUT)).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn pull(&self, tag: &str) -> Result<(), RuntimeError> {
        let args = vec!["pull".to_string(), tag.to_string()];
        let output = self.invoke("pull", &args, None).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(format!(
                "pull {tag}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn image_id(&self, tag: &str) -> Result<String, RuntimeError> {
        let args = vec!["images".to_string(), "-q".to_string(), tag.to_string()];
        let output = self.invoke("images", &args, Some(QUERY_TIMEOUT)).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn container_id_for(&self, name: &str) -> Result<String, RuntimeError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={name}"),
            "--format".to_string(),
            "{{.ID}}".to_string(),
        ];
        let output = self.invoke("ps", &args, Some(QUERY_TIMEOUT)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("").trim().to_string())
    }

    async fn port_bindings(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        let args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Names}}|{{.Ports}}".to_string(),
        ];
        let output = self.invoke("ps", &args, Some(QUERY_TIMEOUT)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (name, ports) = line.split_once('|')?;
                Some((name.trim().to_string(), ports.trim().to_string()))
            })
            .collect())
    }
}

/// A running deployment as seen through the runtime listing.
#[derive(Debug, Clone)]
pub struct LiveContainer {
    pub container_id: String,
    pub container_name: String,
    pub model_id: String,
    pub port: u16,
}

/// Map the runtime listing to deployments. The model id is recovered from
/// the name by stripping the `vllm-` prefix.
pub async fn live_vllm_containers(
    runtime: &dyn ContainerRuntime,
) -> Result<Vec<LiveContainer>, RuntimeError> {
    let summaries = runtime.list_running().await?;
    Ok(summaries
        .into_iter()
        .map(|c| {
            let model_id = c
                .name
                .strip_prefix(NAME_PREFIX)
                .unwrap_or(&c.name)
                .to_string();
            let port = host_port_from_ports(&c.ports).unwrap_or(8000);
            LiveContainer {
                container_id: c.id,
                container_name: c.name,
                model_id,
                port,
            }
        })
        .collect())
}

fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut fields = line.splitn(4, '|');
    let id = fields.next()?.trim();
    let name = fields.next()?.trim();
    let status = fields.next().unwrap_or("").trim();
    let ports = fields.next().unwrap_or("").trim();
    if id.is_empty() || !name.starts_with(NAME_PREFIX) {
        return None;
    }
    Some(ContainerSummary {
        id: id.to_string(),
        name: name.to_string(),
        status: status.to_string(),
        ports: ports.to_string(),
    })
}

fn parse_inspect_line(line: &str) -> Option<ContainerState> {
    let mut fields = line.splitn(3, '|');
    let running = fields.next()? == "true";
    let exit_code = fields.next()?.parse().ok()?;
    let pid = fields.next()?.parse().ok()?;
    Some(ContainerState {
        running,
        exit_code,
        pid,
    })
}

/// Host port out of a docker ports field such as
/// `0.0.0.0:8001->8000/tcp, :::8001->8000/tcp`.
pub fn host_port_from_ports(ports: &str) -> Option<u16> {
    if let Some(arrow) = ports.find("->") {
        let head = &ports[..arrow];
        let colon = head.rfind(':')?;
        return head[colon + 1..].parse().ok();
    }
    // No mapping arrow: take digits after the first colon.
    let colon = ports.find(':')?;
    let rest = &ports[colon + 1..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// First stdout line that looks like a container id: at least 12 hex chars
/// and not an error message. `docker run -d` prints the 64-char id on
/// success, sometimes after warning lines.
pub fn extract_container_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let line = line.trim();
        if line.len() < 12
            || line.contains("Error")
            || line.contains("error")
            || line.contains("Unable")
        {
            continue;
        }
        if line.chars().take(64).all(|c| c.is_ascii_hexdigit()) {
            return Some(line[..12].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn run_args_include_required_flags() {
        let spec = LaunchSpec {
            image: VLLM_IMAGE.to_string(),
            container_name: "vllm-org-model".to_string(),
            host_port: 8001,
            model_id: "org/model".to_string(),
            hf_token: "tok".to_string(),
            config_path: Path::new("/etc/gpuplane/A100.yaml").to_path_buf(),
            tensor_parallel: 2,
        };
        let args = spec.run_args();
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--ipc=host".to_string()));
        assert!(args.contains(&"0.0.0.0:8001:8000".to_string()));
        assert!(args.contains(&"/etc/gpuplane/A100.yaml:/tmp/config.yaml:ro".to_string()));
        assert!(args.contains(&"HF_TOKEN=tok".to_string()));
        assert!(args.contains(&"--trust-remote-code".to_string()));
        let tp = args.iter().position(|a| a == "--tensor-parallel-size");
        assert_eq!(args[tp.unwrap() + 1], "2");
        // Image comes before the vLLM arguments.
        let image = args.iter().position(|a| a == VLLM_IMAGE).unwrap();
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert!(image < model);
    }

    #[test]
    fn parses_ps_lines_and_skips_foreign_names() {
        let line = "abc123def456|vllm-org-model|Up 2 minutes|0.0.0.0:8001->8000/tcp";
        let summary = parse_ps_line(line).unwrap();
        assert_eq!(summary.id, "abc123def456");
        assert_eq!(summary.name, "vllm-org-model");

        assert!(parse_ps_line("id|redis|Up|6379/tcp").is_none());
        assert!(parse_ps_line("").is_none());
    }

    #[test]
    fn parses_inspect_output() {
        let state = parse_inspect_line("true|0|12345").unwrap();
        assert!(state.running);
        assert_eq!(state.pid, 12345);

        let state = parse_inspect_line("false|137|0").unwrap();
        assert!(!state.running);
        assert_eq!(state.exit_code, 137);

        assert!(parse_inspect_line("garbage").is_none());
    }

    #[test]
    fn host_port_parses_mapping_formats() {
        assert_eq!(
            host_port_from_ports("0.0.0.0:8001->8000/tcp, :::8001->8000/tcp"),
            Some(8001)
        );
        assert_eq!(host_port_from_ports(":8002->8000/tcp"), Some(8002));
        assert_eq!(host_port_from_ports("0.0.0.0:9000/tcp"), Some(9000));
        assert_eq!(host_port_from_ports("8000/tcp"), None);
        assert_eq!(host_port_from_ports(""), None);
    }

    #[test]
    fn extracts_container_id_from_run_output() {
        let stdout = "WARNING: something\n\
            0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef\n";
        assert_eq!(
            extract_container_id(stdout).as_deref(),
            Some("0123456789ab")
        );
    }

    #[test]
    fn ignores_error_lines_when_extracting_id() {
        let stdout = "docker: Error response from daemon: port is already allocated.\n";
        assert_eq!(extract_container_id(stdout), None);
        assert_eq!(extract_container_id("short\n"), None);
        // Non-hex lines of sufficient length are not ids.
        assert_eq!(extract_container_id("this-is-not-a-container-id\n"), None);
    }
}
