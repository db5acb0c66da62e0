//! Entrypoint for talking to a Docker- or Podman-compatible container engine
//!
//! All paths are the unversioned Docker-compatible forms
//! (`/containers/create`, not `/v4.0.0/libpod/...`) so the same client works
//! against both engines.

use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};

use futures_util::{
    stream::Stream,
    TryFutureExt, TryStreamExt,
};
use hyper::{Method, StatusCode};
use log::debug;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::form_urlencoded;

use crate::{
    errors::{Error, Result},
    tarball,
    transport::{Payload, Transport},
    tty::{self, Multiplexer, TtyReader},
};

/// Name of the environment variable consulted first during socket discovery
pub const SOCKET_ENV: &str = "POCKETDOCK_SOCKET";

fn candidate_sockets() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(xdg) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(xdg).join("podman/podman.sock"));
    }
    candidates.push(PathBuf::from("/run/podman/podman.sock"));
    candidates.push(PathBuf::from("/var/run/docker.sock"));
    candidates
}

/// Client handle for one container engine socket
#[derive(Debug, Clone)]
pub struct Engine {
    transport: Transport,
}

impl Engine {
    /// Creates an engine client for a known Unix socket path
    pub fn unix<S>(socket_path: S) -> Engine
    where
        S: Into<String>,
    {
        Engine {
            transport: Transport::new(socket_path),
        }
    }

    /// Auto-detect an available engine socket.
    ///
    /// Detection order: the `POCKETDOCK_SOCKET` environment variable, the
    /// rootless Podman socket under `$XDG_RUNTIME_DIR`, the system Podman
    /// socket, then the Docker socket. The first existing path wins.
    pub fn detect() -> Result<Engine> {
        if let Ok(explicit) = env::var(SOCKET_ENV) {
            if !explicit.is_empty() && PathBuf::from(&explicit).exists() {
                return Ok(Engine::unix(explicit));
            }
        }
        for candidate in candidate_sockets() {
            if candidate.exists() {
                debug!("using engine socket {}", candidate.display());
                return Ok(Engine::unix(candidate.to_string_lossy().into_owned()));
            }
        }
        Err(Error::EngineUnavailable)
    }

    /// The Unix socket path this client talks to
    pub fn socket_path(&self) -> &str {
        self.transport.socket_path()
    }

    /// Ping the engine, returning the response body (`"OK"`)
    pub async fn ping(&self) -> Result<String> {
        self.transport
            .request(Method::GET, "/_ping", Payload::None)
            .await
            .map(|body| body.trim().to_owned())
    }

    //
    // Container endpoints
    //

    /// Create a container, returning the engine-assigned id (full hex)
    pub async fn create_container(
        &self,
        opts: &ContainerCreateOptions,
    ) -> Result<String> {
        let mut path = vec!["/containers/create".to_owned()];
        if let Some(ref name) = opts.name {
            path.push(
                form_urlencoded::Serializer::new(String::new())
                    .append_pair("name", name)
                    .finish(),
            );
        }
        let body = opts.serialize()?;
        let raw = self
            .transport
            .request(Method::POST, &path.join("?"), Payload::Json(body))
            .await
            .map_err(|e| match e {
                Error::Fault { code, .. } if code == StatusCode::NOT_FOUND => {
                    Error::ImageNotFound(opts.image.clone())
                }
                other => other,
            })?;
        let rep: CreateResponse = serde_json::from_str(&raw)?;
        Ok(rep.id)
    }

    /// Start a created container. 304 means it is already running.
    pub async fn start_container(
        &self,
        id: &str,
    ) -> Result<()> {
        self.transport
            .request(
                Method::POST,
                &format!("/containers/{}/start", id),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(())
    }

    /// Stop a running container, waiting up to `timeout` seconds
    pub async fn stop_container(
        &self,
        id: &str,
        timeout: u64,
    ) -> Result<()> {
        self.transport
            .request(
                Method::POST,
                &format!("/containers/{}/stop?t={}", id, timeout),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(())
    }

    /// Restart a container in place
    pub async fn restart_container(
        &self,
        id: &str,
        timeout: u64,
    ) -> Result<()> {
        self.transport
            .request(
                Method::POST,
                &format!("/containers/{}/restart?t={}", id, timeout),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(())
    }

    /// Remove a container. With `force`, a running container is killed first.
    pub async fn remove_container(
        &self,
        id: &str,
        force: bool,
    ) -> Result<()> {
        self.transport
            .request(
                Method::DELETE,
                &format!("/containers/{}?force={}", id, force),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(())
    }

    /// Inspect a container's full state
    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerDetails> {
        let raw = self
            .transport
            .request(
                Method::GET,
                &format!("/containers/{}/json", id),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Fetch a single stats sample for a running container
    pub async fn container_stats(
        &self,
        id: &str,
    ) -> Result<StatsSample> {
        let raw = self
            .transport
            .request(
                Method::GET,
                &format!("/containers/{}/stats?stream=false&one-shot=true", id),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// List the processes running inside a container
    pub async fn container_top(
        &self,
        id: &str,
    ) -> Result<Top> {
        let raw = self
            .transport
            .request(
                Method::GET,
                &format!("/containers/{}/top", id),
                Payload::None,
            )
            .await
            .map_err(|e| container_fault(id, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// List containers, optionally filtered by an engine label
    /// (e.g. `pocketdock.managed=true`)
    pub async fn list_containers(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<ContainerSummaryRep>> {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("all", "true");
        if let Some(label) = label_filter {
            query.append_pair("filters", &json!({ "label": [label] }).to_string());
        }
        let raw = self
            .transport
            .request(
                Method::GET,
                &format!("/containers/json?{}", query.finish()),
                Payload::None,
            )
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    //
    // Archive endpoints
    //

    /// Upload a tar archive, extracting it at `dest_path` in the container
    pub async fn push_archive(
        &self,
        id: &str,
        dest_path: &str,
        tar_bytes: Vec<u8>,
    ) -> Result<()> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("path", dest_path)
            .finish();
        self.transport
            .request(
                Method::PUT,
                &format!("/containers/{}/archive?{}", id, query),
                Payload::Tar(tar_bytes),
            )
            .await
            .map_err(|e| archive_fault(id, dest_path, e))?;
        Ok(())
    }

    /// Download the path at `src_path` in the container as a tar archive
    pub async fn pull_archive(
        &self,
        id: &str,
        src_path: &str,
    ) -> Result<Vec<u8>> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("path", src_path)
            .finish();
        self.transport
            .request_bytes(
                Method::GET,
                &format!("/containers/{}/archive?{}", id, query),
                Payload::None,
            )
            .await
            .map_err(|e| archive_fault(id, src_path, e))
    }

    //
    // Image endpoints
    //

    /// Commit a container's filesystem as a new image, returning the image id
    pub async fn commit_container(
        &self,
        id: &str,
        repo: &str,
        tag: &str,
    ) -> Result<String> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("container", id)
            .append_pair("repo", repo)
            .append_pair("tag", tag)
            .finish();
        let raw = self
            .transport
            .request(Method::POST, &format!("/commit?{}", query), Payload::None)
            .await
            .map_err(|e| container_fault(id, e))?;
        let rep: CreateResponse = serde_json::from_str(&raw)?;
        Ok(rep.id)
    }

    /// Build an image from a directory containing a Dockerfile, yielding
    /// the engine's progress records
    pub fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
    ) -> impl Stream<Item = Result<Value>> + Send + 'static {
        // tar the context before entering the stream so the caller's
        // path does not tie down the stream's lifetime
        let tar_result = tarball::dir_gz(context_dir);
        let transport = self.transport.clone();
        let endpoint = format!(
            "/build?{}",
            form_urlencoded::Serializer::new(String::new())
                .append_pair("t", tag)
                .finish()
        );
        Box::pin(
            async move {
                let context = tar_result?;
                let chunks = transport
                    .stream_chunks(Method::POST, &endpoint, Payload::Tar(context))
                    .await?;
                Ok(Box::pin(chunks).and_then(|chunk| async move {
                    let values = serde_json::Deserializer::from_slice(&chunk)
                        .into_iter::<Value>()
                        .collect::<Vec<_>>();
                    Ok(futures_util::stream::iter(values).map_err(Error::from))
                })
                .try_flatten())
            }
            .try_flatten_stream(),
        )
    }

    /// Export an image to a tarball byte stream
    pub fn save_image(
        &self,
        reference: &str,
    ) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        let transport = self.transport.clone();
        let endpoint = format!("/images/{}/get", reference);
        Box::pin(
            async move {
                let chunks = transport
                    .stream_chunks(Method::GET, &endpoint, Payload::None)
                    .await
                    .map_err(|e| match e {
                        Error::Fault { code, .. } if code == StatusCode::NOT_FOUND => {
                            Error::ImageNotFound(endpoint_image(&endpoint))
                        }
                        other => other,
                    })?;
                Ok(Box::pin(chunks).map_ok(|c| c.to_vec()))
            }
            .try_flatten_stream(),
        )
    }

    /// Load an image from an exported tarball
    pub async fn load_image(
        &self,
        tar_bytes: Vec<u8>,
    ) -> Result<()> {
        self.transport
            .request(Method::POST, "/images/load", Payload::Tar(tar_bytes))
            .await?;
        Ok(())
    }

    /// Pull an image from a registry
    pub async fn create_image(
        &self,
        from_image: &str,
    ) -> Result<()> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("fromImage", from_image)
            .finish();
        self.transport
            .request(
                Method::POST,
                &format!("/images/create?{}", query),
                Payload::None,
            )
            .await
            .map_err(|e| match e {
                Error::Fault { code, .. } if code == StatusCode::NOT_FOUND => {
                    Error::ImageNotFound(from_image.to_owned())
                }
                other => other,
            })?;
        Ok(())
    }

    //
    // Exec endpoints
    //

    /// Create an exec instance, returning its id
    pub async fn exec_create(
        &self,
        container_id: &str,
        cmd: &[String],
        attach_stdin: bool,
    ) -> Result<String> {
        let mut payload = Map::new();
        payload.insert("AttachStdout".to_owned(), json!(true));
        payload.insert("AttachStderr".to_owned(), json!(true));
        payload.insert("Cmd".to_owned(), json!(cmd));
        if attach_stdin {
            payload.insert("AttachStdin".to_owned(), json!(true));
        }
        let body = serde_json::to_vec(&Value::Object(payload))?;
        let raw = self
            .transport
            .request(
                Method::POST,
                &format!("/containers/{}/exec", container_id),
                Payload::Json(body),
            )
            .await
            .map_err(|e| exec_create_fault(container_id, e))?;
        let rep: CreateResponse = serde_json::from_str(&raw)?;
        Ok(rep.id)
    }

    /// Start an exec instance, returning its multiplexed frame stream.
    ///
    /// Both Docker's chunked transfer encoding and Podman's raw stream
    /// arrive here as byte chunks; the decoder reassembles frames across
    /// any chunk boundaries.
    pub fn exec_start(
        &self,
        exec_id: &str,
    ) -> TtyReader {
        let transport = self.transport.clone();
        let endpoint = format!("/exec/{}/start", exec_id);
        Box::pin(
            async move {
                let body = serde_json::to_vec(&json!({ "Detach": false, "Tty": false }))?;
                let chunks = transport
                    .stream_chunks(Method::POST, &endpoint, Payload::Json(body))
                    .await?;
                Ok(tty::decode(Box::pin(chunks)))
            }
            .try_flatten_stream(),
        )
    }

    /// Start an exec instance over an upgraded connection, keeping stdin
    /// writable. Used for shell sessions.
    pub async fn exec_start_attached(
        &self,
        exec_id: &str,
    ) -> Result<Multiplexer> {
        let body = serde_json::to_vec(&json!({ "Detach": false, "Tty": false }))?;
        let io = self
            .transport
            .stream_upgrade(
                Method::POST,
                &format!("/exec/{}/start", exec_id),
                Payload::Json(body),
            )
            .await?;
        Ok(Multiplexer::new(io))
    }

    /// Inspect an exec instance
    pub async fn exec_inspect(
        &self,
        exec_id: &str,
    ) -> Result<ExecDetails> {
        let raw = self
            .transport
            .request(Method::GET, &format!("/exec/{}/json", exec_id), Payload::None)
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Inspect an exec instance for its exit code, defaulting to -1 when
    /// the engine has not recorded one
    pub async fn exec_exit_code(
        &self,
        exec_id: &str,
    ) -> Result<i64> {
        Ok(self.exec_inspect(exec_id).await?.exit_code.unwrap_or(-1))
    }
}

fn endpoint_image(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("/images/")
        .trim_end_matches("/get")
        .to_owned()
}

/// Refine a transport fault into the container-level error taxonomy
fn container_fault(
    id: &str,
    err: Error,
) -> Error {
    match err {
        Error::Fault { code, .. } if code == StatusCode::NOT_FOUND => {
            Error::ContainerNotFound(id.to_owned())
        }
        Error::Fault { code, .. } if code == StatusCode::CONFLICT => {
            Error::ContainerNotRunning(id.to_owned())
        }
        other => other,
    }
}

fn archive_fault(
    id: &str,
    path: &str,
    err: Error,
) -> Error {
    match err {
        Error::Fault { code, .. } if code == StatusCode::NOT_FOUND => {
            Error::FileNotFound(path.to_owned())
        }
        other => container_fault(id, other),
    }
}

fn exec_create_fault(
    id: &str,
    err: Error,
) -> Error {
    match err {
        // Podman reports exec against a stopped container as a 500 with
        // this message rather than a 409
        Error::Fault { code, ref message }
            if code == StatusCode::INTERNAL_SERVER_ERROR
                && message.contains("container state improper") =>
        {
            Error::ContainerNotRunning(id.to_owned())
        }
        other => container_fault(id, other),
    }
}

/// Body of a `POST /containers/create` request
#[derive(Debug, Default)]
pub struct ContainerCreateOptions {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub host_config: Option<Value>,
    pub exposed_ports: Option<Value>,
}

impl ContainerCreateOptions {
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let mut body = Map::new();
        body.insert("Image".to_owned(), json!(self.image));
        if let Some(ref cmd) = self.cmd {
            body.insert("Cmd".to_owned(), json!(cmd));
        }
        if let Some(ref labels) = self.labels {
            body.insert("Labels".to_owned(), json!(labels));
        }
        if let Some(ref host_config) = self.host_config {
            body.insert("HostConfig".to_owned(), host_config.clone());
        }
        if let Some(ref exposed) = self.exposed_ports {
            body.insert("ExposedPorts".to_owned(), exposed.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerDetails {
    pub id: String,
    pub created: String,
    pub state: ContainerState,
    pub config: ContainerConfig,
    pub network_settings: NetworkSettings,
    pub host_config: HostConfigRep,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub started_at: String,
    pub pid: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub image: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfigRep {
    pub memory: Option<u64>,
    pub nano_cpus: Option<u64>,
    pub port_bindings: Option<BTreeMap<String, Vec<BTreeMap<String, String>>>>,
}

/// One element of a `GET /containers/json` listing
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerSummaryRep {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

/// One sample from the stats endpoint. Only the fields the info snapshot
/// derives from are modeled; engines disagree on the rest.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsSample {
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub pids_stats: PidsStats,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total_usage: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    pub current: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Top {
    pub titles: Vec<String>,
    pub processes: Vec<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecDetails {
    pub exit_code: Option<i64>,
    pub pid: i64,
    pub running: bool,
}
