//! Create and drive sandbox containers
//!
//! A [`Container`] is a handle to one engine-side container. It composes
//! exec, file, session, and lifecycle operations onto the engine client,
//! tracks the children it spawns (streams, detached processes, sessions),
//! and tears everything down transactionally on [`shutdown`](Container::shutdown).

use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::try_join;
use serde_json::{json, Map, Value};

use crate::{
    callbacks::CallbackRegistry,
    engine::{
        ContainerCreateOptions, ContainerDetails, Engine, StatsSample, Top,
    },
    errors::{Error, Result},
    exec::{
        exec_command, shape_command, ExecResult, ExecStream, StreamGuard, DEFAULT_MAX_OUTPUT,
    },
    process::{Process, DEFAULT_BUFFER_CAPACITY},
    session::Session,
    tarball, util,
};

/// Image used when none is specified
pub const DEFAULT_IMAGE: &str = "pocketdock/minimal";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const STOP_TIMEOUT_SECS: u64 = 10;

pub(crate) const LABEL_MANAGED: &str = "pocketdock.managed";
pub(crate) const LABEL_INSTANCE: &str = "pocketdock.instance";
pub(crate) const LABEL_PERSIST: &str = "pocketdock.persist";
pub(crate) const LABEL_CREATED_AT: &str = "pocketdock.created-at";
pub(crate) const LABEL_PROJECT: &str = "pocketdock.project";
pub(crate) const LABEL_DATA_PATH: &str = "pocketdock.data-path";

/// Options for creating a sandbox container
#[derive(Clone, Debug)]
pub struct SandboxOptions {
    pub(crate) image: String,
    pub(crate) name: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) mem_limit: Option<String>,
    pub(crate) cpu_percent: Option<u32>,
    pub(crate) persist: bool,
    pub(crate) volumes: BTreeMap<String, String>,
    pub(crate) project: String,
    pub(crate) data_path: String,
    pub(crate) devices: Vec<String>,
    pub(crate) ports: BTreeMap<u32, u32>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxOptions {
            image: DEFAULT_IMAGE.to_owned(),
            name: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            mem_limit: None,
            cpu_percent: None,
            persist: false,
            volumes: BTreeMap::new(),
            project: String::new(),
            data_path: String::new(),
            devices: Vec::new(),
            ports: BTreeMap::new(),
        }
    }
}

impl SandboxOptions {
    /// Return a builder for sandbox options
    pub fn builder() -> SandboxOptionsBuilder {
        SandboxOptionsBuilder::default()
    }
}

/// Builder interface for [`SandboxOptions`]
#[derive(Default)]
pub struct SandboxOptionsBuilder {
    opts: SandboxOptions,
}

impl SandboxOptionsBuilder {
    pub fn image(
        &mut self,
        image: &str,
    ) -> &mut Self {
        self.opts.image = image.to_owned();
        self
    }

    /// Container name. Auto-generated (`pd-<8 hex>`) when not set.
    pub fn name(
        &mut self,
        name: &str,
    ) -> &mut Self {
        self.opts.name = Some(name.to_owned());
        self
    }

    /// Default timeout applied to buffered `run` calls
    pub fn timeout(
        &mut self,
        timeout: Duration,
    ) -> &mut Self {
        self.opts.timeout = timeout;
        self
    }

    /// Memory limit string like `256m` or `1g`, validated at create time
    pub fn mem_limit(
        &mut self,
        limit: &str,
    ) -> &mut Self {
        self.opts.mem_limit = Some(limit.to_owned());
        self
    }

    /// CPU cap as a percentage of one CPU (e.g. `50`)
    pub fn cpu_percent(
        &mut self,
        percent: u32,
    ) -> &mut Self {
        self.opts.cpu_percent = Some(percent);
        self
    }

    /// Keep the engine-side container on shutdown (stop without remove)
    pub fn persist(
        &mut self,
        persist: bool,
    ) -> &mut Self {
        self.opts.persist = persist;
        self
    }

    /// Bind-mount a host path into the container
    pub fn volume(
        &mut self,
        host: &str,
        container: &str,
    ) -> &mut Self {
        self.opts
            .volumes
            .insert(host.to_owned(), container.to_owned());
        self
    }

    pub fn project(
        &mut self,
        project: &str,
    ) -> &mut Self {
        self.opts.project = project.to_owned();
        self
    }

    /// Instance data directory, stamped as a label and removed by
    /// `destroy`. Opaque to this crate otherwise.
    pub fn data_path(
        &mut self,
        data_path: &str,
    ) -> &mut Self {
        self.opts.data_path = data_path.to_owned();
        self
    }

    /// Pass a host device through to the container (`rwm` permissions)
    pub fn device(
        &mut self,
        device: &str,
    ) -> &mut Self {
        self.opts.devices.push(device.to_owned());
        self
    }

    /// Map a host port to a container port
    pub fn port(
        &mut self,
        host: u32,
        container: u32,
    ) -> &mut Self {
        self.opts.ports.insert(host, container);
        self
    }

    pub fn build(&self) -> SandboxOptions {
        self.opts.clone()
    }
}

/// Options controlling a single `run` invocation
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub(crate) stream: bool,
    pub(crate) detach: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_output: usize,
    pub(crate) lang: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            stream: false,
            detach: false,
            timeout: None,
            max_output: DEFAULT_MAX_OUTPUT,
            lang: None,
        }
    }
}

impl RunOptions {
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder::default()
    }
}

/// Builder interface for [`RunOptions`]
#[derive(Default)]
pub struct RunOptionsBuilder {
    opts: RunOptions,
}

impl RunOptionsBuilder {
    /// Yield output incrementally through an [`ExecStream`]
    pub fn stream(
        &mut self,
        stream: bool,
    ) -> &mut Self {
        self.opts.stream = stream;
        self
    }

    /// Run in the background, returning a [`Process`] handle
    pub fn detach(
        &mut self,
        detach: bool,
    ) -> &mut Self {
        self.opts.detach = detach;
        self
    }

    /// Cap on wall-clock time for a buffered run. Elapsing yields an
    /// [`ExecResult`] with `timed_out` set; the exec is left to the
    /// engine and its exit code is not inspected.
    pub fn timeout(
        &mut self,
        timeout: Duration,
    ) -> &mut Self {
        self.opts.timeout = Some(timeout);
        self
    }

    /// Cap on accumulated output bytes before truncation
    pub fn max_output(
        &mut self,
        max_output: usize,
    ) -> &mut Self {
        self.opts.max_output = max_output;
        self
    }

    /// Language shorthand; `"python"` runs through `python3 -c`
    pub fn lang(
        &mut self,
        lang: &str,
    ) -> &mut Self {
        self.opts.lang = Some(lang.to_owned());
        self
    }

    pub fn build(&self) -> RunOptions {
        self.opts.clone()
    }
}

/// The three shapes a `run` can produce
pub enum ExecOutcome {
    Buffered(ExecResult),
    Streamed(ExecStream),
    Detached(Process),
}

impl ExecOutcome {
    pub fn into_result(self) -> Option<ExecResult> {
        match self {
            ExecOutcome::Buffered(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<ExecStream> {
        match self {
            ExecOutcome::Streamed(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn into_process(self) -> Option<Process> {
        match self {
            ExecOutcome::Detached(process) => Some(process),
            _ => None,
        }
    }
}

/// Live snapshot of a container's state and resource usage
#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<chrono::Duration>,
    pub memory_usage: String,
    pub memory_limit: String,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub pids: u64,
    pub network: bool,
    pub ip_address: String,
    pub processes: Vec<BTreeMap<String, String>>,
    pub ports: BTreeMap<u32, u32>,
}

#[derive(Default)]
struct Children {
    sessions: Vec<Session>,
    processes: Vec<Process>,
    streams: Vec<StreamGuard>,
}

/// Handle to a running sandbox container
pub struct Container {
    engine: Engine,
    id: Mutex<String>,
    name: String,
    image: String,
    timeout: Duration,
    mem_limit_bytes: u64,
    nano_cpus: u64,
    persist: bool,
    project: String,
    data_path: String,
    ports: BTreeMap<u32, u32>,
    callbacks: Arc<CallbackRegistry>,
    children: Mutex<Children>,
    closed: AtomicBool,
}

impl Container {
    /// Create and start a new container on the engine
    pub async fn create(
        engine: &Engine,
        opts: &SandboxOptions,
    ) -> Result<Container> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(util::generate_name);
        let mem_limit_bytes = match opts.mem_limit {
            Some(ref limit) => util::parse_mem_limit(limit)?,
            None => 0,
        };
        let nano_cpus = opts
            .cpu_percent
            .map(|pct| u64::from(pct) * 10_000_000)
            .unwrap_or(0);

        let labels = build_labels(&name, opts.persist, &opts.project, &opts.data_path);
        let host_config = build_host_config(
            mem_limit_bytes,
            nano_cpus,
            &opts.volumes,
            &opts.devices,
            &opts.ports,
        );
        let exposed_ports = if opts.ports.is_empty() {
            None
        } else {
            Some(util::build_exposed_ports(&opts.ports))
        };

        let create = ContainerCreateOptions {
            image: opts.image.clone(),
            name: Some(name.clone()),
            cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
            labels: Some(labels),
            host_config,
            exposed_ports,
        };
        let id = engine.create_container(&create).await?;
        engine.start_container(&id).await?;

        Ok(Container::from_parts(
            engine.clone(),
            id,
            name,
            opts.image.clone(),
            opts.timeout,
            mem_limit_bytes,
            nano_cpus,
            opts.persist,
            opts.project.clone(),
            opts.data_path.clone(),
            opts.ports.clone(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        engine: Engine,
        id: String,
        name: String,
        image: String,
        timeout: Duration,
        mem_limit_bytes: u64,
        nano_cpus: u64,
        persist: bool,
        project: String,
        data_path: String,
        ports: BTreeMap<u32, u32>,
    ) -> Container {
        Container {
            engine,
            id: Mutex::new(id),
            name,
            image,
            timeout,
            mem_limit_bytes,
            nano_cpus,
            persist,
            project,
            data_path,
            ports,
            callbacks: Arc::new(CallbackRegistry::default()),
            children: Mutex::new(Children::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// The engine-assigned container id (full hex)
    pub fn id(&self) -> String {
        self.id.lock().unwrap().clone()
    }

    fn current_id(&self) -> String {
        self.id.lock().unwrap().clone()
    }

    /// The container name (e.g. `pd-a1b2c3d4`)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Whether shutdown stops without removing
    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn data_path(&self) -> &str {
        &self.data_path
    }

    /// Declared host-to-container port bindings
    pub fn ports(&self) -> &BTreeMap<u32, u32> {
        &self.ports
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ContainerClosed)
        } else {
            Ok(())
        }
    }

    /// Execute a command inside the container.
    ///
    /// `stream` and `detach` in the options select the outcome shape;
    /// setting both is invalid input.
    pub async fn run(
        &self,
        command: &str,
        opts: &RunOptions,
    ) -> Result<ExecOutcome> {
        if opts.stream && opts.detach {
            return Err(Error::InvalidParameter(
                "stream and detach are mutually exclusive".to_owned(),
            ));
        }

        let cmd = shape_command(command, opts.lang.as_deref());
        let id = self.current_id();

        if opts.stream {
            // no new children once shutdown has started
            self.ensure_open()?;
            let exec_id = self.engine.exec_create(&id, &cmd, false).await?;
            let frames = self.engine.exec_start(&exec_id);
            let guard = StreamGuard::default();
            let stream = ExecStream::new(self.engine.clone(), exec_id, frames, guard.clone());
            self.children.lock().unwrap().streams.push(guard);
            return Ok(ExecOutcome::Streamed(stream));
        }

        if opts.detach {
            self.ensure_open()?;
            let exec_id = self.engine.exec_create(&id, &cmd, false).await?;
            let frames = self.engine.exec_start(&exec_id);
            let process = Process::spawn(
                self.engine.clone(),
                id,
                exec_id,
                frames,
                self.callbacks.clone(),
                DEFAULT_BUFFER_CAPACITY,
            );
            self.children.lock().unwrap().processes.push(process.clone());
            return Ok(ExecOutcome::Detached(process));
        }

        let timeout = opts.timeout.unwrap_or(self.timeout);
        let result = exec_command(&self.engine, &id, cmd, opts.max_output, Some(timeout)).await?;
        Ok(ExecOutcome::Buffered(result))
    }

    /// Convenience wrapper: buffered run with default options
    pub async fn exec(
        &self,
        command: &str,
    ) -> Result<ExecResult> {
        let cmd = shape_command(command, None);
        exec_command(
            &self.engine,
            &self.current_id(),
            cmd,
            DEFAULT_MAX_OUTPUT,
            Some(self.timeout),
        )
        .await
    }

    /// Return a live snapshot of state and resource usage.
    ///
    /// Stats and process listings are fetched concurrently and only while
    /// running; a container stopping mid-call yields a snapshot with
    /// empty stats fields rather than an error.
    pub async fn info(&self) -> Result<ContainerInfo> {
        let id = self.current_id();
        let details = self.engine.inspect_container(&id).await?;

        let (stats, top) = if details.state.running {
            match try_join(
                self.engine.container_stats(&id),
                self.engine.container_top(&id),
            )
            .await
            {
                Ok((stats, top)) => (Some(stats), Some(top)),
                Err(Error::ContainerNotRunning(_)) | Err(Error::ContainerNotFound(_)) => {
                    (None, None)
                }
                Err(e) => return Err(e),
            }
        } else {
            (None, None)
        };

        Ok(build_info(
            &details,
            stats.as_ref(),
            top.as_ref(),
            &self.name,
            &self.ports,
        ))
    }

    /// Restart the container.
    ///
    /// With `fresh` unset this is an in-place engine restart: the
    /// filesystem is preserved, processes are killed. With `fresh` set
    /// the container is removed and re-created from the same image,
    /// labels, and host config; the handle's id is updated in place.
    pub async fn reboot(
        &self,
        fresh: bool,
    ) -> Result<()> {
        let id = self.current_id();
        if !fresh {
            return self.engine.restart_container(&id, STOP_TIMEOUT_SECS).await;
        }

        ignore_gone(self.engine.stop_container(&id, STOP_TIMEOUT_SECS).await)?;
        match self.engine.remove_container(&id, true).await {
            Err(Error::ContainerNotFound(_)) => {}
            other => other?,
        }

        let labels = build_labels(&self.name, self.persist, &self.project, &self.data_path);
        let host_config = build_host_config(
            self.mem_limit_bytes,
            self.nano_cpus,
            &BTreeMap::new(),
            &[],
            &self.ports,
        );
        let exposed_ports = if self.ports.is_empty() {
            None
        } else {
            Some(util::build_exposed_ports(&self.ports))
        };
        let create = ContainerCreateOptions {
            image: self.image.clone(),
            name: Some(self.name.clone()),
            cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
            labels: Some(labels),
            host_config,
            exposed_ports,
        };
        let new_id = self.engine.create_container(&create).await?;
        self.engine.start_container(&new_id).await?;
        *self.id.lock().unwrap() = new_id;
        Ok(())
    }

    /// Write a file into the container, creating parent directories
    pub async fn write_file(
        &self,
        path: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<()> {
        let data = content.as_ref();
        let (dir, file_name) = split_container_path(path);

        // the archive endpoint 404s on a missing destination directory
        let mkdir = shape_command(&format!("mkdir -p {}", dir), None);
        let id = self.current_id();
        exec_command(
            &self.engine,
            &id,
            mkdir,
            DEFAULT_MAX_OUTPUT,
            Some(self.timeout),
        )
        .await?;

        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        archive.append_data(&mut header, &file_name, data)?;
        let bytes = archive.into_inner()?;

        self.engine.push_archive(&id, &dir, bytes).await
    }

    /// Read a file from the container
    pub async fn read_file(
        &self,
        path: &str,
    ) -> Result<Vec<u8>> {
        let tar_bytes = self
            .engine
            .pull_archive(&self.current_id(), path)
            .await?;
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }
        Err(Error::FileNotFound(path.to_owned()))
    }

    /// List a directory inside the container, without `.` and `..`
    pub async fn list_files(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        let cmd = shape_command(&format!("ls -1a {}", path), None);
        let result = exec_command(
            &self.engine,
            &self.current_id(),
            cmd,
            DEFAULT_MAX_OUTPUT,
            Some(self.timeout),
        )
        .await?;
        if !result.ok() {
            return Err(Error::FileNotFound(format!(
                "{}: {}",
                path,
                result.stderr.trim()
            )));
        }
        Ok(result
            .stdout
            .lines()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .map(str::to_owned)
            .collect())
    }

    /// Copy a host file or directory into the container.
    ///
    /// Ownership is normalized (root, 0755/0644) so extracted content
    /// does not carry host uids into the container.
    pub async fn push(
        &self,
        src: impl AsRef<Path>,
        dest: &str,
    ) -> Result<()> {
        let src = src.as_ref();
        if !src.exists() {
            return Err(Error::FileNotFound(src.display().to_string()));
        }
        let (dir, arcname) = split_container_path(dest);
        let bytes = tarball::bundle(src, &arcname)?;
        self.engine
            .push_archive(&self.current_id(), &dir, bytes)
            .await
    }

    /// Copy a container path to the host. A single file lands at `dest`;
    /// anything else is extracted as a tree under `dest`.
    pub async fn pull(
        &self,
        src: &str,
        dest: impl AsRef<Path>,
    ) -> Result<()> {
        let tar_bytes = self
            .engine
            .pull_archive(&self.current_id(), src)
            .await?;
        let dest = dest.as_ref();

        let mut entry_count = 0usize;
        let mut file_count = 0usize;
        {
            let mut archive = tar::Archive::new(&tar_bytes[..]);
            for entry in archive.entries()? {
                let entry = entry?;
                entry_count += 1;
                if entry.header().entry_type().is_file() {
                    file_count += 1;
                }
            }
        }

        if entry_count == 1 && file_count == 1 {
            let mut archive = tar::Archive::new(&tar_bytes[..]);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    if let Some(parent) = dest.parent() {
                        if !parent.as_os_str().is_empty() {
                            fs::create_dir_all(parent)?;
                        }
                    }
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    fs::write(dest, data)?;
                    return Ok(());
                }
            }
        }

        fs::create_dir_all(dest)?;
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        archive.unpack(dest)?;
        Ok(())
    }

    /// Open a persistent shell session inside the container.
    ///
    /// Commands sent through the session share state (cwd, env vars)
    /// because they run in one bash process.
    pub async fn session(&self) -> Result<Session> {
        self.ensure_open()?;
        let id = self.current_id();
        let exec_id = self
            .engine
            .exec_create(&id, &["bash".to_owned()], true)
            .await?;
        let multiplexer = self.engine.exec_start_attached(&exec_id).await?;
        let session = Session::spawn(exec_id, multiplexer);
        self.children
            .lock()
            .unwrap()
            .sessions
            .push(session.clone());
        Ok(session)
    }

    /// Commit the container's filesystem as a new image.
    ///
    /// The tag defaults to `latest` when `image_name` carries none.
    pub async fn snapshot(
        &self,
        image_name: &str,
    ) -> Result<String> {
        let (repo, tag) = split_image_ref(image_name);
        self.engine
            .commit_container(&self.current_id(), repo, tag)
            .await
    }

    /// Register a callback for stdout data from detached processes
    pub fn on_stdout<F>(
        &self,
        f: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_stdout(f);
    }

    /// Register a callback for stderr data from detached processes
    pub fn on_stderr<F>(
        &self,
        f: F,
    ) where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_stderr(f);
    }

    /// Register a callback for detached process exit
    pub fn on_exit<F>(
        &self,
        f: F,
    ) where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.callbacks.on_exit(f);
    }

    /// Tear the container down. Idempotent; the second call is a no-op.
    ///
    /// Every registered session, stream, and detached process is closed
    /// first (errors suppressed). Engine teardown then follows policy:
    /// persistent containers are stopped but kept, `force` removes
    /// immediately, and the default stops then removes, tolerating
    /// containers that are already gone.
    pub async fn shutdown(
        &self,
        force: bool,
    ) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let children = {
            let mut children = self.children.lock().unwrap();
            std::mem::replace(&mut *children, Children::default())
        };
        for session in children.sessions {
            let _ = session.close().await;
        }
        for guard in children.streams {
            guard.close();
        }
        for process in children.processes {
            process.cancel();
        }

        let id = self.current_id();
        if self.persist {
            ignore_gone(self.engine.stop_container(&id, STOP_TIMEOUT_SECS).await)?;
        } else if force {
            self.engine.remove_container(&id, true).await?;
        } else {
            ignore_gone(self.engine.stop_container(&id, STOP_TIMEOUT_SECS).await)?;
            match self.engine.remove_container(&id, true).await {
                Err(Error::ContainerNotFound(_)) => {}
                other => other?,
            }
        }
        Ok(())
    }
}

fn ignore_gone(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::ContainerNotRunning(_)) | Err(Error::ContainerNotFound(_)) => Ok(()),
        other => other,
    }
}

pub(crate) fn build_labels(
    name: &str,
    persist: bool,
    project: &str,
    data_path: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED.to_owned(), "true".to_owned());
    labels.insert(LABEL_INSTANCE.to_owned(), name.to_owned());
    labels.insert(LABEL_PERSIST.to_owned(), persist.to_string());
    labels.insert(LABEL_CREATED_AT.to_owned(), Utc::now().to_rfc3339());
    if !project.is_empty() {
        labels.insert(LABEL_PROJECT.to_owned(), project.to_owned());
    }
    if !data_path.is_empty() {
        labels.insert(LABEL_DATA_PATH.to_owned(), data_path.to_owned());
    }
    labels
}

fn build_host_config(
    mem_limit_bytes: u64,
    nano_cpus: u64,
    volumes: &BTreeMap<String, String>,
    devices: &[String],
    ports: &BTreeMap<u32, u32>,
) -> Option<Value> {
    let mut host_config = Map::new();
    if mem_limit_bytes > 0 {
        host_config.insert("Memory".to_owned(), json!(mem_limit_bytes));
    }
    if nano_cpus > 0 {
        host_config.insert("NanoCpus".to_owned(), json!(nano_cpus));
    }
    if !volumes.is_empty() {
        let binds: Vec<String> = volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect();
        host_config.insert("Binds".to_owned(), json!(binds));
    }
    if !devices.is_empty() {
        let devices: Vec<Value> = devices
            .iter()
            .map(|device| {
                json!({
                    "PathOnHost": device,
                    "PathInContainer": device,
                    "CgroupPermissions": "rwm",
                })
            })
            .collect();
        host_config.insert("Devices".to_owned(), json!(devices));
    }
    if !ports.is_empty() {
        host_config.insert("PortBindings".to_owned(), util::build_port_bindings(ports));
    }
    if host_config.is_empty() {
        None
    } else {
        Some(Value::Object(host_config))
    }
}

/// Split a container path into (parent directory, base name)
fn split_container_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_owned(), trimmed[1..].to_owned()),
        Some(idx) => (trimmed[..idx].to_owned(), trimmed[idx + 1..].to_owned()),
        None => (".".to_owned(), trimmed.to_owned()),
    }
}

/// Split `repo[:tag]`, defaulting the tag to `latest`. A colon inside a
/// registry host (`localhost:5000/img`) is not a tag separator.
fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn build_info(
    details: &ContainerDetails,
    stats: Option<&StatsSample>,
    top: Option<&Top>,
    name: &str,
    ports: &BTreeMap<u32, u32>,
) -> ContainerInfo {
    let status = if details.state.status.is_empty() {
        "unknown".to_owned()
    } else {
        details.state.status.clone()
    };

    let started_at = match details.state.started_at.as_str() {
        "" | "0001-01-01T00:00:00Z" => None,
        other => parse_timestamp(other),
    };
    let uptime = match (status.as_str(), started_at) {
        ("running", Some(started)) => Some(Utc::now() - started),
        _ => None,
    };

    let (memory_usage, memory_limit, memory_percent) = match stats {
        Some(stats) => {
            let usage = stats.memory_stats.usage;
            let limit = stats.memory_stats.limit;
            let percent = if limit > 0 {
                round2(usage as f64 / limit as f64 * 100.0)
            } else {
                0.0
            };
            (
                util::format_bytes(usage),
                util::format_bytes(limit),
                percent,
            )
        }
        None => (String::new(), String::new(), 0.0),
    };

    let processes = match top {
        Some(top) => top
            .processes
            .iter()
            .map(|process| {
                top.titles
                    .iter()
                    .zip(process.iter())
                    .map(|(title, value)| (title.clone(), value.clone()))
                    .collect()
            })
            .collect(),
        None => Vec::new(),
    };

    let ip_address = details.network_settings.ip_address.clone();

    ContainerInfo {
        id: details.id.clone(),
        name: name.to_owned(),
        status,
        image: details.config.image.clone(),
        created_at: parse_timestamp(&details.created),
        started_at,
        uptime,
        memory_usage,
        memory_limit,
        memory_percent,
        cpu_percent: stats.map(util::compute_cpu_percent).unwrap_or(0.0),
        pids: stats.map(|s| s.pids_stats.current).unwrap_or(0),
        network: !ip_address.is_empty(),
        ip_address,
        processes,
        ports: ports.clone(),
    }
}
