//! Label-based discovery of managed containers
//!
//! Every container this crate creates is stamped with engine labels
//! (`pocketdock.managed`, `pocketdock.instance`, ...). These queries are
//! the only registry: resuming, listing, and pruning all go through the
//! engine's label filters, never a process-side table.

use std::{fs, path::Path, time::Duration};

use crate::{
    container::{
        Container, LABEL_CREATED_AT, LABEL_DATA_PATH, LABEL_INSTANCE, LABEL_MANAGED,
        LABEL_PERSIST, LABEL_PROJECT,
    },
    engine::{ContainerSummaryRep, Engine},
    errors::{Error, Result},
    util,
};

const DEFAULT_RESUME_TIMEOUT_SECS: u64 = 30;
const STOP_TIMEOUT_SECS: u64 = 10;

/// Compact listing entry for a managed container
#[derive(Clone, Debug)]
pub struct ContainerSummary {
    /// Short id (12 hex chars)
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub created_at: String,
    pub persist: bool,
    pub project: String,
}

async fn find_by_name(
    engine: &Engine,
    name: &str,
) -> Result<ContainerSummaryRep> {
    let filter = format!("{}={}", LABEL_INSTANCE, name);
    engine
        .list_containers(Some(&filter))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::ContainerNotFound(name.to_owned()))
}

/// Resume a stopped persistent container by name.
///
/// The container is started if needed, and its image, resource limits,
/// labels, and port bindings are recovered from the engine to rebuild a
/// [`Container`] handle around the surviving container id.
pub async fn resume(
    engine: &Engine,
    name: &str,
    timeout: Option<Duration>,
) -> Result<Container> {
    let found = find_by_name(engine, name).await?;

    if !found.state.eq_ignore_ascii_case("running") {
        engine.start_container(&found.id).await?;
    }

    let details = engine.inspect_container(&found.id).await?;
    let labels = &details.config.labels;
    let persist = labels
        .get(LABEL_PERSIST)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let project = labels.get(LABEL_PROJECT).cloned().unwrap_or_default();
    let data_path = labels.get(LABEL_DATA_PATH).cloned().unwrap_or_default();
    let ports = util::parse_port_bindings(&details.host_config);

    Ok(Container::from_parts(
        engine.clone(),
        found.id,
        name.to_owned(),
        details.config.image.clone(),
        timeout.unwrap_or_else(|| Duration::from_secs(DEFAULT_RESUME_TIMEOUT_SECS)),
        details.host_config.memory.unwrap_or(0),
        details.host_config.nano_cpus.unwrap_or(0),
        persist,
        project,
        data_path,
        ports,
    ))
}

/// List managed containers, optionally narrowed to one project
pub async fn list(
    engine: &Engine,
    project: Option<&str>,
) -> Result<Vec<ContainerSummary>> {
    let filter = match project {
        Some(project) => format!("{}={}", LABEL_PROJECT, project),
        None => format!("{}=true", LABEL_MANAGED),
    };
    let raw = engine.list_containers(Some(&filter)).await?;
    Ok(raw.iter().map(parse_summary).collect())
}

/// Remove a container completely, running or not.
///
/// When the container carries a data-path label, that directory is
/// removed from the host filesystem after the engine remove succeeds.
pub async fn destroy(
    engine: &Engine,
    name: &str,
) -> Result<()> {
    let found = find_by_name(engine, name).await?;

    let details = engine.inspect_container(&found.id).await?;
    let data_path = details
        .config
        .labels
        .get(LABEL_DATA_PATH)
        .cloned()
        .unwrap_or_default();

    engine.remove_container(&found.id, true).await?;

    if !data_path.is_empty() {
        let dir = Path::new(&data_path);
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
    }
    Ok(())
}

/// Force-remove every managed container that is not running.
/// Returns the number removed.
pub async fn prune(
    engine: &Engine,
    project: Option<&str>,
) -> Result<usize> {
    let filter = match project {
        Some(project) => format!("{}={}", LABEL_PROJECT, project),
        None => format!("{}=true", LABEL_MANAGED),
    };
    let raw = engine.list_containers(Some(&filter)).await?;
    let mut removed = 0;
    for container in raw {
        if !container.state.eq_ignore_ascii_case("running") {
            engine.remove_container(&container.id, true).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Stop a running container by name without removing it
pub async fn stop(
    engine: &Engine,
    name: &str,
) -> Result<()> {
    let found = find_by_name(engine, name).await?;
    engine.stop_container(&found.id, STOP_TIMEOUT_SECS).await
}

fn parse_summary(rep: &ContainerSummaryRep) -> ContainerSummary {
    let mut name = rep.labels.get(LABEL_INSTANCE).cloned().unwrap_or_default();
    if name.is_empty() {
        // Docker prefixes names with "/"; Podman does not
        if let Some(first) = rep.names.first() {
            name = first.trim_start_matches('/').to_owned();
        }
    }
    let status = if rep.state.is_empty() {
        "unknown".to_owned()
    } else {
        rep.state.clone()
    };
    ContainerSummary {
        id: rep.id.chars().take(12).collect(),
        name,
        status,
        image: rep.image.clone(),
        created_at: rep
            .labels
            .get(LABEL_CREATED_AT)
            .cloned()
            .unwrap_or_default(),
        persist: rep
            .labels
            .get(LABEL_PERSIST)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        project: rep.labels.get(LABEL_PROJECT).cloned().unwrap_or_default(),
    }
}
