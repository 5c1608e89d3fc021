//! Path resolution for run workdirs
//!
//! # Environment Variables
//!
//! - `TESTRUN_WORKDIR_ROOT` - Override the directory holding run workdirs
//!
//! Runs live in `<root>/run-NNN`. A run id given on the command line is
//! either such a name, resolved against the root, or a path to a workdir.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable for the workdir root override
pub const ENV_WORKDIR_ROOT: &str = "TESTRUN_WORKDIR_ROOT";

pub const DEFAULT_WORKDIR_ROOT: &str = "/var/tmp/testrun";

const RUN_PREFIX: &str = "run-";

/// Get the directory holding all run workdirs
pub fn workdir_root() -> PathBuf {
    match std::env::var(ENV_WORKDIR_ROOT) {
        Ok(dir) if !dir.is_empty() => {
            let path = expand_path(&dir);
            log::debug!("Using workdir root from {}: {}", ENV_WORKDIR_ROOT, path.display());
            path
        }
        _ => PathBuf::from(DEFAULT_WORKDIR_ROOT),
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

/// Resolve a run id or workdir path
pub fn resolve_run(root: &Path, id: &str) -> PathBuf {
    if id.contains(std::path::MAIN_SEPARATOR) || id.starts_with('~') {
        expand_path(id)
    } else {
        root.join(id)
    }
}

fn run_number(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(RUN_PREFIX)?
        .parse()
        .ok()
}

fn run_workdirs(root: &Path) -> Result<Vec<(u32, PathBuf)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<(u32, PathBuf)> = fs::read_dir(root)
        .with_context(|| format!("Could not read {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| run_number(&path).map(|number| (number, path)))
        .collect();
    runs.sort();
    Ok(runs)
}

/// Every run workdir under `root`, oldest first
pub fn all_runs(root: &Path) -> Result<Vec<PathBuf>> {
    Ok(run_workdirs(root)?.into_iter().map(|(_, path)| path).collect())
}

/// The most recent run workdir, if any
pub fn latest_run(root: &Path) -> Result<Option<PathBuf>> {
    Ok(run_workdirs(root)?.pop().map(|(_, path)| path))
}

/// Path for a new run, `run-NNN` numbered after the latest one
pub fn next_run(root: &Path) -> Result<PathBuf> {
    let next = run_workdirs(root)?
        .last()
        .map_or(1, |(number, _)| number + 1);
    Ok(root.join(format!("{RUN_PREFIX}{next:03}")))
}

/// Directory for SSH control sockets
///
/// Socket paths are length limited, so prefer the short runtime directory
/// over the run workdir.
pub fn socket_dir(run_workdir: &Path) -> PathBuf {
    dirs::runtime_dir().map_or_else(|| run_workdir.join("ssh-sockets"), |dir| dir.join("testrun"))
}
