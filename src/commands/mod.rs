pub mod clean;
pub mod run;
pub mod status;

use anyhow::Result;
use std::path::PathBuf;

use crate::cli::IdArgs;
use crate::paths;

/// Workdir of an existing run: the given id, else the latest run
pub(crate) fn existing_run(args: &IdArgs) -> Result<PathBuf> {
    let root = paths::workdir_root();
    let workdir = match &args.id {
        Some(id) => paths::resolve_run(&root, id),
        None => paths::latest_run(&root)?
            .ok_or_else(|| anyhow::anyhow!("No runs found in {}", root.display()))?,
    };
    if !workdir.exists() {
        anyhow::bail!("Run workdir {} does not exist", workdir.display());
    }
    Ok(workdir)
}
