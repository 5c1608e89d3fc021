use anyhow::{Context as _, Result};
use guestkit::SshConfig;
use pipeline::StepWorkdir;
use std::fs;
use std::path::Path;

use crate::Context;
use crate::cli::IdArgs;
use crate::paths;
use crate::plugins::provision::guest_from_record;
use crate::ui;

/// Stop guests saved in the run workdir, leaving remote hosts alone.
fn stop_guests(ctx: &Context, workdir: &Path) -> Result<usize> {
    let records = StepWorkdir::create(workdir, pipeline::provision::STEP_NAME)?.load_guests()?;
    let ssh = SshConfig::new(paths::socket_dir(workdir), workdir);
    let logger = ctx.logger("clean");

    for (name, record) in &records {
        let guest = guest_from_record(name, record, &ssh, &logger.descend(name.as_str()))?;
        guest.stop()?;
        guest.remove()?;
        ui::dim(&format!("Stopped guest {}", guest.full_name()));
    }
    Ok(records.len())
}

pub fn run(ctx: &Context, args: IdArgs) -> Result<()> {
    let workdir = super::existing_run(&args)?;

    let stopped = stop_guests(ctx, &workdir)?;
    fs::remove_dir_all(&workdir)
        .with_context(|| format!("Could not remove {}", workdir.display()))?;

    ui::success(&format!(
        "Removed {} ({stopped} guest(s) stopped)",
        workdir.display()
    ));
    Ok(())
}
